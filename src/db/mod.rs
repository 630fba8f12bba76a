//! SQLite backend for policies and the request log.
//!
//! [`SqliteStore`] implements [`PolicyStore`], [`RequestCounter`] and
//! [`RequestLogWriter`] over one connection pool, so the resolver and the
//! recorder middleware can share a single database.
//!
//! The schema is created by versioned migrations kept in code and tracked in
//! a `migrations` table. Migrations are applied when the store connects.

pub mod queries;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::Result;
use crate::ratelimit::{
    best_endpoint_match, CounterScope, EndpointLimitPolicy, MethodMatch, PathPattern, PolicySet,
    PolicyStore, RequestCounter, RequestLogEntry, RequestLogWriter, Role, RoleLimitPolicy,
    UserLimitPolicy, WindowCount,
};

/// A schema migration: a version, a name, and the statements it runs.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub statements: &'static [&'static str],
}

/// All migrations, in the order they are applied.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "policy_tables",
        statements: &[
            "CREATE TABLE IF NOT EXISTS role_rate_limits (
                role TEXT PRIMARY KEY,
                request_limit INTEGER NOT NULL,
                window_secs INTEGER NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS user_rate_limits (
                user_id TEXT PRIMARY KEY,
                request_limit INTEGER NOT NULL,
                window_secs INTEGER NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS endpoint_rate_limits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL DEFAULT '*',
                request_limit INTEGER NOT NULL,
                window_secs INTEGER NOT NULL,
                UNIQUE (endpoint, method)
            )",
        ],
    },
    Migration {
        version: 2,
        name: "request_logs",
        statements: &[
            "CREATE TABLE IF NOT EXISTS request_logs (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                role TEXT,
                path TEXT NOT NULL,
                method TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_request_logs_user_time
                ON request_logs (user_id, timestamp_ms)",
            "CREATE INDEX IF NOT EXISTS idx_request_logs_role_time
                ON request_logs (role, timestamp_ms)",
            "CREATE INDEX IF NOT EXISTS idx_request_logs_time
                ON request_logs (timestamp_ms)",
        ],
    },
];

/// Policy store and request log backed by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`, creating the file if needed, and migrate.
    ///
    /// In-memory URLs get a single pinned connection so every query sees the
    /// same database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!(url = %database_url, "Opening rate limit database");

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new();
        if database_url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        sqlx::query("SELECT 1").execute(&pool).await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply every migration not yet recorded in the `migrations` table.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        let applied = self.applied_migrations().await?;

        for migration in MIGRATIONS.iter().filter(|m| !applied.contains(&m.version)) {
            info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );

            let mut tx = self.pool.begin().await?;
            for statement in migration.statements {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            sqlx::query("INSERT INTO migrations (version, name) VALUES (?, ?)")
                .bind(migration.version)
                .bind(migration.name)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }

        Ok(())
    }

    /// Versions of the migrations already applied, ascending.
    pub async fn applied_migrations(&self) -> Result<Vec<i64>> {
        let versions = sqlx::query_scalar("SELECT version FROM migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        Ok(versions)
    }

    pub async fn upsert_role_policy(&self, policy: &RoleLimitPolicy) -> Result<()> {
        queries::upsert_role_policy(&self.pool, policy).await
    }

    pub async fn upsert_user_policy(&self, policy: &UserLimitPolicy) -> Result<()> {
        queries::upsert_user_policy(&self.pool, policy).await
    }

    pub async fn upsert_endpoint_policy(&self, policy: &EndpointLimitPolicy) -> Result<()> {
        queries::upsert_endpoint_policy(&self.pool, policy).await
    }

    pub async fn remove_role_policy(&self, role: &Role) -> Result<bool> {
        queries::delete_role_policy(&self.pool, role).await
    }

    pub async fn remove_user_policy(&self, user_id: &str) -> Result<bool> {
        queries::delete_user_policy(&self.pool, user_id).await
    }

    pub async fn remove_endpoint_policy(
        &self,
        endpoint: &PathPattern,
        method: &MethodMatch,
    ) -> Result<bool> {
        queries::delete_endpoint_policy(&self.pool, endpoint, method).await
    }

    /// Upsert every policy in `policies`. Existing rows not in the set are kept.
    pub async fn import_policies(&self, policies: &PolicySet) -> Result<()> {
        for policy in &policies.roles {
            self.upsert_role_policy(policy).await?;
        }
        for policy in &policies.users {
            self.upsert_user_policy(policy).await?;
        }
        for policy in &policies.endpoints {
            self.upsert_endpoint_policy(policy).await?;
        }

        info!(
            roles = policies.roles.len(),
            users = policies.users.len(),
            endpoints = policies.endpoints.len(),
            "Imported rate limit policies"
        );
        Ok(())
    }

    /// Every stored policy, enabled or not.
    pub async fn load_policies(&self) -> Result<PolicySet> {
        Ok(PolicySet {
            roles: queries::fetch_all_role_policies(&self.pool).await?,
            users: queries::fetch_all_user_policies(&self.pool).await?,
            endpoints: queries::fetch_all_endpoint_policies(&self.pool).await?,
        })
    }

    pub async fn request_log_len(&self) -> Result<u64> {
        queries::count_all_request_logs(&self.pool).await
    }
}

#[async_trait]
impl PolicyStore for SqliteStore {
    async fn find_endpoint_policy(
        &self,
        path: &str,
        method: &str,
    ) -> Result<Option<EndpointLimitPolicy>> {
        let policies = queries::fetch_all_endpoint_policies(&self.pool).await?;
        Ok(best_endpoint_match(&policies, path, method).cloned())
    }

    async fn find_user_policy(&self, user_id: &str) -> Result<Option<UserLimitPolicy>> {
        queries::fetch_enabled_user_policy(&self.pool, user_id).await
    }

    async fn find_role_policy(&self, role: &Role) -> Result<Option<RoleLimitPolicy>> {
        queries::fetch_enabled_role_policy(&self.pool, role).await
    }
}

#[async_trait]
impl RequestCounter for SqliteStore {
    async fn count(
        &self,
        scope: &CounterScope,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<WindowCount> {
        queries::count_requests(&self.pool, scope, since, until).await
    }
}

#[async_trait]
impl RequestLogWriter for SqliteStore {
    async fn append(&self, entry: RequestLogEntry) -> Result<()> {
        queries::insert_request_log(&self.pool, &entry).await
    }

    async fn prune_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let removed = queries::delete_request_logs_before(&self.pool, before).await?;
        debug!(removed, before = %before, "Pruned request log");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn endpoint(pattern: &str, method: &str, limit: u64) -> EndpointLimitPolicy {
        EndpointLimitPolicy {
            endpoint: PathPattern::parse(pattern).unwrap(),
            method: MethodMatch::try_from(method.to_string()).unwrap(),
            limit,
            window_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let store = memory_store().await;
        store.migrate().await.unwrap();

        let applied = store.applied_migrations().await.unwrap();
        assert_eq!(applied, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_role_and_user_lookups_respect_enabled() {
        let store = memory_store().await;
        store
            .upsert_role_policy(&RoleLimitPolicy {
                role: Role::Manager,
                limit: 300,
                window_secs: 60,
                enabled: true,
            })
            .await
            .unwrap();
        store
            .upsert_user_policy(&UserLimitPolicy {
                user_id: "u-1".to_string(),
                limit: 10,
                window_secs: 60,
                enabled: false,
            })
            .await
            .unwrap();

        let role = store.find_role_policy(&Role::Manager).await.unwrap();
        assert_eq!(role.map(|p| p.limit), Some(300));
        assert!(store.find_role_policy(&Role::Admin).await.unwrap().is_none());
        assert!(store.find_user_policy("u-1").await.unwrap().is_none());

        let all = store.load_policies().await.unwrap();
        assert_eq!(all.users.len(), 1);
        assert!(!all.users[0].enabled);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let store = memory_store().await;
        let mut policy = UserLimitPolicy {
            user_id: "u-2".to_string(),
            limit: 10,
            window_secs: 60,
            enabled: true,
        };
        store.upsert_user_policy(&policy).await.unwrap();
        policy.limit = 25;
        store.upsert_user_policy(&policy).await.unwrap();

        let found = store.find_user_policy("u-2").await.unwrap().unwrap();
        assert_eq!(found.limit, 25);

        assert!(store.remove_user_policy("u-2").await.unwrap());
        assert!(!store.remove_user_policy("u-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_endpoint_lookup_picks_most_specific() {
        let store = memory_store().await;
        store
            .upsert_endpoint_policy(&endpoint("/api/boards/*", "*", 50))
            .await
            .unwrap();
        store
            .upsert_endpoint_policy(&endpoint("/api/boards/:id", "GET", 20))
            .await
            .unwrap();

        let found = store
            .find_endpoint_policy("/api/boards/7", "GET")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.limit, 20);

        let found = store
            .find_endpoint_policy("/api/boards/7", "DELETE")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.limit, 50);

        assert!(store
            .find_endpoint_policy("/api/tasks", "GET")
            .await
            .unwrap()
            .is_none());
    }

    fn logged(user: &str, path: &str, method: &str, at: DateTime<Utc>) -> RequestLogEntry {
        RequestLogEntry::new(Some(user.to_string()), Some(Role::User), path, method, at)
    }

    #[tokio::test]
    async fn test_count_by_scope_and_window() {
        let store = memory_store().await;
        let now = Utc::now();

        let entries = [
            logged("a", "/x", "get", now - Duration::seconds(90)),
            logged("a", "/x", "GET", now - Duration::seconds(30)),
            logged("a", "/y", "POST", now - Duration::seconds(10)),
            logged("b", "/x", "GET", now - Duration::seconds(5)),
        ];
        for entry in entries {
            store.append(entry).await.unwrap();
        }

        let since = now - Duration::seconds(60);

        let user = store
            .count(&CounterScope::User { user_id: "a".into() }, since, now)
            .await
            .unwrap();
        assert_eq!(user.count, 2);
        assert_eq!(
            user.oldest.map(|t| t.timestamp_millis()),
            Some((now - Duration::seconds(30)).timestamp_millis())
        );

        let endpoint = store
            .count(
                &CounterScope::Endpoint {
                    user_id: "a".into(),
                    path: "/x".into(),
                    method: "get".into(),
                },
                since,
                now,
            )
            .await
            .unwrap();
        assert_eq!(endpoint.count, 1);

        let role = store
            .count(&CounterScope::Role { role: Role::User }, since, now)
            .await
            .unwrap();
        assert_eq!(role.count, 3);

        let empty = store
            .count(&CounterScope::User { user_id: "c".into() }, since, now)
            .await
            .unwrap();
        assert_eq!(empty, WindowCount::default());
    }

    #[tokio::test]
    async fn test_prune_before() {
        let store = memory_store().await;
        let now = Utc::now();
        store
            .append(RequestLogEntry::new(None, None, "/old", "GET", now - Duration::days(2)))
            .await
            .unwrap();
        store
            .append(RequestLogEntry::new(None, None, "/new", "GET", now))
            .await
            .unwrap();

        let removed = store.prune_before(now - Duration::days(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.request_log_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_import_then_load() {
        let store = memory_store().await;
        let policies = PolicySet::from_yaml(
            r#"
roles:
  - role: ADMIN
    limit: 1000
    window_secs: 60
endpoints:
  - endpoint: /api/reports/export
    method: POST
    limit: 3
    window_secs: 300
"#,
        )
        .unwrap();

        store.import_policies(&policies).await.unwrap();
        let loaded = store.load_policies().await.unwrap();
        assert_eq!(loaded, policies);
    }
}
