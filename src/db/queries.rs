//! SQL for the policy tables and the request log.
//!
//! Timestamps are stored as epoch milliseconds so window comparisons stay
//! integer comparisons.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::warn;

use crate::error::{Result, WardenError};
use crate::ratelimit::{
    CounterScope, EndpointLimitPolicy, MethodMatch, PathPattern, RequestLogEntry, Role,
    RoleLimitPolicy, UserLimitPolicy, WindowCount,
};

fn to_db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_int(value: i64) -> u64 {
    value.max(0) as u64
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| WardenError::Store(format!("timestamp {} out of range", ms)))
}

///////////////////////////////////////////////////////////////////////////////
//****                         Policy Queries                            ****//
///////////////////////////////////////////////////////////////////////////////

fn role_policy_from_row(row: &SqliteRow) -> Result<RoleLimitPolicy> {
    let role: String = row.try_get("role")?;
    Ok(RoleLimitPolicy {
        role: role.parse().map_err(WardenError::Store)?,
        limit: from_db_int(row.try_get("request_limit")?),
        window_secs: from_db_int(row.try_get("window_secs")?),
        enabled: row.try_get("enabled")?,
    })
}

fn user_policy_from_row(row: &SqliteRow) -> Result<UserLimitPolicy> {
    Ok(UserLimitPolicy {
        user_id: row.try_get("user_id")?,
        limit: from_db_int(row.try_get("request_limit")?),
        window_secs: from_db_int(row.try_get("window_secs")?),
        enabled: row.try_get("enabled")?,
    })
}

fn endpoint_policy_from_row(row: &SqliteRow) -> Result<EndpointLimitPolicy> {
    let endpoint: String = row.try_get("endpoint")?;
    let method: String = row.try_get("method")?;
    Ok(EndpointLimitPolicy {
        endpoint: PathPattern::parse(&endpoint).map_err(WardenError::Store)?,
        method: MethodMatch::try_from(method).map_err(WardenError::Store)?,
        limit: from_db_int(row.try_get("request_limit")?),
        window_secs: from_db_int(row.try_get("window_secs")?),
    })
}

/// Insert or replace the policy for a role
pub async fn upsert_role_policy(pool: &SqlitePool, policy: &RoleLimitPolicy) -> Result<()> {
    sqlx::query(
        "INSERT INTO role_rate_limits (role, request_limit, window_secs, enabled)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(role) DO UPDATE SET
            request_limit = excluded.request_limit,
            window_secs = excluded.window_secs,
            enabled = excluded.enabled",
    )
    .bind(policy.role.as_str())
    .bind(to_db_int(policy.limit))
    .bind(to_db_int(policy.window_secs))
    .bind(policy.enabled)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert or replace the override for a user
pub async fn upsert_user_policy(pool: &SqlitePool, policy: &UserLimitPolicy) -> Result<()> {
    sqlx::query(
        "INSERT INTO user_rate_limits (user_id, request_limit, window_secs, enabled)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            request_limit = excluded.request_limit,
            window_secs = excluded.window_secs,
            enabled = excluded.enabled",
    )
    .bind(&policy.user_id)
    .bind(to_db_int(policy.limit))
    .bind(to_db_int(policy.window_secs))
    .bind(policy.enabled)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert or replace the policy for an endpoint pattern and method
pub async fn upsert_endpoint_policy(pool: &SqlitePool, policy: &EndpointLimitPolicy) -> Result<()> {
    sqlx::query(
        "INSERT INTO endpoint_rate_limits (endpoint, method, request_limit, window_secs)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(endpoint, method) DO UPDATE SET
            request_limit = excluded.request_limit,
            window_secs = excluded.window_secs",
    )
    .bind(policy.endpoint.as_str())
    .bind(policy.method.to_string())
    .bind(to_db_int(policy.limit))
    .bind(to_db_int(policy.window_secs))
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete the policy for a role
pub async fn delete_role_policy(pool: &SqlitePool, role: &Role) -> Result<bool> {
    let result = sqlx::query("DELETE FROM role_rate_limits WHERE role = ?")
        .bind(role.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete the override for a user
pub async fn delete_user_policy(pool: &SqlitePool, user_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM user_rate_limits WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete the policy for an endpoint pattern and method
pub async fn delete_endpoint_policy(
    pool: &SqlitePool,
    endpoint: &PathPattern,
    method: &MethodMatch,
) -> Result<bool> {
    let result = sqlx::query("DELETE FROM endpoint_rate_limits WHERE endpoint = ? AND method = ?")
        .bind(endpoint.as_str())
        .bind(method.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Fetch the enabled policy for a role
pub async fn fetch_enabled_role_policy(
    pool: &SqlitePool,
    role: &Role,
) -> Result<Option<RoleLimitPolicy>> {
    let row = sqlx::query(
        "SELECT role, request_limit, window_secs, enabled
        FROM role_rate_limits WHERE role = ? AND enabled = 1",
    )
    .bind(role.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(role_policy_from_row).transpose()
}

/// Fetch the enabled override for a user
pub async fn fetch_enabled_user_policy(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Option<UserLimitPolicy>> {
    let row = sqlx::query(
        "SELECT user_id, request_limit, window_secs, enabled
        FROM user_rate_limits WHERE user_id = ? AND enabled = 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(user_policy_from_row).transpose()
}

/// Fetch every role policy, enabled or not
pub async fn fetch_all_role_policies(pool: &SqlitePool) -> Result<Vec<RoleLimitPolicy>> {
    let rows = sqlx::query(
        "SELECT role, request_limit, window_secs, enabled FROM role_rate_limits ORDER BY role",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(role_policy_from_row).collect()
}

/// Fetch every user override, enabled or not
pub async fn fetch_all_user_policies(pool: &SqlitePool) -> Result<Vec<UserLimitPolicy>> {
    let rows = sqlx::query(
        "SELECT user_id, request_limit, window_secs, enabled FROM user_rate_limits ORDER BY user_id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(user_policy_from_row).collect()
}

/// Fetch every endpoint policy in insertion order
///
/// Rows whose pattern or method no longer parses are skipped with a warning.
pub async fn fetch_all_endpoint_policies(pool: &SqlitePool) -> Result<Vec<EndpointLimitPolicy>> {
    let rows = sqlx::query(
        "SELECT endpoint, method, request_limit, window_secs
        FROM endpoint_rate_limits ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    let mut policies = Vec::with_capacity(rows.len());
    for row in &rows {
        match endpoint_policy_from_row(row) {
            Ok(policy) => policies.push(policy),
            Err(e) => warn!(error = %e, "Skipping malformed endpoint policy row"),
        }
    }
    Ok(policies)
}

///////////////////////////////////////////////////////////////////////////////
//****                       Request Log Queries                         ****//
///////////////////////////////////////////////////////////////////////////////

/// Append one request to the log
pub async fn insert_request_log(pool: &SqlitePool, entry: &RequestLogEntry) -> Result<()> {
    sqlx::query(
        "INSERT INTO request_logs (id, user_id, role, path, method, timestamp_ms)
        VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.id.to_string())
    .bind(entry.user_id.as_deref())
    .bind(entry.role.as_ref().map(|role| role.as_str().to_string()))
    .bind(&entry.path)
    .bind(&entry.method)
    .bind(to_millis(entry.timestamp))
    .execute(pool)
    .await?;
    Ok(())
}

/// Count log entries in `scope` with `since <= timestamp <= until`
pub async fn count_requests(
    pool: &SqlitePool,
    scope: &CounterScope,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<WindowCount> {
    let filter = match scope {
        CounterScope::Endpoint { .. } => "user_id = ? AND path = ? AND method = ?",
        CounterScope::User { .. } => "user_id = ?",
        CounterScope::Role { .. } => "role = ?",
    };
    let sql = format!(
        "SELECT COUNT(*) AS total, MIN(timestamp_ms) AS oldest FROM request_logs
        WHERE {} AND timestamp_ms >= ? AND timestamp_ms <= ?",
        filter
    );

    let query = sqlx::query(&sql);
    let query = match scope {
        CounterScope::Endpoint {
            user_id,
            path,
            method,
        } => query
            .bind(user_id.as_str())
            .bind(path.as_str())
            .bind(method.to_ascii_uppercase()),
        CounterScope::User { user_id } => query.bind(user_id.as_str()),
        CounterScope::Role { role } => query.bind(role.as_str()),
    };

    let row = query
        .bind(to_millis(since))
        .bind(to_millis(until))
        .fetch_one(pool)
        .await?;

    let total: i64 = row.try_get("total")?;
    let oldest: Option<i64> = row.try_get("oldest")?;

    Ok(WindowCount {
        count: from_db_int(total),
        oldest: oldest.map(from_millis).transpose()?,
    })
}

/// Delete log entries older than `before`
pub async fn delete_request_logs_before(pool: &SqlitePool, before: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM request_logs WHERE timestamp_ms < ?")
        .bind(to_millis(before))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Total number of log entries
pub async fn count_all_request_logs(pool: &SqlitePool) -> Result<u64> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM request_logs")
        .fetch_one(pool)
        .await?;
    Ok(from_db_int(total))
}
