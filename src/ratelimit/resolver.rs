//! Tiered rate limit resolver.
//!
//! For each request the resolver walks an ordered list of [`TierStrategy`]
//! objects (endpoint, user, role, default) and takes the first that yields a
//! quota. It then counts the caller's prior requests in that quota's window
//! and decides: allowed iff `count < limit`.
//!
//! Counting reads the request log as it is at call time, so two concurrent
//! requests can both observe `limit - 1` and both be admitted. The resolver is
//! an approximate throttle, not a strict concurrency gate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, trace};

use super::clock::{Clock, SystemClock};
use super::failure::{FailureMode, FailurePolicy};
use super::log::{CounterScope, RequestCounter};
use super::policy::{normalize_path, Quota, Role};
use super::store::PolicyStore;
use crate::error::Result;

/// Limit of the default tier when nothing else matches.
pub const DEFAULT_LIMIT: u64 = 200;
/// Window of the default tier, in seconds.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Authenticated caller, supplied by the host's authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub role: Option<Role>,
}

impl AuthUser {
    pub fn new(id: impl Into<String>, role: Option<Role>) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// The parts of a request the resolver looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRequest {
    pub user: Option<AuthUser>,
    pub path: String,
    pub method: String,
}

impl RateLimitRequest {
    /// `path` is stored in its [`normalize_path`] form.
    pub fn new(user: Option<AuthUser>, path: impl AsRef<str>, method: impl Into<String>) -> Self {
        Self {
            user,
            path: normalize_path(path.as_ref()),
            method: method.into().to_ascii_uppercase(),
        }
    }
}

/// Priority level a quota was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Endpoint,
    User,
    Role,
    Default,
}

impl Tier {
    /// Lowercase label, as sent in `X-RateLimit-Type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Endpoint => "endpoint",
            Tier::User => "user",
            Tier::Role => "role",
            Tier::Default => "default",
        }
    }

    /// Capitalised label for messages.
    pub fn title(&self) -> &'static str {
        match self {
            Tier::Endpoint => "Endpoint",
            Tier::User => "User",
            Tier::Role => "Role",
            Tier::Default => "Default",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A quota picked by one tier, with the log scope it is counted over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuota {
    pub tier: Tier,
    pub quota: Quota,
    pub scope: CounterScope,
}

/// One level of the priority cascade.
#[async_trait]
pub trait TierStrategy: Send + Sync + fmt::Debug {
    fn tier(&self) -> Tier;

    /// The quota this tier imposes on `user`'s request, if it applies.
    async fn try_resolve(
        &self,
        store: &dyn PolicyStore,
        request: &RateLimitRequest,
        user: &AuthUser,
    ) -> Result<Option<ResolvedQuota>>;
}

/// Endpoint policies; counts this user's calls to the exact path and method.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointTier;

#[async_trait]
impl TierStrategy for EndpointTier {
    fn tier(&self) -> Tier {
        Tier::Endpoint
    }

    async fn try_resolve(
        &self,
        store: &dyn PolicyStore,
        request: &RateLimitRequest,
        user: &AuthUser,
    ) -> Result<Option<ResolvedQuota>> {
        let policy = store
            .find_endpoint_policy(&request.path, &request.method)
            .await?;

        Ok(policy.map(|policy| ResolvedQuota {
            tier: Tier::Endpoint,
            quota: policy.quota(),
            scope: CounterScope::Endpoint {
                user_id: user.id.clone(),
                path: request.path.clone(),
                method: request.method.clone(),
            },
        }))
    }
}

/// Per-user overrides; counts every request by the user.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserTier;

#[async_trait]
impl TierStrategy for UserTier {
    fn tier(&self) -> Tier {
        Tier::User
    }

    async fn try_resolve(
        &self,
        store: &dyn PolicyStore,
        _request: &RateLimitRequest,
        user: &AuthUser,
    ) -> Result<Option<ResolvedQuota>> {
        let policy = store.find_user_policy(&user.id).await?;

        Ok(policy
            .filter(|policy| policy.enabled)
            .map(|policy| ResolvedQuota {
                tier: Tier::User,
                quota: policy.quota(),
                scope: CounterScope::User {
                    user_id: user.id.clone(),
                },
            }))
    }
}

/// Role defaults; counts every request by users holding the role.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoleTier;

#[async_trait]
impl TierStrategy for RoleTier {
    fn tier(&self) -> Tier {
        Tier::Role
    }

    async fn try_resolve(
        &self,
        store: &dyn PolicyStore,
        _request: &RateLimitRequest,
        user: &AuthUser,
    ) -> Result<Option<ResolvedQuota>> {
        let Some(role) = user.role.as_ref() else {
            return Ok(None);
        };

        let policy = store.find_role_policy(role).await?;

        Ok(policy
            .filter(|policy| policy.enabled)
            .map(|policy| ResolvedQuota {
                tier: Tier::Role,
                quota: policy.quota(),
                scope: CounterScope::Role { role: role.clone() },
            }))
    }
}

/// Configured fallback; always applies and counts every request by the user.
#[derive(Debug, Clone, Copy)]
pub struct DefaultTier {
    quota: Quota,
}

impl DefaultTier {
    pub fn new(quota: Quota) -> Self {
        Self { quota }
    }
}

impl Default for DefaultTier {
    fn default() -> Self {
        Self::new(Quota::new(DEFAULT_LIMIT, DEFAULT_WINDOW_SECS))
    }
}

#[async_trait]
impl TierStrategy for DefaultTier {
    fn tier(&self) -> Tier {
        Tier::Default
    }

    async fn try_resolve(
        &self,
        _store: &dyn PolicyStore,
        _request: &RateLimitRequest,
        user: &AuthUser,
    ) -> Result<Option<ResolvedQuota>> {
        Ok(Some(ResolvedQuota {
            tier: Tier::Default,
            quota: self.quota,
            scope: CounterScope::User {
                user_id: user.id.clone(),
            },
        }))
    }
}

/// The admit/reject decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub tier: Tier,
    pub limit: u64,
    pub window: Duration,
    /// Prior requests inside the window, not including this one.
    pub count: u64,
    pub now: DateTime<Utc>,
    /// When the oldest counted request leaves the window.
    pub reset_at: DateTime<Utc>,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.count < self.limit
    }

    /// `limit - count`, never below zero.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }

    /// Whole seconds until `reset_at`, at least one.
    pub fn retry_after(&self) -> Duration {
        let millis = (self.reset_at - self.now).num_milliseconds().max(0) as u64;
        Duration::from_secs(millis.div_ceil(1000).max(1))
    }

    /// E.g. `"Endpoint rate limit exceeded"`.
    pub fn message(&self) -> String {
        format!("{} rate limit exceeded", self.tier.title())
    }
}

/// Result of resolving one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No authenticated user; nothing was checked.
    Anonymous,
    /// A tier applied and a decision was made.
    Decided(Decision),
    /// Stores failed and the failure mode is open: let it through.
    FailedOpen,
    /// Stores failed and the failure mode is closed: refuse it.
    FailedClosed,
}

impl Outcome {
    pub fn is_allowed(&self) -> bool {
        match self {
            Outcome::Anonymous | Outcome::FailedOpen => true,
            Outcome::Decided(decision) => decision.allowed(),
            Outcome::FailedClosed => false,
        }
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Outcome::Decided(decision) => Some(decision),
            _ => None,
        }
    }
}

/// The tiered rate limiter.
///
/// This struct is thread-safe and is shared across requests behind an `Arc`.
pub struct TieredRateLimiter {
    store: Arc<dyn PolicyStore>,
    counter: Arc<dyn RequestCounter>,
    clock: Arc<dyn Clock>,
    failure: FailurePolicy,
    tiers: Vec<Box<dyn TierStrategy>>,
}

impl TieredRateLimiter {
    /// Create a limiter with the standard cascade and the built-in default quota.
    pub fn new(store: Arc<dyn PolicyStore>, counter: Arc<dyn RequestCounter>) -> Self {
        Self {
            store,
            counter,
            clock: Arc::new(SystemClock),
            failure: FailurePolicy::default(),
            tiers: Self::standard_tiers(Quota::new(DEFAULT_LIMIT, DEFAULT_WINDOW_SECS)),
        }
    }

    /// Endpoint, user, role, then `default_quota`.
    pub fn standard_tiers(default_quota: Quota) -> Vec<Box<dyn TierStrategy>> {
        vec![
            Box::new(EndpointTier),
            Box::new(UserTier),
            Box::new(RoleTier),
            Box::new(DefaultTier::new(default_quota)),
        ]
    }

    pub fn with_default_quota(mut self, quota: Quota) -> Self {
        self.tiers = Self::standard_tiers(quota);
        self
    }

    /// Replace the cascade. Requests that no tier claims are admitted.
    pub fn with_tiers(mut self, tiers: Vec<Box<dyn TierStrategy>>) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_policy(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure
    }

    /// Resolve the applicable tier and decide whether `request` may proceed.
    ///
    /// Never fails: store errors are logged and mapped through the failure mode.
    pub async fn resolve(&self, request: &RateLimitRequest) -> Outcome {
        let Some(user) = request.user.as_ref() else {
            trace!(path = %request.path, "No authenticated user, skipping tiered rate limit");
            return Outcome::Anonymous;
        };

        match self.try_resolve(request, user).await {
            Ok(Some(decision)) => {
                if decision.allowed() {
                    trace!(
                        user_id = %user.id,
                        tier = %decision.tier,
                        count = decision.count,
                        limit = decision.limit,
                        "Rate limit check passed"
                    );
                } else {
                    debug!(
                        user_id = %user.id,
                        path = %request.path,
                        method = %request.method,
                        tier = %decision.tier,
                        count = decision.count,
                        limit = decision.limit,
                        "Rate limit exceeded"
                    );
                }
                Outcome::Decided(decision)
            }
            Ok(None) => Outcome::Anonymous,
            Err(e) => {
                error!(
                    error = %e,
                    user_id = %user.id,
                    path = %request.path,
                    mode = ?self.failure.mode(),
                    "Rate limit resolution failed"
                );
                match self.failure.mode() {
                    FailureMode::Open => Outcome::FailedOpen,
                    FailureMode::Closed => Outcome::FailedClosed,
                }
            }
        }
    }

    /// First tier that claims the request.
    pub async fn resolve_quota(
        &self,
        request: &RateLimitRequest,
        user: &AuthUser,
    ) -> Result<Option<ResolvedQuota>> {
        for tier in &self.tiers {
            let resolved = self
                .failure
                .guard(
                    "policy lookup",
                    tier.try_resolve(self.store.as_ref(), request, user),
                )
                .await?;
            if resolved.is_some() {
                return Ok(resolved);
            }
        }
        Ok(None)
    }

    async fn try_resolve(
        &self,
        request: &RateLimitRequest,
        user: &AuthUser,
    ) -> Result<Option<Decision>> {
        let Some(resolved) = self.resolve_quota(request, user).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        let window = resolved.quota.window_delta();
        let counted = self
            .failure
            .guard(
                "request count",
                self.counter.count(&resolved.scope, now - window, now),
            )
            .await?;

        Ok(Some(Decision {
            tier: resolved.tier,
            limit: resolved.quota.limit(),
            window: resolved.quota.window(),
            count: counted.count,
            now,
            reset_at: counted.oldest.unwrap_or(now) + window,
        }))
    }
}

impl fmt::Debug for TieredRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredRateLimiter")
            .field("failure", &self.failure)
            .field("tiers", &self.tiers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WardenError;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::log::{InMemoryRequestLog, RequestLogEntry, WindowCount};
    use crate::ratelimit::policy::{
        EndpointLimitPolicy, MethodMatch, PathPattern, RoleLimitPolicy, UserLimitPolicy,
    };
    use crate::ratelimit::store::{InMemoryPolicyStore, PolicySet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store whose every lookup fails.
    #[derive(Debug, Default)]
    struct FailingStore;

    #[async_trait]
    impl PolicyStore for FailingStore {
        async fn find_endpoint_policy(
            &self,
            _path: &str,
            _method: &str,
        ) -> Result<Option<EndpointLimitPolicy>> {
            Err(WardenError::Store("connection refused".to_string()))
        }

        async fn find_user_policy(&self, _user_id: &str) -> Result<Option<UserLimitPolicy>> {
            Err(WardenError::Store("connection refused".to_string()))
        }

        async fn find_role_policy(&self, _role: &Role) -> Result<Option<RoleLimitPolicy>> {
            Err(WardenError::Store("connection refused".to_string()))
        }
    }

    /// Store that counts how often it is asked anything.
    #[derive(Debug, Default)]
    struct CountingStore {
        inner: InMemoryPolicyStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PolicyStore for CountingStore {
        async fn find_endpoint_policy(
            &self,
            path: &str,
            method: &str,
        ) -> Result<Option<EndpointLimitPolicy>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.find_endpoint_policy(path, method).await
        }

        async fn find_user_policy(&self, user_id: &str) -> Result<Option<UserLimitPolicy>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.find_user_policy(user_id).await
        }

        async fn find_role_policy(&self, role: &Role) -> Result<Option<RoleLimitPolicy>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.find_role_policy(role).await
        }
    }

    /// Counter whose every query fails.
    #[derive(Debug, Default)]
    struct FailingCounter;

    #[async_trait]
    impl RequestCounter for FailingCounter {
        async fn count(
            &self,
            _scope: &CounterScope,
            _since: DateTime<Utc>,
            _until: DateTime<Utc>,
        ) -> Result<WindowCount> {
            Err(WardenError::Store("request log unavailable".to_string()))
        }
    }

    /// Store that answers only after `delay`.
    #[derive(Debug)]
    struct SlowStore {
        delay: Duration,
    }

    #[async_trait]
    impl PolicyStore for SlowStore {
        async fn find_endpoint_policy(
            &self,
            _path: &str,
            _method: &str,
        ) -> Result<Option<EndpointLimitPolicy>> {
            tokio::time::sleep(self.delay).await;
            Ok(None)
        }

        async fn find_user_policy(&self, _user_id: &str) -> Result<Option<UserLimitPolicy>> {
            tokio::time::sleep(self.delay).await;
            Ok(None)
        }

        async fn find_role_policy(&self, _role: &Role) -> Result<Option<RoleLimitPolicy>> {
            tokio::time::sleep(self.delay).await;
            Ok(None)
        }
    }

    fn sample_policies() -> PolicySet {
        PolicySet {
            roles: vec![RoleLimitPolicy {
                role: Role::User,
                limit: 100,
                window_secs: 60,
                enabled: true,
            }],
            users: vec![UserLimitPolicy {
                user_id: "vip".to_string(),
                limit: 500,
                window_secs: 120,
                enabled: true,
            }],
            endpoints: vec![EndpointLimitPolicy {
                endpoint: PathPattern::parse("/api/reports/export").unwrap(),
                method: MethodMatch::Exact("POST".to_string()),
                limit: 3,
                window_secs: 300,
            }],
        }
    }

    struct Harness {
        limiter: TieredRateLimiter,
        log: Arc<InMemoryRequestLog>,
        clock: ManualClock,
    }

    impl Harness {
        fn new(policies: PolicySet) -> Self {
            let log = Arc::new(InMemoryRequestLog::new());
            let clock = ManualClock::default();
            let limiter = TieredRateLimiter::new(
                Arc::new(InMemoryPolicyStore::with_policies(policies)),
                log.clone(),
            )
            .with_clock(Arc::new(clock.clone()));
            Self {
                limiter,
                log,
                clock,
            }
        }

        fn record(&self, request: &RateLimitRequest, times: usize) {
            let user = request.user.as_ref().unwrap();
            for _ in 0..times {
                self.log.push(RequestLogEntry::new(
                    Some(user.id.clone()),
                    user.role.clone(),
                    request.path.clone(),
                    request.method.clone(),
                    self.clock.now(),
                ));
            }
        }

        async fn decide(&self, request: &RateLimitRequest) -> Decision {
            match self.limiter.resolve(request).await {
                Outcome::Decided(decision) => decision,
                other => panic!("expected a decision, got {:?}", other),
            }
        }
    }

    fn request(user: &str, role: Option<Role>, path: &str, method: &str) -> RateLimitRequest {
        RateLimitRequest::new(Some(AuthUser::new(user, role)), path, method)
    }

    #[tokio::test]
    async fn test_endpoint_tier_wins_over_user_and_role() {
        let harness = Harness::new(sample_policies());
        let req = request("vip", Some(Role::User), "/api/reports/export", "post");

        let decision = harness.decide(&req).await;
        assert_eq!(decision.tier, Tier::Endpoint);
        assert_eq!(decision.limit, 3);
        assert_eq!(decision.window, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_user_tier_when_no_endpoint_matches() {
        let harness = Harness::new(sample_policies());
        let req = request("vip", Some(Role::User), "/api/boards", "GET");

        let decision = harness.decide(&req).await;
        assert_eq!(decision.tier, Tier::User);
        assert_eq!(decision.limit, 500);
    }

    #[tokio::test]
    async fn test_role_tier_then_default() {
        let harness = Harness::new(sample_policies());

        let decision = harness
            .decide(&request("alice", Some(Role::User), "/api/boards", "GET"))
            .await;
        assert_eq!(decision.tier, Tier::Role);
        assert_eq!(decision.limit, 100);

        let decision = harness
            .decide(&request("bob", Some(Role::Manager), "/api/boards", "GET"))
            .await;
        assert_eq!(decision.tier, Tier::Default);
        assert_eq!(decision.limit, DEFAULT_LIMIT);

        let decision = harness
            .decide(&request("carol", None, "/api/boards", "GET"))
            .await;
        assert_eq!(decision.tier, Tier::Default);
    }

    #[tokio::test]
    async fn test_disabled_policies_are_skipped() {
        let mut policies = sample_policies();
        policies.users[0].enabled = false;
        policies.roles[0].enabled = false;
        let harness = Harness::new(policies);

        let decision = harness
            .decide(&request("vip", Some(Role::User), "/api/boards", "GET"))
            .await;
        assert_eq!(decision.tier, Tier::Default);
    }

    #[tokio::test]
    async fn test_rejects_at_limit() {
        let harness = Harness::new(sample_policies());
        let req = request("alice", Some(Role::User), "/api/reports/export", "POST");

        harness.record(&req, 2);
        let decision = harness.decide(&req).await;
        assert!(decision.allowed());
        assert_eq!(decision.remaining(), 1);

        harness.record(&req, 1);
        let decision = harness.decide(&req).await;
        assert!(!decision.allowed());
        assert_eq!(decision.count, 3);
        assert_eq!(decision.remaining(), 0);
        assert_eq!(decision.message(), "Endpoint rate limit exceeded");
    }

    #[tokio::test]
    async fn test_endpoint_counts_only_that_path_and_method() {
        let harness = Harness::new(sample_policies());
        let export = request("alice", Some(Role::User), "/api/reports/export", "POST");
        let boards = request("alice", Some(Role::User), "/api/boards", "GET");

        harness.record(&boards, 10);
        let decision = harness.decide(&export).await;
        assert_eq!(decision.count, 0);

        // role tier counts everything by USER holders
        let decision = harness.decide(&boards).await;
        assert_eq!(decision.count, 10);
    }

    #[tokio::test]
    async fn test_window_slides_past_old_requests() {
        let harness = Harness::new(sample_policies());
        let req = request("alice", Some(Role::User), "/api/reports/export", "POST");

        harness.record(&req, 3);
        let decision = harness.decide(&req).await;
        assert!(!decision.allowed());
        assert_eq!(decision.retry_after(), Duration::from_secs(300));

        harness.clock.advance(Duration::from_secs(120));
        let decision = harness.decide(&req).await;
        assert_eq!(decision.retry_after(), Duration::from_secs(180));

        harness.clock.advance(Duration::from_secs(181));
        let decision = harness.decide(&req).await;
        assert!(decision.allowed());
        assert_eq!(decision.count, 0);
    }

    #[tokio::test]
    async fn test_repeat_resolution_is_stable_until_logged() {
        let harness = Harness::new(sample_policies());
        let req = request("alice", Some(Role::User), "/api/boards", "GET");

        let first = harness.decide(&req).await;
        let second = harness.decide(&req).await;
        assert_eq!(first.remaining(), second.remaining());

        harness.record(&req, 1);
        let third = harness.decide(&req).await;
        assert_eq!(third.remaining(), second.remaining() - 1);
    }

    #[tokio::test]
    async fn test_anonymous_request_never_touches_store() {
        let store = Arc::new(CountingStore::default());
        let limiter = TieredRateLimiter::new(store.clone(), Arc::new(InMemoryRequestLog::new()));

        let outcome = limiter
            .resolve(&RateLimitRequest::new(None, "/api/boards", "GET"))
            .await;

        assert_eq!(outcome, Outcome::Anonymous);
        assert!(outcome.is_allowed());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_by_default() {
        let limiter =
            TieredRateLimiter::new(Arc::new(FailingStore), Arc::new(InMemoryRequestLog::new()));

        let outcome = limiter
            .resolve(&request("alice", Some(Role::User), "/api/boards", "GET"))
            .await;

        assert_eq!(outcome, Outcome::FailedOpen);
        assert!(outcome.is_allowed());
    }

    #[tokio::test]
    async fn test_store_failure_can_fail_closed() {
        let limiter =
            TieredRateLimiter::new(Arc::new(FailingStore), Arc::new(InMemoryRequestLog::new()))
                .with_failure_policy(FailurePolicy::new(
                    FailureMode::Closed,
                    Duration::from_secs(1),
                ));

        let outcome = limiter
            .resolve(&request("alice", Some(Role::User), "/api/boards", "GET"))
            .await;

        assert_eq!(outcome, Outcome::FailedClosed);
        assert!(!outcome.is_allowed());
    }

    #[tokio::test]
    async fn test_counter_failure_fails_open() {
        let limiter = TieredRateLimiter::new(
            Arc::new(InMemoryPolicyStore::with_policies(sample_policies())),
            Arc::new(FailingCounter),
        );

        let outcome = limiter
            .resolve(&request("alice", Some(Role::User), "/api/reports/export", "POST"))
            .await;

        assert_eq!(outcome, Outcome::FailedOpen);
        assert!(outcome.decision().is_none());
    }

    #[tokio::test]
    async fn test_counter_failure_can_fail_closed() {
        let limiter = TieredRateLimiter::new(
            Arc::new(InMemoryPolicyStore::with_policies(sample_policies())),
            Arc::new(FailingCounter),
        )
        .with_failure_policy(FailurePolicy::new(
            FailureMode::Closed,
            Duration::from_secs(1),
        ));

        let outcome = limiter
            .resolve(&request("alice", Some(Role::User), "/api/boards", "GET"))
            .await;

        assert_eq!(outcome, Outcome::FailedClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out_open() {
        let store = SlowStore {
            delay: Duration::from_secs(10),
        };
        let limiter = TieredRateLimiter::new(Arc::new(store), Arc::new(InMemoryRequestLog::new()))
            .with_failure_policy(FailurePolicy::new(
                FailureMode::Open,
                Duration::from_millis(50),
            ));

        let started = tokio::time::Instant::now();
        let outcome = limiter
            .resolve(&request("alice", Some(Role::User), "/api/boards", "GET"))
            .await;

        assert_eq!(outcome, Outcome::FailedOpen);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out_closed() {
        let store = SlowStore {
            delay: Duration::from_secs(10),
        };
        let limiter = TieredRateLimiter::new(Arc::new(store), Arc::new(InMemoryRequestLog::new()))
            .with_failure_policy(FailurePolicy::new(
                FailureMode::Closed,
                Duration::from_millis(50),
            ));

        let outcome = limiter
            .resolve(&request("alice", Some(Role::User), "/api/boards", "GET"))
            .await;

        assert_eq!(outcome, Outcome::FailedClosed);
    }

    #[tokio::test]
    async fn test_slash_variants_share_endpoint_count() {
        let harness = Harness::new(sample_policies());
        let canonical = request("alice", Some(Role::User), "/api/reports/export", "POST");
        harness.record(&canonical, 3);

        for spelling in [
            "/api/reports/export/",
            "/api//reports/export",
            "/api/reports//export",
            "/api/reports/export//",
        ] {
            let req = request("alice", Some(Role::User), spelling, "POST");
            assert_eq!(req.path, "/api/reports/export");

            let decision = harness.decide(&req).await;
            assert_eq!(decision.tier, Tier::Endpoint, "{}", spelling);
            assert_eq!(decision.count, 3, "{}", spelling);
            assert!(!decision.allowed(), "{}", spelling);
        }
    }

    #[tokio::test]
    async fn test_configured_default_quota() {
        let harness = Harness::new(PolicySet::new());
        let limiter = harness.limiter.with_default_quota(Quota::new(2, 10));

        let decision = limiter
            .resolve(&request("dave", None, "/api/tasks", "GET"))
            .await;
        let decision = decision.decision().unwrap();
        assert_eq!(decision.tier, Tier::Default);
        assert_eq!(decision.limit, 2);
        assert_eq!(decision.window, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_empty_cascade_admits() {
        let harness = Harness::new(sample_policies());
        let limiter = harness.limiter.with_tiers(Vec::new());

        let outcome = limiter
            .resolve(&request("alice", Some(Role::User), "/api/boards", "GET"))
            .await;
        assert_eq!(outcome, Outcome::Anonymous);
    }
}
