//! Rate limiting logic and state management.

mod clock;
mod counter;
mod failure;
mod fixed_window;
mod headers;
mod key;
mod log;
mod policy;
mod resolver;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{Hit, WindowEntry};
pub use failure::{FailureMode, FailurePolicy, DEFAULT_STORE_TIMEOUT};
pub use fixed_window::{make_limiter, FixedWindowLimiter, DEFAULT_MAX_ENTRIES};
pub use headers::{
    apply_rate_limit_headers, apply_remaining, apply_retry_after, retry_after_secs,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, X_RATELIMIT_TYPE,
};
pub use key::ClientKey;
pub use log::{
    CounterScope, InMemoryRequestLog, RequestCounter, RequestLogEntry, RequestLogWriter,
    WindowCount,
};
pub use policy::{
    best_endpoint_match, normalize_path, EndpointLimitPolicy, MethodMatch, PathPattern, Quota,
    Role, RoleLimitPolicy, UserLimitPolicy, MAX_WINDOW_SECS,
};
pub use resolver::{
    AuthUser, Decision, DefaultTier, EndpointTier, Outcome, RateLimitRequest, ResolvedQuota,
    RoleTier, Tier, TierStrategy, TieredRateLimiter, UserTier, DEFAULT_LIMIT, DEFAULT_WINDOW_SECS,
};
pub use store::{InMemoryPolicyStore, PolicySet, PolicyStore};
