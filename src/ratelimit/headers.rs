//! Rate limit response headers.

use std::time::Duration;

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};

use super::resolver::Decision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_TYPE: HeaderName = HeaderName::from_static("x-ratelimit-type");

/// Write the `X-RateLimit-*` headers for `decision`, plus `Retry-After` if it
/// rejects.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining()));
    headers.insert(
        X_RATELIMIT_TYPE,
        HeaderValue::from_static(decision.tier.as_str()),
    );
    headers.insert(
        X_RATELIMIT_RESET,
        HeaderValue::from(decision.reset_at.timestamp()),
    );

    if !decision.allowed() {
        apply_retry_after(headers, decision.retry_after());
    }
}

pub fn apply_remaining(headers: &mut HeaderMap, remaining: u64) {
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
}

/// `after` rounded up to whole seconds, at least one.
pub fn retry_after_secs(after: Duration) -> u64 {
    let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
    secs.max(1)
}

pub fn apply_retry_after(headers: &mut HeaderMap, after: Duration) {
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(after)));
}
