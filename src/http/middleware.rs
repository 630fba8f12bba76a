//! axum middleware for the tiered limiter, the fixed-window limiter and the
//! request recorder.
//!
//! All three are plain `async fn`s meant for
//! [`axum::middleware::from_fn_with_state`]:
//!
//! ```ignore
//! let api = Router::new()
//!     .route("/api/{*path}", any(handler))
//!     .route_layer(from_fn_with_state(limiter, tiered_rate_limit))
//!     .layer(from_fn_with_state(recorder, record_requests));
//! ```
//!
//! The recorder must wrap the tiered limiter so the current request is logged
//! after its decision, not counted against itself.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{instrument, warn};

use crate::ratelimit::{
    apply_rate_limit_headers, apply_remaining, apply_retry_after, retry_after_secs, AuthUser,
    normalize_path, ClientKey, Clock, FixedWindowLimiter, Hit, Outcome, RateLimitRequest,
    RequestLogEntry, RequestLogWriter, SystemClock, TieredRateLimiter,
};

/// Message of the fixed-window limiter's 429 body.
pub const TOO_MANY_REQUESTS_MESSAGE: &str = "Too many requests, please try again later.";
/// Message of the 503 body when the limiter fails closed.
pub const UNAVAILABLE_MESSAGE: &str = "Rate limiting unavailable";

/// JSON body of 429 and 503 responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitBody {
    pub message: String,
    pub retry_after: u64,
}

impl RateLimitBody {
    pub fn new(message: impl Into<String>, retry_after: u64) -> Self {
        Self {
            message: message.into(),
            retry_after,
        }
    }
}

fn rejection(status: StatusCode, headers: HeaderMap, body: RateLimitBody) -> Response {
    (status, headers, Json(body)).into_response()
}

/// Apply the tiered rate limit to requests carrying an [`AuthUser`].
///
/// Requests without a user pass untouched. Store failures either pass the
/// request through without headers or refuse it with 503, per the limiter's
/// failure mode.
#[instrument(
    skip_all,
    fields(path = %request.uri().path(), method = %request.method())
)]
pub async fn tiered_rate_limit(
    State(limiter): State<Arc<TieredRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let rate_request = RateLimitRequest::new(
        request.extensions().get::<AuthUser>().cloned(),
        request.uri().path(),
        request.method().as_str(),
    );

    match limiter.resolve(&rate_request).await {
        Outcome::Anonymous | Outcome::FailedOpen => next.run(request).await,
        Outcome::FailedClosed => {
            let mut headers = HeaderMap::new();
            apply_retry_after(&mut headers, std::time::Duration::from_secs(1));
            rejection(
                StatusCode::SERVICE_UNAVAILABLE,
                headers,
                RateLimitBody::new(UNAVAILABLE_MESSAGE, 1),
            )
        }
        Outcome::Decided(decision) if decision.allowed() => {
            let mut response = next.run(request).await;
            apply_rate_limit_headers(response.headers_mut(), &decision);
            response
        }
        Outcome::Decided(decision) => {
            let mut headers = HeaderMap::new();
            apply_rate_limit_headers(&mut headers, &decision);
            rejection(
                StatusCode::TOO_MANY_REQUESTS,
                headers,
                RateLimitBody::new(decision.message(), decision.retry_after().as_secs()),
            )
        }
    }
}

/// Key for the fixed-window limiter: user id, else peer address, else shared.
pub fn client_key(request: &Request) -> ClientKey {
    let user_id = request
        .extensions()
        .get::<AuthUser>()
        .map(|user| user.id.as_str());
    let address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    ClientKey::new(user_id, address)
}

/// Apply a [`FixedWindowLimiter`] keyed by [`client_key`].
#[instrument(
    skip_all,
    fields(limiter = limiter.name(), path = %request.uri().path())
)]
pub async fn fixed_window_limit(
    State(limiter): State<Arc<FixedWindowLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);

    match limiter.check(&key.to_string_key()) {
        Hit::Opened => next.run(request).await,
        Hit::Admitted { remaining } => {
            let mut response = next.run(request).await;
            apply_remaining(response.headers_mut(), remaining);
            response
        }
        Hit::Rejected { retry_after } => {
            let mut headers = HeaderMap::new();
            apply_remaining(&mut headers, 0);
            apply_retry_after(&mut headers, retry_after);
            rejection(
                StatusCode::TOO_MANY_REQUESTS,
                headers,
                RateLimitBody::new(TOO_MANY_REQUESTS_MESSAGE, retry_after_secs(retry_after)),
            )
        }
    }
}

/// Appends a [`RequestLogEntry`] for every request that reaches it.
#[derive(Clone)]
pub struct RequestRecorder {
    writer: Arc<dyn RequestLogWriter>,
    clock: Arc<dyn Clock>,
}

impl RequestRecorder {
    pub fn new(writer: Arc<dyn RequestLogWriter>) -> Self {
        Self {
            writer,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Append one entry under the [`normalize_path`] form of `path`.
    /// Failures are logged and swallowed.
    pub async fn record(&self, user: Option<AuthUser>, path: &str, method: String) {
        let (user_id, role) = match user {
            Some(user) => (Some(user.id), user.role),
            None => (None, None),
        };
        let entry = RequestLogEntry::new(
            user_id,
            role,
            normalize_path(path),
            method,
            self.clock.now(),
        );

        if let Err(e) = self.writer.append(entry).await {
            warn!(error = %e, "Failed to record request");
        }
    }
}

impl std::fmt::Debug for RequestRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecorder")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Record each request once its response is ready, rejected ones included.
pub async fn record_requests(
    State(recorder): State<RequestRecorder>,
    request: Request,
    next: Next,
) -> Response {
    let user = request.extensions().get::<AuthUser>().cloned();
    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_string();

    let response = next.run(request).await;
    recorder.record(user, &path, method).await;
    response
}
