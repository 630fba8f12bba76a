//! HTTP surface: axum middleware, identity extraction and the demo server.

mod identity;
mod middleware;
mod router;
mod server;

pub use identity::{auth_user_from_headers, trusted_identity_headers, X_USER_ID, X_USER_ROLE};
pub use middleware::{
    client_key, fixed_window_limit, record_requests, tiered_rate_limit, RateLimitBody,
    RequestRecorder, TOO_MANY_REQUESTS_MESSAGE, UNAVAILABLE_MESSAGE,
};
pub use router::{build_router, AppState};
pub use server::HttpServer;
