//! Demo router wiring both limiters and the recorder.

use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::{json, Value};

use super::identity::trusted_identity_headers;
use super::middleware::{fixed_window_limit, record_requests, tiered_rate_limit, RequestRecorder};
use crate::ratelimit::{AuthUser, FixedWindowLimiter, TieredRateLimiter};

/// Everything [`build_router`] needs.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<TieredRateLimiter>,
    pub anonymous: Arc<FixedWindowLimiter>,
    pub recorder: RequestRecorder,
    /// Install [`trusted_identity_headers`] in front of the `/api` routes
    pub trust_identity_headers: bool,
}

/// `/health` behind the fixed-window limiter, `/api/{*path}` behind the
/// tiered limiter and the recorder.
///
/// Identity headers never reach `/health`, so its limiter stays keyed by
/// peer address.
pub fn build_router(state: AppState) -> Router {
    let health = Router::new()
        .route("/health", get(health))
        .route_layer(from_fn_with_state(state.anonymous, fixed_window_limit));

    let mut api = Router::new()
        .route("/api/{*path}", any(echo))
        .route_layer(from_fn_with_state(state.limiter, tiered_rate_limit))
        .layer(from_fn_with_state(state.recorder, record_requests));

    if state.trust_identity_headers {
        api = api.layer(from_fn(trusted_identity_headers));
    }

    health.merge(api)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn echo(request: Request) -> Json<Value> {
    let user = request.extensions().get::<AuthUser>();
    Json(json!({
        "path": request.uri().path(),
        "method": request.method().as_str(),
        "user": user.map(|u| u.id.clone()),
        "role": user.and_then(|u| u.role.as_ref()).map(|r| r.to_string()),
    }))
}
