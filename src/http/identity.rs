//! Caller identity from headers set by a trusted upstream.
//!
//! Authentication itself happens elsewhere. A gateway in front of this
//! service forwards the authenticated user in `X-User-Id` and `X-User-Role`;
//! this middleware turns those into an [`AuthUser`] request extension.
//! Only install it when every request really does pass through that gateway.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, trace};

use crate::ratelimit::{AuthUser, Role};

pub const X_USER_ID: &str = "x-user-id";
pub const X_USER_ROLE: &str = "x-user-role";

/// Build an [`AuthUser`] from identity headers, if a user id is present.
///
/// An unparseable role is dropped; the user still counts as authenticated.
pub fn auth_user_from_headers(headers: &HeaderMap) -> Option<AuthUser> {
    let id = headers
        .get(X_USER_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())?;

    let role = headers
        .get(X_USER_ROLE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| match raw.parse::<Role>() {
            Ok(role) => Some(role),
            Err(e) => {
                debug!(error = %e, "Ignoring unparseable role header");
                None
            }
        });

    Some(AuthUser::new(id, role))
}

/// Insert an [`AuthUser`] from identity headers unless one is already set.
pub async fn trusted_identity_headers(mut request: Request, next: Next) -> Response {
    if request.extensions().get::<AuthUser>().is_none() {
        if let Some(user) = auth_user_from_headers(request.headers()) {
            trace!(user_id = %user.id, role = ?user.role, "Identity taken from headers");
            request.extensions_mut().insert(user);
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_user_and_role() {
        let mut headers = HeaderMap::new();
        headers.insert(X_USER_ID, HeaderValue::from_static("42"));
        headers.insert(X_USER_ROLE, HeaderValue::from_static("manager"));

        let user = auth_user_from_headers(&headers).unwrap();
        assert_eq!(user, AuthUser::new("42", Some(Role::Manager)));
    }

    #[test]
    fn test_missing_or_blank_id() {
        let mut headers = HeaderMap::new();
        assert!(auth_user_from_headers(&headers).is_none());

        headers.insert(X_USER_ID, HeaderValue::from_static("  "));
        headers.insert(X_USER_ROLE, HeaderValue::from_static("ADMIN"));
        assert!(auth_user_from_headers(&headers).is_none());
    }

    #[test]
    fn test_blank_role_is_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(X_USER_ID, HeaderValue::from_static("7"));
        headers.insert(X_USER_ROLE, HeaderValue::from_static(""));

        let user = auth_user_from_headers(&headers).unwrap();
        assert_eq!(user.role, None);
    }
}
