// =============================================================================
// Shared-token authentication — admin surface and inbound webhook
// =============================================================================
//
// Two independent tokens guard the relay:
//
//   - `RELAY_ADMIN_TOKEN` (environment, required) protects `/api/v1/*` and
//     the WebSocket upgrade. It is re-read on every request so rotation does
//     not require a restart. Failures are 403.
//   - `inbound_token` (config, optional) protects `POST /webhook/in`; when it
//     is unset the ingress is open. Failures are 401 so signal producers can
//     tell a credential problem from an authorization one.
//
// Both checks compare in constant time.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;

/// Compare two byte slices in constant time. The comparison always examines
/// every byte of both slices even when a mismatch is found early, preventing
/// timing side-channels. A length mismatch leaks only that lengths differ,
/// which is acceptable here (the caller controls the expected token length).
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Pull the credential out of an `Authorization: Bearer <token>` header.
/// Any other scheme (or a missing/non-UTF-8 header) yields `None`.
fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// =============================================================================
// Rejection
// =============================================================================

/// Rejection shared by both token extractors.
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl AuthRejection {
    fn forbidden(message: &'static str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message,
        }
    }

    fn unauthorized(message: &'static str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message,
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

// =============================================================================
// Admin extractor
// =============================================================================

/// Axum extractor validating the admin Bearer token against
/// `RELAY_ADMIN_TOKEN`. Yields the raw token string for audit logging; on
/// failure the request is short-circuited with a 403 before the handler body
/// executes.
pub struct AuthBearer(pub String);

impl<S> FromRequestParts<S> for AuthBearer
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("RELAY_ADMIN_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("RELAY_ADMIN_TOKEN is not set — all authenticated requests will be rejected");
            return Err(AuthRejection::forbidden("Server authentication not configured"));
        }

        let Some(token) = bearer_token(parts) else {
            warn!("Missing or malformed Authorization header");
            return Err(AuthRejection::forbidden(
                "Missing or invalid authorization token",
            ));
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("Invalid admin token presented");
            return Err(AuthRejection::forbidden("Invalid authorization token"));
        }

        Ok(AuthBearer(token.to_string()))
    }
}

// =============================================================================
// Ingress extractor
// =============================================================================

/// Axum extractor guarding `POST /webhook/in` with the optional shared
/// inbound token from the relay config.
///
/// When no inbound token is configured the gate is open and every request
/// passes. When one is configured, the request must carry it as a Bearer
/// credential; anything else is a 401 and the signal is never parsed or
/// persisted.
pub struct InboundAuth;

impl FromRequestParts<Arc<AppState>> for InboundAuth {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.read().inbound_token.clone() else {
            return Ok(Self);
        };

        match bearer_token(parts) {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(Self),
            _ => {
                warn!("inbound webhook rejected: missing or invalid shared token");
                Err(AuthRejection::unauthorized("invalid inbound token"))
            }
        }
    }
}

// =============================================================================
// Token validation helper (for WebSocket query-param auth)
// =============================================================================

/// Validate an admin token string against `RELAY_ADMIN_TOKEN`. Intended for
/// contexts where the Axum extractor is not usable (the WebSocket upgrade,
/// where the token arrives as a query parameter).
pub fn validate_token(token: &str) -> bool {
    let expected = std::env::var("RELAY_ADMIN_TOKEN").unwrap_or_default();
    if expected.is_empty() {
        return false;
    }
    constant_time_eq(token.as_bytes(), expected.as_bytes())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::store::memory::MemoryStore;
    use axum::http::Request;

    fn parts_with_auth(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/webhook/in");
        if let Some(value) = header {
            builder = builder.header("authorization", value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn state_with_inbound(token: Option<&str>) -> Arc<AppState> {
        let config = RelayConfig {
            inbound_token: token.map(str::to_string),
            ..RelayConfig::default()
        };
        Arc::new(AppState::new(config, Arc::new(MemoryStore::new())))
    }

    #[test]
    fn bearer_token_accepts_only_the_bearer_scheme() {
        assert_eq!(
            bearer_token(&parts_with_auth(Some("Bearer hook-token"))),
            Some("hook-token")
        );
        assert_eq!(bearer_token(&parts_with_auth(Some("Basic hook-token"))), None);
        assert_eq!(bearer_token(&parts_with_auth(Some("hook-token"))), None);
        assert_eq!(bearer_token(&parts_with_auth(None)), None);
    }

    #[tokio::test]
    async fn open_ingress_passes_without_any_credential() {
        let state = state_with_inbound(None);
        let mut parts = parts_with_auth(None);
        assert!(InboundAuth::from_request_parts(&mut parts, &state)
            .await
            .is_ok());

        // Even a stray header is fine when no token is configured.
        let mut parts = parts_with_auth(Some("Bearer whatever"));
        assert!(InboundAuth::from_request_parts(&mut parts, &state)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn configured_ingress_requires_the_exact_token() {
        let state = state_with_inbound(Some("hook-token"));

        let mut ok = parts_with_auth(Some("Bearer hook-token"));
        assert!(InboundAuth::from_request_parts(&mut ok, &state).await.is_ok());

        let mut missing = parts_with_auth(None);
        assert!(InboundAuth::from_request_parts(&mut missing, &state)
            .await
            .is_err());

        let mut wrong = parts_with_auth(Some("Bearer other-token"));
        assert!(InboundAuth::from_request_parts(&mut wrong, &state)
            .await
            .is_err());

        let mut bad_scheme = parts_with_auth(Some("hook-token"));
        assert!(InboundAuth::from_request_parts(&mut bad_scheme, &state)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn inbound_rejection_is_a_401() {
        let state = state_with_inbound(Some("hook-token"));
        let mut parts = parts_with_auth(None);
        let rejection = InboundAuth::from_request_parts(&mut parts, &state)
            .await
            .err()
            .expect("gate must reject");
        assert_eq!(rejection.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn token_comparison_rejects_near_misses() {
        assert!(constant_time_eq(b"hook-token", b"hook-token"));
        assert!(!constant_time_eq(b"hook-token", b"hook-tokeN"));
        assert!(!constant_time_eq(b"hook-token", b"hook-toke"));
        assert!(!constant_time_eq(b"hook-token", b"hook-token2"));
    }
}
