//! Authenticated principal extraction for bearer-protected endpoints.

use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use tracing::error;

use super::state::AuthState;

/// Authenticated user context derived from a bearer access token.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: uuid::Uuid,
    pub jti: uuid::Uuid,
}

/// Resolve the Authorization header into a principal, or return 401 for
/// missing, malformed, expired, and revoked tokens alike.
pub async fn require_auth(headers: &HeaderMap, state: &AuthState) -> Result<Principal, StatusCode> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    match state.tokens().authenticate_access(&token).await {
        Ok(Some(identity)) => Ok(Principal {
            user_id: identity.user_id,
            jti: identity.jti,
        }),
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            error!("access token check failed: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub(super) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support;
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extract_bearer_token_accepts_both_cases() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(extract_bearer_token(&headers), Some("abc".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(extract_bearer_token(&headers), Some("abc".to_string()));
    }

    #[test]
    fn extract_bearer_token_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn require_auth_rejects_missing_header() {
        let state = test_support::auth_state();
        let headers = HeaderMap::new();
        let result = require_auth(&headers, &state).await;
        assert!(matches!(result, Err(StatusCode::UNAUTHORIZED)));
    }

    #[tokio::test]
    async fn require_auth_rejects_garbage_token() {
        let state = test_support::auth_state();
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer not-a-paseto"),
        );
        let result = require_auth(&headers, &state).await;
        assert!(matches!(result, Err(StatusCode::UNAUTHORIZED)));
    }
}
