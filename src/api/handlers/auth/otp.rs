//! Email OTP challenge issuance.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};

use super::audit::{self, AuthMethod};
use super::rate_limit::RateLimitAction;
use super::state::AuthState;
use super::types::{ErrorBody, OtpChallengeResponse, OtpCodeRequest};
use super::utils::{
    error_response, extract_client_ip, extract_user_agent, normalize_email, parse_ip, request_id,
    valid_email,
};

#[utoipa::path(
    post,
    path = "/auth/otp/request",
    request_body = OtpCodeRequest,
    responses(
        (status = 200, description = "Challenge issued and code queued for email delivery", body = OtpChallengeResponse),
        (status = 400, description = "Validation error", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
        (status = 500, description = "Storage failure", body = ErrorBody)
    ),
    tag = "auth"
)]
/// Issue a one-time-code challenge for an email address.
///
/// The response is identical whether or not the address belongs to a known
/// account; the user is only resolved when the code is redeemed.
pub async fn otp_request(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<OtpCodeRequest>>,
) -> impl IntoResponse {
    let request: OtpCodeRequest = match payload {
        Some(Json(payload)) => payload,
        None => return error_response(StatusCode::BAD_REQUEST, "invalid_request"),
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request");
    }

    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    let request_id = request_id(&headers);

    let limited = auth_state
        .rate_limiter()
        .check_email(RateLimitAction::OtpRequestPerEmail, &email)
        .is_limited()
        || auth_state
            .rate_limiter()
            .check_client(
                RateLimitAction::OtpRequestPerClient,
                client_ip.as_deref(),
                user_agent.as_deref(),
            )
            .is_limited();
    if limited {
        audit::record_attempt(
            &pool,
            auth_state.fingerprint_salt(),
            AuthMethod::OtpRequest,
            "rate_limited",
            Some(&email),
            client_ip.as_deref(),
            None,
            &request_id,
        )
        .await;
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    match auth_state
        .otp()
        .request_code(
            &email,
            parse_ip(client_ip.as_deref()),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(challenge) => {
            info!(request_id = %request_id, "otp challenge issued");
            audit::record_attempt(
                &pool,
                auth_state.fingerprint_salt(),
                AuthMethod::OtpRequest,
                "issued",
                Some(&email),
                client_ip.as_deref(),
                None,
                &request_id,
            )
            .await;
            (
                StatusCode::OK,
                Json(OtpChallengeResponse {
                    challenge_token: challenge.challenge_token,
                    expires_in: challenge.expires_in,
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!("Failed to issue otp challenge: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::rate_limit::SlidingWindowLimiter;
    use super::super::test_support;
    use super::*;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, header::CONTENT_TYPE},
        routing::post,
    };
    use tower::ServiceExt;

    fn app(state: Arc<AuthState>) -> Router {
        Router::new()
            .route("/auth/otp/request", post(otp_request))
            .layer(Extension(state))
            .layer(Extension(test_support::unreachable_pool()))
    }

    fn otp_request_body(email: &str) -> Body {
        Body::from(format!(r#"{{"email":"{email}"}}"#))
    }

    async fn error_code(response: axum::response::Response) -> anyhow::Result<String> {
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let payload: serde_json::Value = serde_json::from_slice(&body)?;
        Ok(payload
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    #[tokio::test]
    async fn missing_payload_is_invalid_request() -> anyhow::Result<()> {
        let app = app(Arc::new(test_support::auth_state()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/otp/request")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await?, "invalid_request");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_email_is_invalid_request() -> anyhow::Result<()> {
        let app = app(Arc::new(test_support::auth_state()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/otp/request")
                    .header(CONTENT_TYPE, "application/json")
                    .body(otp_request_body("not-an-email"))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await?, "invalid_request");
        Ok(())
    }

    #[tokio::test]
    async fn fourth_request_for_one_email_is_rate_limited() -> anyhow::Result<()> {
        let limiter = Arc::new(SlidingWindowLimiter::new("test-salt"));
        let state = Arc::new(test_support::auth_state_with_limiter(limiter));

        // First three burn the per-email budget; storage is unreachable so
        // each comes back 500 after passing the limiter.
        for _ in 0..3 {
            let response = app(Arc::clone(&state))
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/auth/otp/request")
                        .header(CONTENT_TYPE, "application/json")
                        .body(otp_request_body("alice@example.com"))?,
                )
                .await?;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }

        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/otp/request")
                    .header(CONTENT_TYPE, "application/json")
                    .body(otp_request_body("alice@example.com"))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error_code(response).await?, "rate_limited");
        Ok(())
    }

    #[tokio::test]
    async fn storage_failure_is_internal_error() -> anyhow::Result<()> {
        let app = app(Arc::new(test_support::auth_state()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/otp/request")
                    .header(CONTENT_TYPE, "application/json")
                    .body(otp_request_body("alice@example.com"))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(response).await?, "internal_error");
        Ok(())
    }
}
