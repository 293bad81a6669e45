//! Passkey endpoints: registration for signed-in users, discoverable
//! authentication for everyone else, and credential management.
//!
//! Security boundaries:
//! - The Origin header is matched against the configured allow-list on every
//!   ceremony, and the ceremony state pins the origin that started it.
//! - Challenges are single-use and expire quickly.
//! - Raw `WebAuthn` payloads and credential material are never logged.
//! - Authentication failures share one external 401; the reason (including a
//!   counter that failed to advance) stays in logs and the audit trail.

use axum::{
    Json,
    body::Bytes,
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential};

use crate::webauthn::{PasskeyAuthenticationError, PasskeyRegistrationError, PasskeySummary};

use super::audit::{self, AuthMethod};
use super::principal::require_auth;
use super::rate_limit::RateLimitAction;
use super::state::AuthState;
use super::token::issued_response;
use super::types::{ErrorBody, TokenResponse};
use super::utils::{
    HandlerError, error_response, extract_client_ip, extract_user_agent, parse_ip, request_id,
};

const MAX_WEBAUTHN_JSON_BYTES: usize = 32 * 1024;

#[derive(Debug, Serialize, ToSchema)]
pub struct PasskeyOptionsResponse {
    pub challenge_token: String,
    pub options: serde_json::Value,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct PasskeyRegisterVerifyRequest {
    pub challenge: String,
    pub response: serde_json::Value,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct PasskeyAuthenticateVerifyRequest {
    pub challenge: String,
    pub response: serde_json::Value,
}

/// Wire shape for a stored credential. Passkey items use camelCase keys.
#[derive(Debug, Serialize, ToSchema)]
pub struct PasskeyItem {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "lastUsedAt", skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
}

impl From<PasskeySummary> for PasskeyItem {
    fn from(summary: PasskeySummary) -> Self {
        Self {
            id: summary.id.to_string(),
            name: summary.name,
            created_at: summary.created_at.to_rfc3339(),
            last_used_at: summary.last_used_at.map(|at| at.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PasskeyRegisterVerifyResponse {
    pub ok: bool,
    pub passkey: PasskeyItem,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PasskeyListResponse {
    pub passkeys: Vec<PasskeyItem>,
}

#[utoipa::path(
    post,
    path = "/auth/passkey/register/options",
    responses(
        (status = 200, description = "Registration challenge issued", body = PasskeyOptionsResponse),
        (status = 400, description = "Origin missing or not allowed", body = ErrorBody),
        (status = 401, description = "Bearer token missing or invalid", body = ErrorBody),
        (status = 500, description = "Storage failure", body = ErrorBody)
    ),
    tag = "auth"
)]
/// Issue a registration challenge bound to the authenticated user.
pub async fn passkey_register_options(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let request_id = request_id(&headers);
    let principal = match require_auth(&headers, &auth_state).await {
        Ok(principal) => principal,
        Err(status) => return auth_error(status),
    };
    let origin = match extract_origin(&headers, &auth_state) {
        Ok(origin) => origin,
        Err(response) => return *response,
    };

    info!(
        user_id = %principal.user_id,
        request_id = %request_id,
        "passkey register options requested"
    );

    match auth_state
        .passkeys()
        .register_begin(principal.user_id, &origin)
        .await
    {
        Ok((challenge_token, challenge)) => (
            StatusCode::OK,
            Json(PasskeyOptionsResponse {
                challenge_token,
                options: serde_json::to_value(challenge).unwrap_or_default(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(
                user_id = %principal.user_id,
                request_id = %request_id,
                "failed to start passkey registration: {err}"
            );
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

#[utoipa::path(
    post,
    path = "/auth/passkey/register/verify",
    request_body = PasskeyRegisterVerifyRequest,
    responses(
        (status = 200, description = "Credential registered", body = PasskeyRegisterVerifyResponse),
        (status = 400, description = "Invalid ceremony or attestation", body = ErrorBody),
        (status = 401, description = "Bearer token missing or invalid", body = ErrorBody),
        (status = 410, description = "Challenge expired or already consumed", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
        (status = 500, description = "Storage failure", body = ErrorBody)
    ),
    tag = "auth"
)]
/// Verify an attestation response and store the new credential.
pub async fn passkey_register_verify(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    body: Bytes,
) -> impl IntoResponse {
    let request_id = request_id(&headers);
    let principal = match require_auth(&headers, &auth_state).await {
        Ok(principal) => principal,
        Err(status) => return auth_error(status),
    };
    let request = match parse_register_verify(&body) {
        Ok(parsed) => parsed,
        Err(response) => return *response,
    };
    let origin = match extract_origin(&headers, &auth_state) {
        Ok(origin) => origin,
        Err(response) => return *response,
    };

    let client_ip = extract_client_ip(&headers);
    if auth_state
        .rate_limiter()
        .check_user(RateLimitAction::PasskeyRegisterPerUser, principal.user_id)
        .is_limited()
    {
        audit::record_attempt(
            &pool,
            auth_state.fingerprint_salt(),
            AuthMethod::PasskeyRegister,
            "rate_limited",
            None,
            client_ip.as_deref(),
            Some(principal.user_id),
            &request_id,
        )
        .await;
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    let credential: RegisterPublicKeyCredential = match serde_json::from_value(request.response) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                user_id = %principal.user_id,
                request_id = %request_id,
                "invalid webauthn attestation payload: {err}"
            );
            return error_response(StatusCode::BAD_REQUEST, "invalid_request");
        }
    };

    match auth_state
        .passkeys()
        .register_finish(
            &request.challenge,
            principal.user_id,
            &origin,
            &credential,
            request.name.as_deref(),
        )
        .await
    {
        Ok(summary) => {
            info!(
                user_id = %principal.user_id,
                request_id = %request_id,
                "passkey registered"
            );
            audit::record_attempt(
                &pool,
                auth_state.fingerprint_salt(),
                AuthMethod::PasskeyRegister,
                "registered",
                None,
                client_ip.as_deref(),
                Some(principal.user_id),
                &request_id,
            )
            .await;
            (
                StatusCode::OK,
                Json(PasskeyRegisterVerifyResponse {
                    ok: true,
                    passkey: summary.into(),
                }),
            )
                .into_response()
        }
        Err(err) => {
            register_failure(
                &pool,
                &auth_state,
                principal.user_id,
                &request_id,
                client_ip.as_deref(),
                &err,
            )
            .await
        }
    }
}

async fn register_failure(
    pool: &PgPool,
    auth_state: &AuthState,
    user_id: Uuid,
    request_id: &str,
    client_ip: Option<&str>,
    err: &PasskeyRegistrationError,
) -> axum::response::Response {
    let (status, error_code, outcome) = match err {
        PasskeyRegistrationError::Expired => (StatusCode::GONE, "expired", "expired"),
        PasskeyRegistrationError::CredentialExists => {
            (StatusCode::BAD_REQUEST, "credential_exists", "duplicate")
        }
        PasskeyRegistrationError::NotFound => {
            (StatusCode::BAD_REQUEST, "invalid_request", "not_found")
        }
        PasskeyRegistrationError::UserMismatch => {
            (StatusCode::BAD_REQUEST, "invalid_request", "user_mismatch")
        }
        PasskeyRegistrationError::OriginMismatch => {
            (StatusCode::BAD_REQUEST, "invalid_request", "origin_mismatch")
        }
        PasskeyRegistrationError::Webauthn(_) => {
            (StatusCode::BAD_REQUEST, "invalid_request", "attestation_failed")
        }
        PasskeyRegistrationError::Storage(inner) => {
            error!(
                user_id = %user_id,
                request_id = %request_id,
                "passkey registration storage failure: {inner}"
            );
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    };

    warn!(
        user_id = %user_id,
        request_id = %request_id,
        "passkey registration rejected: {err}"
    );
    auth_state.pause_on_failure().await;
    audit::record_attempt(
        pool,
        auth_state.fingerprint_salt(),
        AuthMethod::PasskeyRegister,
        outcome,
        None,
        client_ip,
        Some(user_id),
        request_id,
    )
    .await;
    error_response(status, error_code)
}

#[utoipa::path(
    post,
    path = "/auth/passkey/authenticate/options",
    responses(
        (status = 200, description = "Discoverable challenge issued", body = PasskeyOptionsResponse),
        (status = 400, description = "Origin missing or not allowed", body = ErrorBody),
        (status = 500, description = "Storage failure", body = ErrorBody)
    ),
    tag = "auth"
)]
/// Issue a discoverable authentication challenge. No account is named; the
/// authenticator's answer identifies the credential.
pub async fn passkey_authenticate_options(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let request_id = request_id(&headers);
    let origin = match extract_origin(&headers, &auth_state) {
        Ok(origin) => origin,
        Err(response) => return *response,
    };

    match auth_state.passkeys().authenticate_begin(&origin).await {
        Ok((challenge_token, challenge)) => (
            StatusCode::OK,
            Json(PasskeyOptionsResponse {
                challenge_token,
                options: serde_json::to_value(challenge).unwrap_or_default(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(request_id = %request_id, "failed to start passkey authentication: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

#[utoipa::path(
    post,
    path = "/auth/passkey/authenticate/verify",
    request_body = PasskeyAuthenticateVerifyRequest,
    responses(
        (status = 200, description = "Assertion verified, tokens issued", body = TokenResponse),
        (status = 400, description = "Malformed ceremony payload", body = ErrorBody),
        (status = 401, description = "Assertion rejected", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
        (status = 500, description = "Storage failure", body = ErrorBody)
    ),
    tag = "auth"
)]
/// Verify an assertion and sign the caller in as the credential's owner.
pub async fn passkey_authenticate_verify(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    body: Bytes,
) -> impl IntoResponse {
    let request_id = request_id(&headers);
    let request = match parse_authenticate_verify(&body) {
        Ok(parsed) => parsed,
        Err(response) => return *response,
    };
    let origin = match extract_origin(&headers, &auth_state) {
        Ok(origin) => origin,
        Err(response) => return *response,
    };

    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);
    if auth_state
        .rate_limiter()
        .check_client(
            RateLimitAction::PasskeyAuthenticatePerClient,
            client_ip.as_deref(),
            user_agent.as_deref(),
        )
        .is_limited()
    {
        audit::record_attempt(
            &pool,
            auth_state.fingerprint_salt(),
            AuthMethod::Passkey,
            "rate_limited",
            None,
            client_ip.as_deref(),
            None,
            &request_id,
        )
        .await;
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    let credential: PublicKeyCredential = match serde_json::from_value(request.response) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(request_id = %request_id, "invalid webauthn assertion payload: {err}");
            return error_response(StatusCode::BAD_REQUEST, "invalid_request");
        }
    };

    let authenticated = match auth_state
        .passkeys()
        .authenticate_finish(&request.challenge, &origin, &credential)
        .await
    {
        Ok(authenticated) => authenticated,
        Err(err) => {
            return authenticate_failure(
                &pool,
                &auth_state,
                &request_id,
                client_ip.as_deref(),
                &err,
            )
            .await;
        }
    };

    let tokens = match auth_state
        .tokens()
        .issue(
            authenticated.user_id,
            parse_ip(client_ip.as_deref()),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(tokens) => tokens,
        Err(err) => {
            error!(
                user_id = %authenticated.user_id,
                request_id = %request_id,
                "failed to issue tokens after passkey authentication: {err}"
            );
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    };

    info!(
        user_id = %authenticated.user_id,
        passkey_id = %authenticated.passkey_id,
        request_id = %request_id,
        "passkey authentication verified"
    );
    audit::record_attempt(
        &pool,
        auth_state.fingerprint_salt(),
        AuthMethod::Passkey,
        "verified",
        None,
        client_ip.as_deref(),
        Some(authenticated.user_id),
        &request_id,
    )
    .await;
    issued_response(auth_state.config(), tokens)
}

async fn authenticate_failure(
    pool: &PgPool,
    auth_state: &AuthState,
    request_id: &str,
    client_ip: Option<&str>,
    err: &PasskeyAuthenticationError,
) -> axum::response::Response {
    // The ceremony names no user until it succeeds, so failures are keyed by
    // client only.
    let outcome = match err {
        PasskeyAuthenticationError::NotFound => "not_found",
        PasskeyAuthenticationError::Expired => "expired",
        PasskeyAuthenticationError::UnknownCredential => "unknown_credential",
        PasskeyAuthenticationError::UserMismatch => "user_mismatch",
        PasskeyAuthenticationError::CounterRegression => "counter_regression",
        PasskeyAuthenticationError::OriginMismatch => {
            warn!(request_id = %request_id, "passkey authentication origin mismatch");
            return error_response(StatusCode::BAD_REQUEST, "invalid_request");
        }
        PasskeyAuthenticationError::Webauthn(_) => "assertion_failed",
        PasskeyAuthenticationError::Storage(inner) => {
            error!(request_id = %request_id, "passkey authentication storage failure: {inner}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    };

    warn!(request_id = %request_id, "passkey authentication rejected: {err}");
    auth_state.pause_on_failure().await;
    audit::record_attempt(
        pool,
        auth_state.fingerprint_salt(),
        AuthMethod::Passkey,
        outcome,
        None,
        client_ip,
        None,
        request_id,
    )
    .await;
    error_response(StatusCode::UNAUTHORIZED, "unauthorized")
}

#[utoipa::path(
    get,
    path = "/auth/passkeys",
    responses(
        (status = 200, description = "Stored credentials for the caller", body = PasskeyListResponse),
        (status = 401, description = "Bearer token missing or invalid", body = ErrorBody),
        (status = 500, description = "Storage failure", body = ErrorBody)
    ),
    tag = "auth"
)]
/// List the caller's registered credentials.
pub async fn passkey_list(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let request_id = request_id(&headers);
    let principal = match require_auth(&headers, &auth_state).await {
        Ok(principal) => principal,
        Err(status) => return auth_error(status),
    };

    match auth_state.passkeys().list_passkeys(principal.user_id).await {
        Ok(summaries) => (
            StatusCode::OK,
            Json(PasskeyListResponse {
                passkeys: summaries.into_iter().map(PasskeyItem::from).collect(),
            }),
        )
            .into_response(),
        Err(err) => {
            error!(
                user_id = %principal.user_id,
                request_id = %request_id,
                "failed to list passkeys: {err}"
            );
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

#[utoipa::path(
    delete,
    path = "/auth/passkeys/{passkey_id}",
    params(
        ("passkey_id" = String, Path, description = "Credential id to remove")
    ),
    responses(
        (status = 204, description = "Credential removed"),
        (status = 400, description = "Malformed credential id", body = ErrorBody),
        (status = 401, description = "Bearer token missing or invalid", body = ErrorBody),
        (status = 404, description = "No such credential for this user", body = ErrorBody),
        (status = 500, description = "Storage failure", body = ErrorBody)
    ),
    tag = "auth"
)]
/// Remove one of the caller's credentials.
pub async fn passkey_delete(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    Path(passkey_id): Path<String>,
) -> impl IntoResponse {
    let request_id = request_id(&headers);
    let principal = match require_auth(&headers, &auth_state).await {
        Ok(principal) => principal,
        Err(status) => return auth_error(status),
    };
    let Ok(passkey_id) = Uuid::parse_str(&passkey_id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request");
    };

    match auth_state
        .passkeys()
        .delete_passkey(principal.user_id, passkey_id)
        .await
    {
        Ok(true) => {
            info!(
                user_id = %principal.user_id,
                passkey_id = %passkey_id,
                request_id = %request_id,
                "passkey deleted"
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(err) => {
            error!(
                user_id = %principal.user_id,
                request_id = %request_id,
                "failed to delete passkey: {err}"
            );
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

fn auth_error(status: StatusCode) -> axum::response::Response {
    if status == StatusCode::UNAUTHORIZED {
        error_response(status, "unauthorized")
    } else {
        error_response(status, "internal_error")
    }
}

fn parse_register_verify(body: &Bytes) -> Result<PasskeyRegisterVerifyRequest, HandlerError> {
    if body.len() > MAX_WEBAUTHN_JSON_BYTES {
        return Err(Box::new(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
        )));
    }
    serde_json::from_slice(body)
        .map_err(|_| Box::new(error_response(StatusCode::BAD_REQUEST, "invalid_request")))
}

fn parse_authenticate_verify(
    body: &Bytes,
) -> Result<PasskeyAuthenticateVerifyRequest, HandlerError> {
    if body.len() > MAX_WEBAUTHN_JSON_BYTES {
        return Err(Box::new(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
        )));
    }
    serde_json::from_slice(body)
        .map_err(|_| Box::new(error_response(StatusCode::BAD_REQUEST, "invalid_request")))
}

fn extract_origin(headers: &HeaderMap, auth_state: &AuthState) -> Result<String, HandlerError> {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Box::new(error_response(StatusCode::BAD_REQUEST, "invalid_request")))?;

    auth_state
        .passkeys()
        .match_origin(origin)
        .ok_or_else(|| Box::new(error_response(StatusCode::BAD_REQUEST, "origin_not_allowed")))
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
        routing::{delete, get, post},
    };
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    fn app(state: Arc<AuthState>) -> Router {
        Router::new()
            .route(
                "/auth/passkey/register/options",
                post(passkey_register_options),
            )
            .route(
                "/auth/passkey/authenticate/options",
                post(passkey_authenticate_options),
            )
            .route(
                "/auth/passkey/authenticate/verify",
                post(passkey_authenticate_verify),
            )
            .route("/auth/passkeys", get(passkey_list))
            .route("/auth/passkeys/:passkey_id", delete(passkey_delete))
            .layer(Extension(state))
            .layer(Extension(test_support::unreachable_pool()))
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

    #[test]
    fn passkey_item_uses_camel_case_keys() -> anyhow::Result<()> {
        let summary = PasskeySummary {
            id: Uuid::nil(),
            name: Some("laptop".to_string()),
            created_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            last_used_at: None,
        };
        let value = serde_json::to_value(PasskeyItem::from(summary))?;
        assert!(value.get("createdAt").is_some());
        assert!(value.get("created_at").is_none());
        // Unused credentials omit lastUsedAt entirely.
        assert!(value.get("lastUsedAt").is_none());
        Ok(())
    }

    #[test]
    fn register_verify_response_shape() -> anyhow::Result<()> {
        let summary = PasskeySummary {
            id: Uuid::nil(),
            name: None,
            created_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            last_used_at: None,
        };
        let value = serde_json::to_value(PasskeyRegisterVerifyResponse {
            ok: true,
            passkey: summary.into(),
        })?;
        assert_eq!(
            value.get("ok").and_then(serde_json::Value::as_bool),
            Some(true)
        );
        assert!(
            value
                .get("passkey")
                .and_then(|passkey| passkey.get("id"))
                .is_some()
        );
        Ok(())
    }

    #[test]
    fn oversized_payload_is_rejected_before_parsing() {
        let body = Bytes::from(vec![b'a'; MAX_WEBAUTHN_JSON_BYTES + 1]);
        let response = match parse_register_verify(&body) {
            Ok(_) => panic!("oversized body must not parse"),
            Err(response) => *response,
        };
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn verify_requests_reject_unknown_fields() {
        let body = Bytes::from(r#"{"challenge":"c","response":{},"extra":1}"#);
        assert!(parse_authenticate_verify(&body).is_err());

        let body = Bytes::from(r#"{"challenge":"c","response":{}}"#);
        assert!(parse_authenticate_verify(&body).is_ok());
    }

    #[tokio::test]
    async fn register_options_requires_bearer() -> anyhow::Result<()> {
        let app = app(Arc::new(test_support::auth_state()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/passkey/register/options")
                    .header("Origin", test_support::TEST_ORIGIN)
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(response).await?, "unauthorized");
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_options_rejects_unknown_origin() -> anyhow::Result<()> {
        let app = app(Arc::new(test_support::auth_state()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/passkey/authenticate/options")
                    .header("Origin", "https://evil.example")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await?, "origin_not_allowed");
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_options_requires_origin_header() -> anyhow::Result<()> {
        let app = app(Arc::new(test_support::auth_state()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/passkey/authenticate/options")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await?, "invalid_request");
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_verify_rejects_malformed_assertion() -> anyhow::Result<()> {
        let app = app(Arc::new(test_support::auth_state()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/passkey/authenticate/verify")
                    .header("Origin", test_support::TEST_ORIGIN)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"challenge":"c","response":42}"#))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await?, "invalid_request");
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_verify_rate_limits_per_client() -> anyhow::Result<()> {
        let limiter = Arc::new(SlidingWindowLimiter::new("test-salt"));
        let state = Arc::new(test_support::auth_state_with_limiter(limiter));

        // Ten malformed attempts consume the per-client budget.
        for _ in 0..10 {
            let response = app(Arc::clone(&state))
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/auth/passkey/authenticate/verify")
                        .header("Origin", test_support::TEST_ORIGIN)
                        .header("x-forwarded-for", "9.8.7.6")
                        .header(CONTENT_TYPE, "application/json")
                        .body(Body::from(r#"{"challenge":"c","response":42}"#))?,
                )
                .await?;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let response = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/passkey/authenticate/verify")
                    .header("Origin", test_support::TEST_ORIGIN)
                    .header("x-forwarded-for", "9.8.7.6")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"challenge":"c","response":42}"#))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(error_code(response).await?, "rate_limited");
        Ok(())
    }

    #[tokio::test]
    async fn delete_requires_bearer() -> anyhow::Result<()> {
        let app = app(Arc::new(test_support::auth_state()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/auth/passkeys/not-a-uuid")
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }
}
