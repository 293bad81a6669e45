//! The token endpoint: OTP redemption and refresh rotation.
//!
//! Both grants answer with a short-lived access token in the body and a
//! rotating refresh token in an `HttpOnly` cookie scoped to `/auth`. Refresh
//! failures all look alike from outside; reuse detection is visible only in
//! the audit trail and logs.

use axum::{
    Json,
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{InvalidHeaderValue, SET_COOKIE},
    },
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::otp::VerifyOutcome;
use crate::token::{IssuedTokens, RefreshOutcome};

use super::audit::{self, AuthMethod};
use super::principal::require_auth;
use super::rate_limit::RateLimitAction;
use super::state::{AuthConfig, AuthState};
use super::types::{ErrorBody, TokenRequest, TokenResponse};
use super::utils::{
    error_response, extract_client_ip, extract_user_agent, normalize_email, parse_ip, request_id,
    valid_email,
};

const REFRESH_COOKIE_NAME: &str = "refresh_token";

#[utoipa::path(
    post,
    path = "/auth/token",
    request_body = TokenRequest,
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Malformed request or wrong code", body = ErrorBody),
        (status = 401, description = "Refresh token missing, unknown, or revoked", body = ErrorBody),
        (status = 410, description = "Challenge expired or already consumed", body = ErrorBody),
        (status = 429, description = "Attempt budget or rate limit exceeded", body = ErrorBody),
        (status = 500, description = "Storage failure", body = ErrorBody)
    ),
    tag = "auth"
)]
/// Exchange a grant for an access token and a rotating refresh cookie.
pub async fn token(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<TokenRequest>>,
) -> impl IntoResponse {
    let request: TokenRequest = match payload {
        Some(Json(payload)) => payload,
        None => return error_response(StatusCode::BAD_REQUEST, "invalid_request"),
    };

    match request {
        TokenRequest::EmailOtp {
            challenge_token,
            code,
            email,
        } => grant_email_otp(&headers, &pool, &auth_state, &challenge_token, &code, &email).await,
        TokenRequest::RefreshToken => grant_refresh_token(&headers, &pool, &auth_state).await,
    }
}

async fn grant_email_otp(
    headers: &HeaderMap,
    pool: &PgPool,
    auth_state: &AuthState,
    challenge_token: &str,
    code: &str,
    email: &str,
) -> axum::response::Response {
    let email = normalize_email(email);
    if !valid_email(&email) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request");
    }

    let client_ip = extract_client_ip(headers);
    let user_agent = extract_user_agent(headers);
    let request_id = request_id(headers);

    // The limiter runs before verification, so a limited caller learns
    // nothing about code correctness.
    if auth_state
        .rate_limiter()
        .check_email(RateLimitAction::TokenOtpPerEmail, &email)
        .is_limited()
    {
        audit::record_attempt(
            pool,
            auth_state.fingerprint_salt(),
            AuthMethod::EmailOtp,
            "rate_limited",
            Some(&email),
            client_ip.as_deref(),
            None,
            &request_id,
        )
        .await;
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    let outcome = match auth_state.otp().verify(challenge_token, &email, code).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Failed to verify otp challenge: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    };

    let (status, error_code) = match outcome {
        VerifyOutcome::Verified { challenge_id, .. } => {
            return finish_email_otp(
                pool,
                auth_state,
                challenge_id,
                &email,
                client_ip.as_deref(),
                user_agent.as_deref(),
                &request_id,
            )
            .await;
        }
        VerifyOutcome::Invalid => (StatusCode::BAD_REQUEST, "invalid_code"),
        VerifyOutcome::Expired => (StatusCode::GONE, "expired"),
        VerifyOutcome::MaxAttempts => (StatusCode::TOO_MANY_REQUESTS, "too_many_attempts"),
    };

    auth_state.pause_on_failure().await;
    audit::record_attempt(
        pool,
        auth_state.fingerprint_salt(),
        AuthMethod::EmailOtp,
        error_code,
        Some(&email),
        client_ip.as_deref(),
        None,
        &request_id,
    )
    .await;
    error_response(status, error_code)
}

/// Consume the verified challenge and mint the first token family member.
async fn finish_email_otp(
    pool: &PgPool,
    auth_state: &AuthState,
    challenge_id: Uuid,
    email: &str,
    client_ip: Option<&str>,
    user_agent: Option<&str>,
    request_id: &str,
) -> axum::response::Response {
    match auth_state.otp().mark_used(challenge_id).await {
        Ok(true) => {}
        Ok(false) => {
            // Another redemption won the race; answer as if expired.
            auth_state.pause_on_failure().await;
            audit::record_attempt(
                pool,
                auth_state.fingerprint_salt(),
                AuthMethod::EmailOtp,
                "expired",
                Some(email),
                client_ip,
                None,
                request_id,
            )
            .await;
            return error_response(StatusCode::GONE, "expired");
        }
        Err(err) => {
            error!("Failed to consume otp challenge: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    }

    let user_id = match auth_state.otp().resolve_user(email).await {
        Ok(user_id) => user_id,
        Err(err) => {
            error!("Failed to resolve user for verified challenge: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    };

    let tokens = match auth_state
        .tokens()
        .issue(user_id, parse_ip(client_ip), user_agent)
        .await
    {
        Ok(tokens) => tokens,
        Err(err) => {
            error!("Failed to issue tokens: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    };

    info!(user_id = %user_id, request_id = %request_id, "email otp grant succeeded");
    audit::record_attempt(
        pool,
        auth_state.fingerprint_salt(),
        AuthMethod::EmailOtp,
        "verified",
        Some(email),
        client_ip,
        Some(user_id),
        request_id,
    )
    .await;
    issued_response(auth_state.config(), tokens)
}

async fn grant_refresh_token(
    headers: &HeaderMap,
    pool: &PgPool,
    auth_state: &AuthState,
) -> axum::response::Response {
    let client_ip = extract_client_ip(headers);
    let user_agent = extract_user_agent(headers);
    let request_id = request_id(headers);

    if auth_state
        .rate_limiter()
        .check_client(
            RateLimitAction::TokenRefreshPerClient,
            client_ip.as_deref(),
            user_agent.as_deref(),
        )
        .is_limited()
    {
        audit::record_attempt(
            pool,
            auth_state.fingerprint_salt(),
            AuthMethod::RefreshToken,
            "rate_limited",
            None,
            client_ip.as_deref(),
            None,
            &request_id,
        )
        .await;
        // Keep the cookie: the caller may retry after backing off.
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    let Some(presented) = extract_refresh_token(headers) else {
        audit::record_attempt(
            pool,
            auth_state.fingerprint_salt(),
            AuthMethod::RefreshToken,
            "missing_token",
            None,
            client_ip.as_deref(),
            None,
            &request_id,
        )
        .await;
        return refresh_denied(auth_state).await;
    };

    match auth_state
        .tokens()
        .refresh(
            &presented,
            parse_ip(client_ip.as_deref()),
            user_agent.as_deref(),
        )
        .await
    {
        Ok(RefreshOutcome::Rotated(tokens)) => {
            info!(user_id = %tokens.user_id, request_id = %request_id, "refresh token rotated");
            audit::record_attempt(
                pool,
                auth_state.fingerprint_salt(),
                AuthMethod::RefreshToken,
                "rotated",
                None,
                client_ip.as_deref(),
                Some(tokens.user_id),
                &request_id,
            )
            .await;
            issued_response(auth_state.config(), tokens)
        }
        Ok(RefreshOutcome::Unauthorized) => {
            audit::record_attempt(
                pool,
                auth_state.fingerprint_salt(),
                AuthMethod::RefreshToken,
                "unauthorized",
                None,
                client_ip.as_deref(),
                None,
                &request_id,
            )
            .await;
            refresh_denied(auth_state).await
        }
        Ok(RefreshOutcome::ReuseRevoked { user_id, .. }) => {
            // The service already logged the incident with family details.
            audit::record_attempt(
                pool,
                auth_state.fingerprint_salt(),
                AuthMethod::RefreshToken,
                "reuse_revoked",
                None,
                client_ip.as_deref(),
                Some(user_id),
                &request_id,
            )
            .await;
            refresh_denied(auth_state).await
        }
        Err(err) => {
            error!("Failed to rotate refresh token: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 204, description = "Refresh family revoked and cookie cleared")
    ),
    tag = "auth"
)]
/// Revoke the presented refresh family and clear the cookie.
///
/// Succeeds even when nothing was revoked, so a stale client can always log
/// out cleanly.
pub async fn logout(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let request_id = request_id(&headers);
    let client_ip = extract_client_ip(&headers);
    let mut logged_out_user = None;

    if let Some(presented) = extract_refresh_token(&headers) {
        match auth_state.tokens().revoke_presented(&presented).await {
            Ok(Some(revoked)) => {
                logged_out_user = Some(revoked.user_id);
                info!(
                    user_id = %revoked.user_id,
                    token_family_id = %revoked.token_family_id,
                    revoked = revoked.revoked,
                    request_id = %request_id,
                    "refresh family revoked on logout"
                );
            }
            Ok(None) => {}
            Err(err) => {
                error!("Failed to revoke refresh family on logout: {err}");
            }
        }
    }

    // A valid bearer also gives up its own revocation row.
    if let Ok(principal) = require_auth(&headers, &auth_state).await {
        logged_out_user = logged_out_user.or(Some(principal.user_id));
        if let Err(err) = auth_state.tokens().revoke_access(principal.jti).await {
            error!("Failed to revoke access token on logout: {err}");
        }
    }

    audit::record_attempt(
        &pool,
        auth_state.fingerprint_salt(),
        AuthMethod::RefreshToken,
        "logout",
        None,
        client_ip.as_deref(),
        logged_out_user,
        &request_id,
    )
    .await;

    // Always clear the cookie, even when no family was found.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_refresh_cookie(auth_state.config()) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

/// 200 response carrying the bearer body and the new refresh cookie.
pub(super) fn issued_response(config: &AuthConfig, tokens: IssuedTokens) -> axum::response::Response {
    let mut response_headers = HeaderMap::new();
    match refresh_cookie(config, &tokens.refresh_token, tokens.refresh_expires_in) {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => {
            // Tokens are base64url, so this cannot happen for real values.
            error!("Failed to build refresh cookie: {err}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error");
        }
    }
    (
        StatusCode::OK,
        response_headers,
        Json(TokenResponse::bearer(tokens.access_token, tokens.expires_in)),
    )
        .into_response()
}

/// Uniform refusal for refresh grants: pause, clear the cookie, answer 401.
async fn refresh_denied(auth_state: &AuthState) -> axum::response::Response {
    auth_state.pause_on_failure().await;
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_refresh_cookie(auth_state.config()) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (
        StatusCode::UNAUTHORIZED,
        response_headers,
        Json(ErrorBody {
            error: "unauthorized".to_string(),
        }),
    )
        .into_response()
}

/// Build the `HttpOnly` refresh cookie, scoped to the auth endpoints only.
fn refresh_cookie(
    config: &AuthConfig,
    token: &str,
    max_age_seconds: i64,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{REFRESH_COOKIE_NAME}={token}; Path=/auth; HttpOnly; SameSite=Strict; Max-Age={max_age_seconds}"
    );
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

fn clear_refresh_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie =
        format!("{REFRESH_COOKIE_NAME}=; Path=/auth; HttpOnly; SameSite=Strict; Max-Age=0");
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn extract_refresh_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == REFRESH_COOKIE_NAME && !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}
