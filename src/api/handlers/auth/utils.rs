//! Shared helpers for auth request handling.

use axum::{
    Json,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use regex::Regex;
use std::net::IpAddr;

use super::types::ErrorBody;

/// Boxed early-return response for handler helpers.
pub(super) type HandlerError = Box<axum::response::Response>;

/// Normalize an email for lookups and rate-limit keys.
pub(super) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(super) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Extract a client IP from common proxy headers.
///
/// The raw value feeds fingerprinting and the `inet` audit columns; it is
/// never logged or stored as-is anywhere else.
pub(super) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Parse an extracted client IP for binding into `inet` columns.
pub(super) fn parse_ip(value: Option<&str>) -> Option<IpAddr> {
    value.and_then(|ip| ip.parse().ok())
}

pub(super) fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Correlation id injected by the request-id middleware.
pub(super) fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// JSON error body carrying a machine-readable code, e.g. `invalid_code`.
pub(super) fn error_response(status: StatusCode, code: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: code.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("a@example.com"));
        assert!(valid_email("name.surname@example.co"));
    }

    #[test]
    fn valid_email_rejects_missing_parts() {
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-at.example.com"));
        assert!(!valid_email("missing-domain@"));
    }

    #[test]
    fn extract_client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("1.2.3.4".to_string()));
    }

    #[test]
    fn extract_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(extract_client_ip(&headers), Some("9.9.9.9".to_string()));
    }

    #[test]
    fn extract_client_ip_none_when_missing() {
        let headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers), None);
    }

    #[test]
    fn parse_ip_accepts_v4_and_v6() {
        assert!(parse_ip(Some("1.2.3.4")).is_some());
        assert!(parse_ip(Some("::1")).is_some());
        assert!(parse_ip(Some("not-an-ip")).is_none());
        assert!(parse_ip(None).is_none());
    }

    #[test]
    fn request_id_defaults_to_unknown() {
        let headers = HeaderMap::new();
        assert_eq!(request_id(&headers), "unknown");

        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("01J0ABC"));
        assert_eq!(request_id(&headers), "01J0ABC");
    }

    #[test]
    fn error_response_carries_code() {
        let response = error_response(StatusCode::BAD_REQUEST, "invalid_request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
