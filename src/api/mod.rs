use crate::{
    api::handlers::{auth, health},
    otp::{OtpConfig, OtpService},
    token::{AccessTokenKey, TokenConfig, TokenService},
    webauthn::{PasskeyConfig, PasskeyService},
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::options,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, error, info, info_span};
use ulid::Ulid;
use url::Url;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

// Keep these internal to the crate while allowing CLI/server wiring to reference them.
pub(crate) mod email;
pub(crate) mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use email::EmailWorkerConfig;
pub use handlers::auth::AuthConfig;
pub use openapi::openapi;

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Everything the server needs beyond the listener: signing material, service
/// configs, and worker settings.
pub struct ServerConfig {
    pub access_key: Arc<AccessTokenKey>,
    pub token: TokenConfig,
    pub otp: OtpConfig,
    pub passkeys: PasskeyConfig,
    pub auth: auth::AuthConfig,
    pub fingerprint_salt: String,
    pub email: email::EmailWorkerConfig,
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, dsn: String, config: ServerConfig) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    // CORS reuses the passkey origin allow-list; no other browser origin has
    // business calling this API.
    let cors_origins = cors_origins(config.passkeys.allowed_origins())?;

    let tokens = TokenService::new(pool.clone(), config.access_key, config.token);
    let otp = OtpService::new(pool.clone(), config.otp);
    let passkeys = PasskeyService::new(pool.clone(), config.passkeys)
        .context("Failed to build passkey service")?;

    let rate_limiter = Arc::new(auth::SlidingWindowLimiter::new(&config.fingerprint_salt));
    let auth_state = Arc::new(auth::AuthState::new(
        config.auth,
        tokens,
        otp,
        passkeys,
        rate_limiter,
        config.fingerprint_salt,
    ));

    // Background worker polls email_outbox (DB-backed queue) for pending rows,
    // delivers/logs them, and retries failures with exponential backoff.
    email::spawn_outbox_worker(pool.clone(), Arc::new(email::LogEmailSender), config.email);

    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(AllowOrigin::list(cors_origins))
        .allow_credentials(true);

    // Build the router from OpenAPI-wired routes, then extend it with non-doc
    // routes: preflight-only `OPTIONS /health` and the Swagger UI.
    let (router, api_doc) = router().split_for_parts();
    let app = router
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", api_doc))
        .route("/health", options(health::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(auth_state))
                .layer(Extension(pool)),
        );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Gracefully shutdown"),
        Err(err) => {
            // Keep serving; without a signal handler there is nothing to wait for.
            error!("Failed to listen for shutdown signal: {err}");
            std::future::pending::<()>().await;
        }
    }
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn cors_origins(origins: &[String]) -> Result<Vec<HeaderValue>> {
    origins
        .iter()
        .map(|origin| {
            let parsed =
                Url::parse(origin).with_context(|| format!("Invalid origin: {origin}"))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| anyhow!("Origin must include a valid host: {origin}"))?;
            let port = parsed
                .port()
                .map_or_else(String::new, |port| format!(":{port}"));
            let normalized = format!("{}://{}{}", parsed.scheme(), host, port);
            HeaderValue::from_str(&normalized)
                .with_context(|| format!("Failed to build origin header: {origin}"))
        })
        .collect()
}
