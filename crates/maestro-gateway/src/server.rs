//! Router assembly and serving.
//!
//! Middleware order (outermost first): request/trace ids → security
//! headers → CORS allowlist → body limits → access log → session bind →
//! handlers. Untrusted origins receive no `Access-Control-Allow-*`
//! headers at all, so browsers cannot read credentialed responses across
//! origins.

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use crate::handlers;
use crate::middleware::{access_log, body_limit, request_id, security_headers, session};
use crate::state::AppState;
use maestro_kernel::config::MaestroConfig;

fn cors_layer(config: &MaestroConfig) -> CorsLayer {
    let allowed = config.server.cors.allowed_origins.clone();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|origin| allowed.iter().any(|entry| entry == origin))
                .unwrap_or(false)
        }))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-request-id"),
            header::HeaderName::from_static("x-trace-id"),
        ])
}

/// Build the full router over the shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let hsts = state.config.server.secure_cookies;
    let json_limit = state.config.server.request_limits.json_bytes;
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/plan", post(handlers::plan::create))
        .route("/plan/{id}/events", get(handlers::events::events))
        .route(
            "/plan/{id}/steps/{step_id}/approve",
            post(handlers::approval::approve),
        )
        .route(
            "/plan/{id}/steps/{step_id}/reject",
            post(handlers::approval::reject),
        )
        .route("/chat", post(handlers::chat::route))
        .route("/healthz", get(handlers::health::healthz))
        .route("/readyz", get(handlers::health::readyz))
        .route("/metrics", get(handlers::health::metrics))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            session::bind,
        ))
        .layer(middleware::from_fn(access_log::log))
        .layer(DefaultBodyLimit::max(json_limit))
        .layer(middleware::from_fn(move |request, next| {
            body_limit::envelope(json_limit, request, next)
        }))
        .layer(cors)
        .layer(middleware::from_fn(move |request, next| {
            security_headers::apply(hsts, request, next)
        }))
        .layer(middleware::from_fn(request_id::propagate_ids))
        .with_state(state)
}

/// Bind and serve until ctrl-c; exits cleanly on shutdown.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = state.config.server.bind_addr.clone();
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "maestro gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
