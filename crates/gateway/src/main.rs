mod backend;
mod cli;
mod config;
mod error;
mod jobs;
mod logging;
mod relay;
#[cfg(test)]
mod test_support;
mod traces;
mod upload;

use crate::backend::{BackendClient, REQUEST_ID_HEADER};
use crate::cli::Args;
use crate::config::GatewayConfig;
use crate::logging::init_tracing;
use crate::relay::RelayRegistry;
use anyhow::Context;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Extension, Json, Router};
use clap::Parser;
use protocol::GatewayHealth;
use serde_json::json;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) backend: BackendClient,
    pub(crate) relays: RelayRegistry,
    pub(crate) config: Arc<GatewayConfig>,
}

/// Correlation id for one inbound request, forwarded to the backend.
#[derive(Clone, Debug)]
pub(crate) struct RequestId(pub(crate) String);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(&args.log_level, args.log_dir.as_deref(), args.log_to_stderr)?;
    let config = GatewayConfig::from_args(&args)?;

    info!(
        listen_addr = %config.listen_addr,
        backend = %config.backend_url,
        relay_addr = ?config.relay_addr,
        static_dir = %config.static_dir.display(),
        "gateway starting"
    );
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("failed to create {}", config.upload_dir.display()))?;

    let state = AppState {
        backend: BackendClient::new(config.backend_url.clone())?,
        relays: RelayRegistry::new(),
        config: Arc::new(config.clone()),
    };
    let shutdown = CancellationToken::new();

    if let Some(relay_addr) = config.relay_addr.as_deref() {
        let listener = TcpListener::bind(relay_addr)
            .await
            .with_context(|| format!("failed to bind relay {relay_addr}"))?;
        info!(addr = %relay_addr, "websocket relay listening");
        let relay_app = relay::relay_router(state.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, relay_app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(err) = result {
                warn!(error = %err, "websocket relay stopped");
            }
        });
    }

    let app = build_router(state);
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await?;
    info!("gateway shutting down");
    shutdown.cancel();
    Ok(())
}

pub(crate) fn build_router(state: AppState) -> Router {
    let static_dir = state.config.static_dir.clone();
    let index = static_dir.join("index.html");
    let static_service = ServeDir::new(static_dir).fallback(ServeFile::new(index));
    let body_limit = usize::try_from(state.config.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);
    let cors = cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/health/backend", get(jobs::backend_health))
        .route("/api/models", get(jobs::models))
        .route("/api/upload", post(upload::upload))
        .route("/api/analyze", post(upload::analyze))
        .route("/api/jobs/:job_id/status", get(jobs::status))
        .route("/api/jobs/:job_id/results", get(jobs::results))
        .route("/api/jobs/:job_id/export/excel", get(jobs::export_excel))
        .route("/api/jobs/:job_id/export/json", get(jobs::export_json))
        .route("/api/traces", get(traces::list_traces))
        .route("/api/traces/:trace_id", get(traces::get_trace))
        .route(
            "/api/traces/:trace_id/files/:filename",
            get(traces::get_trace_file),
        )
        .route("/api/*rest", any(api_not_found))
        .route("/ws/jobs/:job_id", get(relay::relay_handler))
        .method_not_allowed_fallback(api_not_found)
        .fallback_service(static_service)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(middleware::from_fn(request_context))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(origin = %origin, error = %err, "ignoring invalid cors origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

pub(crate) fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_request_id);
    req.extensions_mut().insert(RequestId(request_id.clone()));
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let started = Instant::now();

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    let status = response.status();
    let duration_ms = started.elapsed().as_millis() as u64;
    if status.as_u16() >= 400 {
        tracing::error!(
            request_id = %request_id,
            method = %method,
            path = %path,
            origin = %origin,
            status = status.as_u16(),
            duration_ms,
            "http request failed"
        );
    } else {
        tracing::info!(
            request_id = %request_id,
            method = %method,
            path = %path,
            origin = %origin,
            status = status.as_u16(),
            duration_ms,
            "http request"
        );
    }
    response
}

async fn health(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Json<GatewayHealth> {
    tracing::debug!(request_id = %request_id, "health check requested");
    Json(GatewayHealth {
        status: "healthy".to_string(),
        timestamp: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
        backend: state.backend.base_url().to_string(),
    })
}

async fn api_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "API endpoint not found" })),
    )
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
