//! HTTP surface: model metadata, health checks, statistics and invocations

use crate::config::ServerConfig;
use crate::metrics::ServiceMetrics;
use crate::models::ModelSlot;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub slot: Arc<ModelSlot>,
    pub metrics: Arc<ServiceMetrics>,
    pub service_name: Arc<str>,
    /// Registered model name, reported before a version is loaded
    pub model_name: Arc<str>,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(
        slot: Arc<ModelSlot>,
        metrics: Arc<ServiceMetrics>,
        server: &ServerConfig,
        model_name: &str,
    ) -> Self {
        Self {
            slot,
            metrics,
            service_name: server.service_name.as_str().into(),
            model_name: model_name.into(),
            max_body_bytes: server.max_body_bytes,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ping", get(ping))
        .route("/stats", get(stats))
        .route("/invocations", post(invocations))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Bind `config.host:config.port` and serve until Ctrl-C or SIGTERM.
pub async fn serve(config: &ServerConfig, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.host, config.port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Inference API listening on {}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    let model = state.slot.get();
    Json(json!({
        "service": &*state.service_name,
        "model": model
            .as_ref()
            .map(|m| m.version.name.as_str())
            .unwrap_or(&*state.model_name),
        "version": model.as_ref().map(|m| m.version.version.clone()),
        "status": "running",
    }))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.slot.get() {
        Some(model) => Json(json!({
            "status": "healthy",
            "model_version": model.version.version,
            "device": model.device.to_string(),
            "loaded_at": model.loaded_at.to_rfc3339(),
        })),
        None => Json(json!({
            "status": "unhealthy",
            "model_version": null,
        })),
    }
}

async fn ping(State(state): State<AppState>) -> StatusCode {
    if state.slot.is_loaded() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn stats(State(state): State<AppState>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn invocations(State(state): State<AppState>, body: Bytes) -> Response {
    let Some(model) = state.slot.get() else {
        warn!("Invocation rejected: model not loaded");
        state.metrics.record_rejected();
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"detail": "Model not loaded"})),
        )
            .into_response();
    };

    let start = Instant::now();
    match tokio::task::spawn_blocking(move || model.adapter.predict(&body)).await {
        Ok(response) => {
            let latency = start.elapsed();
            state.metrics.record_response(latency, &response);
            info!(
                success = response.success,
                num_masks = response.num_masks,
                latency_ms = latency.as_millis() as u64,
                "Invocation complete"
            );
            Json(response).into_response()
        }
        Err(e) => {
            error!(error = %e, "Inference task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"detail": e.to_string()})),
            )
                .into_response()
        }
    }
}
