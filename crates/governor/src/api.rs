//! HTTP API for health checks, Prometheus metrics and monitor snapshots

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use governor_lib::{
    capacity::CapacityMonitor,
    container::ContainerHealthMonitor,
    health::{ComponentStatus, HealthRegistry},
    observability::GovernorMetrics,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: GovernorMetrics,
    pub capacity: CapacityMonitor,
    pub health_monitor: ContainerHealthMonitor,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: GovernorMetrics,
        capacity: CapacityMonitor,
        health_monitor: ContainerHealthMonitor,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            capacity,
            health_monitor,
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        // Capacity governance keeps running without a container runtime
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn capacity(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.capacity.status())
}

async fn containers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_monitor.get_health_status())
}

async fn container_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_monitor.get_stats())
}

async fn container(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.health_monitor.get_container_health(&id) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no health record for container {}", id) })),
        )
            .into_response(),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/capacity", get(capacity))
        .route("/containers", get(containers))
        .route("/containers/stats", get(container_stats))
        .route("/containers/:id", get(container))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
