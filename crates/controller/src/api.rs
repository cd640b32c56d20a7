//! HTTP API: operator endpoints, health checks and Prometheus metrics

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use controller_lib::abtest::{AbTestConfig, AbTestRegistry};
use controller_lib::controller::DeploymentManager;
use controller_lib::health::{ComponentStatus, HealthRegistry};
use controller_lib::models::{CanaryConfig, MetricsSample};
use controller_lib::observability::ControllerMetrics;
use controller_lib::CanaryError;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DeploymentManager>,
    pub abtests: Arc<AbTestRegistry>,
    pub health_registry: HealthRegistry,
    pub metrics: ControllerMetrics,
}

impl AppState {
    pub fn new(
        manager: Arc<DeploymentManager>,
        abtests: Arc<AbTestRegistry>,
        health_registry: HealthRegistry,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            manager,
            abtests,
            health_registry,
            metrics,
        }
    }
}

fn error_status(e: &CanaryError) -> StatusCode {
    match e {
        CanaryError::UnknownDeployment(_) | CanaryError::UnknownTest(_) => StatusCode::NOT_FOUND,
        CanaryError::Configuration(_) | CanaryError::InvalidState(_) => StatusCode::BAD_REQUEST,
        CanaryError::DependencyUnhealthy(_) | CanaryError::MetricsUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        CanaryError::Adapter(_) => StatusCode::BAD_GATEWAY,
        CanaryError::AnomalyDetected(_) | CanaryError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_body(e: CanaryError) -> (StatusCode, Json<Value>) {
    (error_status(&e), Json(json!({ "error": e.to_string() })))
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
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
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn launch_deployment(
    State(state): State<Arc<AppState>>,
    Json(config): Json<CanaryConfig>,
) -> impl IntoResponse {
    let name = config.name.clone();
    match state.manager.launch(config).await {
        Ok(()) => {
            info!(deployment_id = %name, "Deployment launched");
            (StatusCode::CREATED, Json(json!({ "deployment_id": name }))).into_response()
        }
        Err(e) => error_body(e).into_response(),
    }
}

async fn list_deployments(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.list().await)
}

async fn deployment_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.status(&id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => error_body(e).into_response(),
    }
}

async fn delete_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.remove(&id).await {
        Ok(()) => {
            info!(deployment_id = %id, "Deployment deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_body(e).into_response(),
    }
}

#[derive(Deserialize)]
struct IngestRequest {
    version: String,
    sample: MetricsSample,
}

async fn ingest_sample(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<IngestRequest>,
) -> impl IntoResponse {
    match state.manager.record_sample(&id, &req.version, req.sample).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_body(e).into_response(),
    }
}

async fn pause_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.pause(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_body(e).into_response(),
    }
}

async fn resume_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.resume(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_body(e).into_response(),
    }
}

#[derive(Deserialize, Default)]
struct RollbackRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn rollback_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> impl IntoResponse {
    let reason = req
        .reason
        .unwrap_or_else(|| "operator-initiated rollback".to_string());
    match state.manager.rollback(&id, &reason).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_body(e).into_response(),
    }
}

async fn register_ab_test(
    State(state): State<Arc<AppState>>,
    Json(config): Json<AbTestConfig>,
) -> impl IntoResponse {
    let test_id = config.test_id.clone();
    match state.abtests.register(config) {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "test_id": test_id }))).into_response(),
        Err(e) => error_body(e).into_response(),
    }
}

async fn list_ab_tests(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.abtests.list_tests())
}

#[derive(Deserialize)]
struct AssignmentRequest {
    subject_id: String,
    #[serde(default)]
    attributes: HashMap<String, Value>,
}

async fn assign_variant(
    State(state): State<Arc<AppState>>,
    Path(test_id): Path<String>,
    Json(req): Json<AssignmentRequest>,
) -> impl IntoResponse {
    match state
        .abtests
        .get_variant(&test_id, &req.subject_id, &req.attributes)
    {
        Ok(variant) => Json(json!({
            "test_id": test_id,
            "subject_id": req.subject_id,
            "variant": variant,
        }))
        .into_response(),
        Err(e) => error_body(e).into_response(),
    }
}

#[derive(Deserialize)]
struct ExposureRequest {
    subject_id: String,
}

async fn track_exposure(
    State(state): State<Arc<AppState>>,
    Path(test_id): Path<String>,
    Json(req): Json<ExposureRequest>,
) -> impl IntoResponse {
    match state.abtests.track_exposure(&test_id, &req.subject_id) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_body(e).into_response(),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/deployments", post(launch_deployment).get(list_deployments))
        .route(
            "/deployments/:id",
            get(deployment_status).delete(delete_deployment),
        )
        .route("/deployments/:id/metrics", post(ingest_sample))
        .route("/deployments/:id/pause", post(pause_deployment))
        .route("/deployments/:id/resume", post(resume_deployment))
        .route("/deployments/:id/rollback", post(rollback_deployment))
        .route("/abtests", post(register_ab_test).get(list_ab_tests))
        .route("/abtests/:id/assignments", post(assign_variant))
        .route("/abtests/:id/exposures", post(track_exposure))
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
