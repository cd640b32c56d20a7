//! Integration tests for the controller API endpoints

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use controller_lib::controller::{
    DeploymentDeps, DeploymentManager, HealthChecker, TrafficSplitter,
};
use controller_lib::health::{components, ComponentStatus, HealthRegistry};
use controller_lib::models::CanaryConfig;
use controller_lib::observability::ControllerMetrics;
use controller_lib::Result as CanaryResult;
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;

struct NullSplitter;

#[async_trait]
impl TrafficSplitter for NullSplitter {
    async fn set_weight(&self, _deployment_id: &str, _canary_percent: u8) -> CanaryResult<()> {
        Ok(())
    }
}

struct AlwaysHealthy;

#[async_trait]
impl HealthChecker for AlwaysHealthy {
    async fn is_healthy(&self, _version: &str) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DeploymentManager>,
    pub health_registry: HealthRegistry,
    pub metrics: ControllerMetrics,
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

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

async fn launch(
    State(state): State<Arc<AppState>>,
    Json(config): Json<CanaryConfig>,
) -> impl IntoResponse {
    let name = config.name.clone();
    match state.manager.launch(config).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "deployment_id": name }))).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.status(&id).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn rollback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.rollback(&id, "operator-initiated rollback").await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.remove(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn create_test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/deployments", post(launch))
        .route("/deployments/:id", get(status).delete(delete))
        .route("/deployments/:id/rollback", post(rollback))
        .with_state(state)
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::SPLITTER).await;

    let (manager, _reports) = DeploymentManager::new(DeploymentDeps {
        splitter: Arc::new(NullSplitter),
        health: Arc::new(AlwaysHealthy),
        store: None,
        process_health: Some(Arc::new(health_registry.clone())),
    });
    let metrics = ControllerMetrics::new();
    let state = Arc::new(AppState {
        manager,
        health_registry,
        metrics,
    });
    let router = create_test_router(state.clone());

    (router, state)
}

fn deployment_body(name: &str) -> serde_json::Value {
    json!({
        "name": name,
        "namespace": "prod",
        "stable_version": "v1",
        "canary_version": "v2",
        "initial_weight": 5,
        "weight_increment": 20,
        "max_weight": 100,
        "promotion_interval_secs": 60,
        "analysis_interval_secs": 3600,
        "max_error_rate_percent": 5.0,
        "max_latency_increase_percent": 50.0,
        "min_request_count": 10
    })
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["collector"].is_object());
    assert!(health["components"]["splitter"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::SPLITTER, "mesh unreachable")
        .await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_lifecycle() {
    let (app, state) = setup_test_app().await;

    // Not ready until initialization completes
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.health_registry.set_ready(true).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.set_canary_weight("checkout", 25);
    state.metrics.observe_analysis_latency(0.001);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("canary_controller_weight_percent"));
    assert!(metrics_text.contains("canary_controller_analysis_latency_seconds_bucket"));
    assert!(metrics_text.contains("canary_controller_analysis_latency_seconds_count"));
}

#[tokio::test]
async fn test_launch_and_fetch_status() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .clone()
        .oneshot(post_json("/deployments", &deployment_body("checkout")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/deployments/checkout")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(status["deployment_id"], "checkout");
    assert_eq!(status["state"], "progressing");
    assert_eq!(status["current_weight"], 5);
}

#[tokio::test]
async fn test_launch_rejects_invalid_config() {
    let (app, _state) = setup_test_app().await;

    let mut body = deployment_body("checkout");
    body["max_weight"] = json!(150);

    let response = app
        .oneshot(post_json("/deployments", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_status_for_unknown_deployment_is_404() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/deployments/missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_endpoint_removes_deployment() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .clone()
        .oneshot(post_json("/deployments", &deployment_body("search")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/deployments/search")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/deployments/search")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rollback_endpoint_zeroes_weight() {
    let (app, _state) = setup_test_app().await;

    let response = app
        .clone()
        .oneshot(post_json("/deployments", &deployment_body("billing")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/deployments/billing/rollback")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/deployments/billing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(status["state"], "rolled_back");
    assert_eq!(status["current_weight"], 0);
}
