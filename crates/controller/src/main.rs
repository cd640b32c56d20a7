//! Canary controller - progressive delivery daemon
//!
//! Drives canary deployments from launch to promotion or rollback,
//! serves the operator API, and resolves A/B variant assignments.

use anyhow::Result;
use controller_lib::abtest::AbTestRegistry;
use controller_lib::controller::{DeploymentDeps, DeploymentManager};
use controller_lib::health::{components, HealthRegistry};
use controller_lib::observability::{ControllerMetrics, StructuredLogger};
use controller_lib::store::StateStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod adapter;
mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffer for the analytics event subscriber; a slow log drops events
/// rather than backpressuring assignment
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting canary-controller");

    // Load configuration
    let config = config::ControllerConfig::load()?;
    info!(instance = %config.instance_name, "Controller configured");

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::COLLECTOR).await;
    health_registry.register(components::CONTROLLER).await;
    health_registry.register(components::SPLITTER).await;
    health_registry.register(components::STORE).await;

    // Initialize metrics and structured logger
    let metrics = ControllerMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);
    logger.log_startup(CONTROLLER_VERSION);

    // Durable state for deployments and A/B tests
    let store = Arc::new(StateStore::new(&config.state_dir)?);

    // Deployment manager with the built-in adapters; controllers report
    // store and adapter trouble back into the health registry
    let (manager, mut report_rx) = DeploymentManager::new(DeploymentDeps {
        splitter: Arc::new(adapter::DryRunSplitter::new()),
        health: Arc::new(adapter::PlatformHealthChecker),
        store: Some(store.clone()),
        process_health: Some(Arc::new(health_registry.clone())),
    });
    if config.resume_on_start {
        let resumed = manager.resume_all().await?;
        info!(resumed = resumed, "Resumed persisted deployments");
    }

    // A/B test registry
    let abtests = Arc::new(AbTestRegistry::new(Some(store)));
    let loaded = abtests.load_all()?;
    info!(loaded = loaded, "Loaded persisted A/B tests");

    // Assignment and exposure events stream to the analytics log
    let mut event_rx = abtests.subscribe_events(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            info!(
                event = "ab_test_event",
                test_id = %event.test_id,
                subject_id = %event.subject_id,
                variant = %event.variant,
                kind = ?event.kind,
                timestamp = event.timestamp,
                "A/B event"
            );
        }
    });

    // Terminal reports are logged as they arrive
    tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            info!(
                event = "deployment_finished",
                deployment_id = %report.deployment_id,
                final_state = %report.final_state,
                reason = %report.reason,
                "Deployment finished"
            );
        }
    });

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        manager.clone(),
        abtests,
        health_registry.clone(),
        metrics.clone(),
    ));

    // Mark controller as ready after initialization
    health_registry.set_ready(true).await;

    // Start the operator API server
    tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    manager.shutdown();
    info!("Shutting down");

    Ok(())
}
