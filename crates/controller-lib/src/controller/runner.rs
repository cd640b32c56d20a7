//! Background analysis loop for one deployment
//!
//! Drives scheduled analysis ticks and reacts to detector anomalies
//! between ticks. High-severity error-rate anomalies do not wait for
//! the next tick.

use super::CanaryController;
use crate::anomaly::Anomaly;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

/// Run a started controller to a terminal state. Returns when the
/// deployment reaches a terminal state or shutdown is signalled.
pub async fn run_deployment(
    controller: Arc<CanaryController>,
    mut anomaly_rx: mpsc::Receiver<Anomaly>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let deployment_id = controller.deployment_id().to_string();
    let interval_secs = controller.config().analysis_interval_secs;
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    // First tick fires immediately; skip it so analysis starts one full
    // interval after launch
    ticker.tick().await;

    info!(
        deployment_id = %deployment_id,
        analysis_interval_secs = interval_secs,
        "Analysis loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match controller.tick().await {
                    Ok(analysis) => {
                        debug!(
                            deployment_id = %deployment_id,
                            verdict = %analysis.verdict,
                            "Analysis tick complete"
                        );
                    }
                    Err(e) => {
                        error!(deployment_id = %deployment_id, error = %e, "Analysis tick failed");
                    }
                }
                if controller.state().await.is_terminal() {
                    break;
                }
            }
            received = anomaly_rx.recv() => {
                match received {
                    Some(anomaly) => {
                        controller.handle_anomaly(anomaly).await;
                        if controller.state().await.is_terminal() {
                            break;
                        }
                    }
                    // Sender dropped means the deployment was removed
                    None => {
                        info!(deployment_id = %deployment_id, "Deployment removed; analysis loop stopping");
                        return;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!(deployment_id = %deployment_id, "Analysis loop shutting down");
                return;
            }
        }
    }

    let final_state = controller.state().await;
    info!(
        deployment_id = %deployment_id,
        final_state = %final_state,
        "Deployment reached terminal state"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{AnomalyKind, AnomalyMetric, Severity};
    use crate::collector::{CollectorConfig, MetricsCollector};
    use crate::controller::{ControllerDeps, HealthChecker, TrafficSplitter};
    use crate::error::Result;
    use crate::models::{CanaryConfig, CanaryState};
    use async_trait::async_trait;

    struct NullSplitter;

    #[async_trait]
    impl TrafficSplitter for NullSplitter {
        async fn set_weight(&self, _deployment_id: &str, _canary_percent: u8) -> Result<()> {
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

    fn controller() -> Arc<CanaryController> {
        let config = CanaryConfig {
            name: "checkout".to_string(),
            namespace: "prod".to_string(),
            stable_version: "v1".to_string(),
            canary_version: "v2".to_string(),
            initial_weight: 5,
            weight_increment: 20,
            max_weight: 100,
            promotion_interval_secs: 60,
            analysis_interval_secs: 3600,
            max_error_rate_percent: 5.0,
            max_latency_increase_percent: 50.0,
            min_request_count: 10,
        };
        let collector = Arc::new(MetricsCollector::new(
            "v1",
            "v2",
            CollectorConfig::default(),
        ));
        Arc::new(CanaryController::new(
            config,
            ControllerDeps {
                collector,
                splitter: Arc::new(NullSplitter),
                health: Arc::new(AlwaysHealthy),
                store: None,
                report_tx: None,
                process_health: None,
            },
        ))
    }

    #[tokio::test]
    async fn test_anomaly_terminates_loop_before_next_tick() {
        let controller = controller();
        controller.start_at(0).await.unwrap();

        let (anomaly_tx, anomaly_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(run_deployment(
            controller.clone(),
            anomaly_rx,
            shutdown_tx.subscribe(),
        ));

        // The analysis interval is an hour; the rollback must happen
        // well before that
        anomaly_tx
            .send(Anomaly {
                kind: AnomalyKind::Point,
                metric: AnomalyMetric::ErrorRate,
                severity: Severity::High,
                version: "v2".to_string(),
                evidence: "error_rate 25.0 vs trailing mean 1.0".to_string(),
                timestamp: 5,
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should exit")
            .unwrap();
        assert_eq!(controller.state().await, CanaryState::RolledBack);
    }

    #[tokio::test]
    async fn test_dropped_anomaly_sender_stops_loop() {
        let controller = controller();
        controller.start_at(0).await.unwrap();

        let (anomaly_tx, anomaly_rx) = mpsc::channel::<Anomaly>(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(run_deployment(
            controller.clone(),
            anomaly_rx,
            shutdown_tx.subscribe(),
        ));

        drop(anomaly_tx);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should exit")
            .unwrap();
        assert_eq!(controller.state().await, CanaryState::Progressing);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let controller = controller();
        controller.start_at(0).await.unwrap();

        let (_anomaly_tx, anomaly_rx) = mpsc::channel::<Anomaly>(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = tokio::spawn(run_deployment(
            controller.clone(),
            anomaly_rx,
            shutdown_tx.subscribe(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop should exit")
            .unwrap();
        assert_eq!(controller.state().await, CanaryState::Progressing);
    }
}
