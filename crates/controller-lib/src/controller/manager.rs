//! Registry of live canary deployments
//!
//! The manager owns the controller for every deployment the process is
//! driving, spawns the per-deployment analysis loops, and routes
//! operator commands and ingested metrics to the right controller.

use super::runner::run_deployment;
use super::splitter::{HealthChecker, TrafficSplitter};
use super::{CanaryController, ControllerDeps, DeploymentStatus};
use crate::collector::{CollectorConfig, MetricsCollector};
use crate::error::{CanaryError, Result};
use crate::health::HealthRegistry;
use crate::models::{CanaryConfig, CanaryReport, MetricsSample};
use crate::observability::ControllerMetrics;
use crate::store::StateStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

const REPORT_CHANNEL_CAPACITY: usize = 64;
const ANOMALY_CHANNEL_CAPACITY: usize = 64;

/// Process-wide collaborators shared by every deployment
#[derive(Clone)]
pub struct DeploymentDeps {
    pub splitter: Arc<dyn TrafficSplitter>,
    pub health: Arc<dyn HealthChecker>,
    pub store: Option<Arc<StateStore>>,
    pub process_health: Option<Arc<HealthRegistry>>,
}

struct ManagedDeployment {
    controller: Arc<CanaryController>,
    anomaly_tx: mpsc::Sender<crate::anomaly::Anomaly>,
}

pub struct DeploymentManager {
    deps: DeploymentDeps,
    deployments: DashMap<String, ManagedDeployment>,
    report_tx: mpsc::Sender<CanaryReport>,
    shutdown_tx: broadcast::Sender<()>,
    metrics: ControllerMetrics,
}

impl DeploymentManager {
    /// Returns the manager and the receiver that terminal reports for
    /// every deployment are delivered on.
    pub fn new(deps: DeploymentDeps) -> (Arc<Self>, mpsc::Receiver<CanaryReport>) {
        let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);
        let manager = Arc::new(Self {
            deps,
            deployments: DashMap::new(),
            report_tx,
            shutdown_tx,
            metrics: ControllerMetrics::new(),
        });
        (manager, report_rx)
    }

    /// Start a new canary and spawn its analysis loop
    pub async fn launch(&self, config: CanaryConfig) -> Result<()> {
        config.validate()?;
        if self.deployments.contains_key(&config.name) {
            return Err(CanaryError::Configuration(format!(
                "deployment {} already exists",
                config.name
            )));
        }

        let collector_config = CollectorConfig {
            min_request_count: config.min_request_count,
            ..CollectorConfig::default()
        };
        let collector = Arc::new(MetricsCollector::new(
            config.stable_version.clone(),
            config.canary_version.clone(),
            collector_config,
        ));
        let controller = Arc::new(CanaryController::new(
            config,
            ControllerDeps {
                collector,
                splitter: self.deps.splitter.clone(),
                health: self.deps.health.clone(),
                store: self.deps.store.clone(),
                report_tx: Some(self.report_tx.clone()),
                process_health: self.deps.process_health.clone(),
            },
        ));
        controller.start().await?;
        self.register(controller);
        Ok(())
    }

    /// Rebuild controllers for every persisted non-terminal deployment.
    /// Returns the number of deployments resumed.
    pub async fn resume_all(&self) -> Result<usize> {
        let Some(store) = &self.deps.store else {
            return Ok(0);
        };
        let persisted = store
            .load_deployments()
            .map_err(|e| CanaryError::Store(e.to_string()))?;

        let mut resumed = 0;
        for saved in persisted {
            if saved.state.is_terminal() {
                continue;
            }
            if self.deployments.contains_key(&saved.config.name) {
                continue;
            }
            let collector_config = CollectorConfig {
                min_request_count: saved.config.min_request_count,
                ..CollectorConfig::default()
            };
            let collector = Arc::new(MetricsCollector::new(
                saved.config.stable_version.clone(),
                saved.config.canary_version.clone(),
                collector_config,
            ));
            let controller = Arc::new(CanaryController::resume_from(
                saved,
                ControllerDeps {
                    collector,
                    splitter: self.deps.splitter.clone(),
                    health: self.deps.health.clone(),
                    store: self.deps.store.clone(),
                    report_tx: Some(self.report_tx.clone()),
                    process_health: self.deps.process_health.clone(),
                },
            ));
            if let Err(e) = controller.reapply_weight().await {
                warn!(
                    deployment_id = controller.deployment_id(),
                    error = %e,
                    "Could not re-apply persisted weight on resume"
                );
            }
            info!(
                deployment_id = controller.deployment_id(),
                "Resumed deployment from persisted state"
            );
            self.register(controller);
            resumed += 1;
        }
        Ok(resumed)
    }

    fn register(&self, controller: Arc<CanaryController>) {
        let (anomaly_tx, anomaly_rx) = mpsc::channel(ANOMALY_CHANNEL_CAPACITY);
        tokio::spawn(run_deployment(
            controller.clone(),
            anomaly_rx,
            self.shutdown_tx.subscribe(),
        ));
        self.deployments.insert(
            controller.deployment_id().to_string(),
            ManagedDeployment {
                controller,
                anomaly_tx,
            },
        );
        self.metrics
            .set_active_deployments(self.deployments.len() as i64);
    }

    /// Push-based metrics ingestion. Detector hits are forwarded to the
    /// deployment's analysis loop so rollback triggers act immediately.
    pub async fn record_sample(
        &self,
        deployment_id: &str,
        version: &str,
        sample: MetricsSample,
    ) -> Result<()> {
        let (collector, anomaly_tx) = {
            let entry = self.lookup(deployment_id)?;
            (entry.controller.collector().clone(), entry.anomaly_tx.clone())
        };

        let anomalies = collector.record(version, sample).await?;
        for anomaly in anomalies {
            if let Err(e) = anomaly_tx.try_send(anomaly) {
                warn!(
                    deployment_id = %deployment_id,
                    error = %e,
                    "Anomaly channel full; dropping anomaly"
                );
            }
        }
        Ok(())
    }

    pub async fn status(&self, deployment_id: &str) -> Result<DeploymentStatus> {
        let controller = self.lookup(deployment_id)?.controller.clone();
        Ok(controller.status().await)
    }

    pub async fn list(&self) -> Vec<DeploymentStatus> {
        let controllers: Vec<_> = self
            .deployments
            .iter()
            .map(|entry| entry.controller.clone())
            .collect();
        let mut statuses = Vec::with_capacity(controllers.len());
        for controller in controllers {
            statuses.push(controller.status().await);
        }
        statuses
    }

    pub async fn pause(&self, deployment_id: &str) -> Result<()> {
        let controller = self.lookup(deployment_id)?.controller.clone();
        controller.pause().await;
        Ok(())
    }

    pub async fn resume(&self, deployment_id: &str) -> Result<()> {
        let controller = self.lookup(deployment_id)?.controller.clone();
        controller.resume().await;
        Ok(())
    }

    pub async fn rollback(&self, deployment_id: &str, reason: &str) -> Result<()> {
        let controller = self.lookup(deployment_id)?.controller.clone();
        controller.rollback(reason).await
    }

    /// Tear down a deployment. An in-progress canary is rolled back
    /// first so traffic is zeroed, then the persisted record is deleted.
    pub async fn remove(&self, deployment_id: &str) -> Result<()> {
        let controller = self.lookup(deployment_id)?.controller.clone();
        if !controller.state().await.is_terminal() {
            controller.rollback("deployment deleted").await?;
        }
        // Dropping the entry drops the anomaly sender, which stops the
        // analysis loop
        self.deployments.remove(deployment_id);
        self.metrics
            .set_active_deployments(self.deployments.len() as i64);
        if let Some(store) = &self.deps.store {
            if let Err(e) = store.remove_deployment(deployment_id) {
                warn!(
                    deployment_id = %deployment_id,
                    error = %e,
                    "Failed to delete persisted deployment record"
                );
            }
        }
        info!(deployment_id = %deployment_id, "Deployment removed");
        Ok(())
    }

    /// Stop every analysis loop. Controllers persist on each transition,
    /// so no extra flush is needed here.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    fn lookup(
        &self,
        deployment_id: &str,
    ) -> Result<dashmap::mapref::one::Ref<'_, String, ManagedDeployment>> {
        self.deployments
            .get(deployment_id)
            .ok_or_else(|| CanaryError::UnknownDeployment(deployment_id.to_string()))
    }
}
