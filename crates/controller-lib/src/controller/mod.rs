//! Canary deployment controller
//!
//! One `CanaryController` owns the full lifecycle of a single deployment:
//! config, state, current weight, and promotion history. Analysis ticks
//! and operator-triggered rollbacks run under one mutex so a manual
//! rollback can never race an in-flight promotion.

mod manager;
mod runner;
mod splitter;

pub use manager::{DeploymentDeps, DeploymentManager};
pub use runner::run_deployment;
pub use splitter::{HealthChecker, RetryPolicy, RetryingSplitter, TrafficSplitter};

use crate::analysis::{analyze, Analysis, Verdict};
use crate::anomaly::Anomaly;
use crate::collector::{MetricsCollector, SloCompliance, WindowAggregate};
use crate::error::{CanaryError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::{
    CanaryAction, CanaryConfig, CanaryReport, CanaryState, PromotionHistoryEntry,
};
use crate::observability::{ControllerMetrics, StructuredLogger};
use crate::store::{PersistedDeployment, StateStore};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Readiness poll attempts before start gives up
const HEALTH_CHECK_ATTEMPTS: u32 = 3;

/// Backoff between readiness polls
const HEALTH_CHECK_BACKOFF: std::time::Duration = std::time::Duration::from_millis(500);

/// Anomalies retained for the status endpoint
const MAX_RETAINED_ANOMALIES: usize = 20;

/// Collaborators injected into a controller instance
pub struct ControllerDeps {
    pub collector: Arc<MetricsCollector>,
    pub splitter: Arc<dyn TrafficSplitter>,
    pub health: Arc<dyn HealthChecker>,
    pub store: Option<Arc<StateStore>>,
    /// Terminal reports are emitted here
    pub report_tx: Option<mpsc::Sender<CanaryReport>>,
    /// Process-level registry behind the health probes; store and
    /// adapter failures are reported here as they happen
    pub process_health: Option<Arc<HealthRegistry>>,
}

/// Operator-facing snapshot of one deployment
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub deployment_id: String,
    pub state: CanaryState,
    pub current_weight: u8,
    pub paused: bool,
    pub latest_analysis: Option<Analysis>,
    pub stable_window: Option<WindowAggregate>,
    pub canary_window: Option<WindowAggregate>,
    pub stable_slo_compliance: HashMap<String, SloCompliance>,
    pub canary_slo_compliance: HashMap<String, SloCompliance>,
    pub latest_anomalies: Vec<Anomaly>,
    pub history: Vec<PromotionHistoryEntry>,
}

struct ControllerInner {
    state: CanaryState,
    current_weight: u8,
    paused: bool,
    /// Unix timestamp of the last applied weight change
    last_weight_change: Option<i64>,
    history: Vec<PromotionHistoryEntry>,
    latest_analysis: Option<Analysis>,
    latest_anomalies: Vec<Anomaly>,
    started_at: Option<i64>,
}

/// State machine driving one canary deployment
pub struct CanaryController {
    config: CanaryConfig,
    collector: Arc<MetricsCollector>,
    splitter: Arc<dyn TrafficSplitter>,
    health: Arc<dyn HealthChecker>,
    store: Option<Arc<StateStore>>,
    report_tx: Option<mpsc::Sender<CanaryReport>>,
    process_health: Option<Arc<HealthRegistry>>,
    metrics: ControllerMetrics,
    logger: StructuredLogger,
    inner: Mutex<ControllerInner>,
}

impl CanaryController {
    pub fn new(config: CanaryConfig, deps: ControllerDeps) -> Self {
        let logger = StructuredLogger::new(&config.name);
        Self {
            config,
            collector: deps.collector,
            splitter: deps.splitter,
            health: deps.health,
            store: deps.store,
            report_tx: deps.report_tx,
            process_health: deps.process_health,
            metrics: ControllerMetrics::new(),
            logger,
            inner: Mutex::new(ControllerInner {
                state: CanaryState::Pending,
                current_weight: 0,
                paused: false,
                last_weight_change: None,
                history: Vec::new(),
                latest_analysis: None,
                latest_anomalies: Vec::new(),
                started_at: None,
            }),
        }
    }

    /// Rebuild a controller from persisted state after a process restart.
    /// An in-progress canary resumes at its saved weight rather than
    /// restarting from `initial_weight`.
    pub fn resume_from(persisted: PersistedDeployment, deps: ControllerDeps) -> Self {
        let controller = Self::new(persisted.config, deps);
        {
            // No tasks reference the controller yet
            let mut inner = controller.inner.try_lock().expect("fresh controller");
            inner.state = persisted.state;
            inner.current_weight = persisted.current_weight;
            inner.paused = persisted.paused;
            inner.last_weight_change = persisted.last_weight_change;
            inner.history = persisted.history;
            inner.started_at = persisted.started_at;
        }
        controller
    }

    pub fn deployment_id(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CanaryConfig {
        &self.config
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    /// Validate config, verify both versions are ready, and apply the
    /// initial weight. Transitions `Pending` -> `Progressing`.
    pub async fn start(&self) -> Result<()> {
        self.start_at(Utc::now().timestamp()).await
    }

    pub async fn start_at(&self, now: i64) -> Result<()> {
        self.config.validate()?;

        let mut inner = self.inner.lock().await;
        if inner.state != CanaryState::Pending {
            return Err(CanaryError::InvalidState(format!(
                "cannot start from state {}",
                inner.state
            )));
        }

        for version in [&self.config.stable_version, &self.config.canary_version] {
            if !self.await_healthy(version).await {
                let reason = format!("version {version} failed readiness checks");
                self.finalize(&mut inner, CanaryState::Failed, CanaryAction::Failed, &reason, now)
                    .await;
                return Err(CanaryError::DependencyUnhealthy(reason));
            }
        }

        if let Err(e) = self.set_weight_tracked(self.config.initial_weight).await {
            let reason = format!("could not apply initial weight: {e}");
            self.finalize(&mut inner, CanaryState::Failed, CanaryAction::Failed, &reason, now)
                .await;
            return Err(e);
        }

        inner.state = CanaryState::Progressing;
        inner.current_weight = self.config.initial_weight;
        inner.started_at = Some(now);
        inner.last_weight_change = Some(now);
        inner.history.push(PromotionHistoryEntry {
            timestamp: now,
            previous_weight: 0,
            new_weight: self.config.initial_weight,
            action: CanaryAction::Started,
            reason: "canary launched".to_string(),
        });

        self.metrics
            .set_canary_weight(&self.config.name, self.config.initial_weight);
        self.logger.log_weight_change(
            &self.config.name,
            0,
            self.config.initial_weight,
            "canary launched",
        );
        self.persist(&inner).await;
        Ok(())
    }

    /// Re-apply the persisted weight after a restart. Only meaningful for
    /// a resumed `Progressing` deployment.
    pub async fn reapply_weight(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        if inner.state != CanaryState::Progressing {
            return Ok(());
        }
        self.set_weight_tracked(inner.current_weight).await
    }

    /// One analysis cycle at the current wall clock
    pub async fn tick(&self) -> Result<Analysis> {
        self.tick_at(Utc::now().timestamp()).await
    }

    /// One analysis cycle: fetch both windows, analyze, and act on the
    /// verdict. Weight never increases more than once per
    /// `promotion_interval_secs`, even across noisy passing ticks.
    pub async fn tick_at(&self, now: i64) -> Result<Analysis> {
        let mut inner = self.inner.lock().await;

        if inner.paused {
            return Ok(Analysis {
                verdict: Verdict::Continue,
                reason: "deployment paused; analysis skipped".to_string(),
            });
        }
        if inner.state != CanaryState::Progressing {
            return Ok(Analysis {
                verdict: Verdict::Continue,
                reason: format!("state {}; analysis skipped", inner.state),
            });
        }

        let stable = self
            .collector
            .aggregate(&self.config.stable_version)
            .await;
        let canary = self
            .collector
            .aggregate(&self.config.canary_version)
            .await;

        let started = Instant::now();
        let analysis = analyze(stable.as_ref(), canary.as_ref(), &self.config);
        self.metrics
            .observe_analysis_latency(started.elapsed().as_secs_f64());
        self.logger
            .log_verdict(&self.config.name, analysis.verdict, &analysis.reason);
        inner.latest_analysis = Some(analysis.clone());

        match analysis.verdict {
            Verdict::Continue => {}
            Verdict::Promote => {
                self.try_promote(&mut inner, now).await;
            }
            Verdict::Rollback => {
                self.rollback_locked(&mut inner, &analysis.reason, now).await;
            }
        }

        Ok(analysis)
    }

    async fn try_promote(&self, inner: &mut ControllerInner, now: i64) {
        let gate_open = match inner.last_weight_change {
            Some(last) => now - last >= self.config.promotion_interval_secs as i64,
            None => true,
        };
        if !gate_open {
            debug!(
                deployment_id = %self.config.name,
                "Promotion gated; interval since last weight change not elapsed"
            );
            return;
        }

        if !self.health.is_healthy(&self.config.canary_version).await {
            warn!(
                deployment_id = %self.config.name,
                version = %self.config.canary_version,
                "Canary not ready; holding weight increase"
            );
            return;
        }

        let previous = inner.current_weight;
        let new_weight = previous
            .saturating_add(self.config.weight_increment)
            .min(self.config.max_weight);

        if let Err(e) = self.set_weight_tracked(new_weight).await {
            // Weight is treated as not-yet-applied; retried next tick
            warn!(
                deployment_id = %self.config.name,
                error = %e,
                "Weight update not applied; will retry on next tick"
            );
            self.metrics.inc_adapter_failures();
            return;
        }

        inner.current_weight = new_weight;
        inner.last_weight_change = Some(now);
        inner.history.push(PromotionHistoryEntry {
            timestamp: now,
            previous_weight: previous,
            new_weight,
            action: CanaryAction::WeightIncreased,
            reason: "analysis passed".to_string(),
        });
        self.metrics.set_canary_weight(&self.config.name, new_weight);
        self.logger
            .log_weight_change(&self.config.name, previous, new_weight, "analysis passed");

        if new_weight >= self.config.max_weight {
            inner.state = CanaryState::Promoting;
            let reason = "max weight reached with passing analysis".to_string();
            self.finalize(
                inner,
                CanaryState::Succeeded,
                CanaryAction::Promoted,
                &reason,
                now,
            )
            .await;
            self.metrics.inc_promotions();
        } else {
            self.persist(inner).await;
        }
    }

    /// Operator- or verdict-triggered rollback. Idempotent: calls after a
    /// terminal transition are no-ops.
    pub async fn rollback(&self, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_terminal() {
            return Ok(());
        }
        self.rollback_locked(&mut inner, reason, Utc::now().timestamp())
            .await;
        Ok(())
    }

    async fn rollback_locked(&self, inner: &mut ControllerInner, reason: &str, now: i64) {
        // The adapter is always told to zero the weight, even when the
        // call ultimately fails; the terminal transition is not blocked
        // on external I/O succeeding.
        match self.splitter.set_weight(&self.config.name, 0).await {
            Ok(()) => {
                if let Some(health) = &self.process_health {
                    health.set_healthy(components::SPLITTER).await;
                }
            }
            Err(e) => {
                warn!(
                    deployment_id = %self.config.name,
                    error = %e,
                    "Failed to zero canary weight during rollback"
                );
                // Intended and actual traffic split now diverge
                if let Some(health) = &self.process_health {
                    health
                        .set_unhealthy(
                            components::SPLITTER,
                            format!("could not zero canary weight: {e}"),
                        )
                        .await;
                }
            }
        }

        let previous = inner.current_weight;
        inner.current_weight = 0;
        inner.history.push(PromotionHistoryEntry {
            timestamp: now,
            previous_weight: previous,
            new_weight: 0,
            action: CanaryAction::RolledBack,
            reason: reason.to_string(),
        });
        inner.state = CanaryState::RolledBack;

        self.metrics.set_canary_weight(&self.config.name, 0);
        self.metrics.inc_rollbacks();
        self.logger.log_rollback(&self.config.name, reason);
        self.emit_report(inner, reason, now).await;
        self.persist(inner).await;
    }

    /// Record an anomaly for the status surface. A high-severity
    /// error-rate anomaly triggers the immediate rollback path without
    /// waiting for the next scheduled tick.
    pub async fn handle_anomaly(&self, anomaly: Anomaly) {
        self.metrics.inc_anomalies();
        self.logger.log_anomaly(&self.config.name, &anomaly);

        let trigger = anomaly.is_rollback_trigger();
        let reason = format!(
            "high-severity anomaly on {}: {}",
            anomaly.metric, anomaly.evidence
        );

        {
            let mut inner = self.inner.lock().await;
            inner.latest_anomalies.push(anomaly);
            if inner.latest_anomalies.len() > MAX_RETAINED_ANOMALIES {
                let excess = inner.latest_anomalies.len() - MAX_RETAINED_ANOMALIES;
                inner.latest_anomalies.drain(0..excess);
            }

            if trigger && inner.state == CanaryState::Progressing && !inner.paused {
                self.rollback_locked(&mut inner, &reason, Utc::now().timestamp())
                    .await;
            }
        }
    }

    /// Operator override: while paused, ticks are no-ops but metrics
    /// continue to accumulate.
    pub async fn pause(&self) {
        let mut inner = self.inner.lock().await;
        inner.paused = true;
        self.logger.log_pause(&self.config.name, true);
        self.persist(&inner).await;
    }

    pub async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        inner.paused = false;
        self.logger.log_pause(&self.config.name, false);
        self.persist(&inner).await;
    }

    pub async fn state(&self) -> CanaryState {
        self.inner.lock().await.state
    }

    pub async fn current_weight(&self) -> u8 {
        self.inner.lock().await.current_weight
    }

    pub async fn history(&self) -> Vec<PromotionHistoryEntry> {
        self.inner.lock().await.history.clone()
    }

    /// Full operator snapshot: state, weight, latest analysis, windows,
    /// SLO compliance and recent anomalies.
    pub async fn status(&self) -> DeploymentStatus {
        let stable_window = self
            .collector
            .aggregate(&self.config.stable_version)
            .await;
        let canary_window = self
            .collector
            .aggregate(&self.config.canary_version)
            .await;
        let stable_slo = self
            .collector
            .slo_compliance(&self.config.stable_version)
            .await;
        let canary_slo = self
            .collector
            .slo_compliance(&self.config.canary_version)
            .await;

        let inner = self.inner.lock().await;
        DeploymentStatus {
            deployment_id: self.config.name.clone(),
            state: inner.state,
            current_weight: inner.current_weight,
            paused: inner.paused,
            latest_analysis: inner.latest_analysis.clone(),
            stable_window,
            canary_window,
            stable_slo_compliance: stable_slo,
            canary_slo_compliance: canary_slo,
            latest_anomalies: inner.latest_anomalies.clone(),
            history: inner.history.clone(),
        }
    }

    /// Apply a weight through the adapter, tracking splitter health in
    /// the process registry
    async fn set_weight_tracked(&self, percent: u8) -> Result<()> {
        match self.splitter.set_weight(&self.config.name, percent).await {
            Ok(()) => {
                if let Some(health) = &self.process_health {
                    health.set_healthy(components::SPLITTER).await;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(health) = &self.process_health {
                    health
                        .set_degraded(components::SPLITTER, e.to_string())
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn await_healthy(&self, version: &str) -> bool {
        for attempt in 1..=HEALTH_CHECK_ATTEMPTS {
            if self.health.is_healthy(version).await {
                return true;
            }
            warn!(
                deployment_id = %self.config.name,
                version = %version,
                attempt = attempt,
                "Readiness check failed"
            );
            if attempt < HEALTH_CHECK_ATTEMPTS {
                tokio::time::sleep(HEALTH_CHECK_BACKOFF).await;
            }
        }
        false
    }

    /// Terminal transition: append the history entry, emit the report,
    /// and persist. Terminal states are final.
    async fn finalize(
        &self,
        inner: &mut ControllerInner,
        state: CanaryState,
        action: CanaryAction,
        reason: &str,
        now: i64,
    ) {
        inner.history.push(PromotionHistoryEntry {
            timestamp: now,
            previous_weight: inner.current_weight,
            new_weight: inner.current_weight,
            action,
            reason: reason.to_string(),
        });
        inner.state = state;
        self.emit_report(inner, reason, now).await;
        self.persist(inner).await;
    }

    async fn emit_report(&self, inner: &ControllerInner, reason: &str, now: i64) {
        let Some(tx) = &self.report_tx else {
            return;
        };
        let report = CanaryReport {
            deployment_id: self.config.name.clone(),
            final_state: inner.state,
            reason: reason.to_string(),
            weight_history: inner.history.clone(),
            started_at: inner.started_at,
            finished_at: now,
        };
        if let Err(e) = tx.try_send(report) {
            warn!(deployment_id = %self.config.name, error = %e, "Failed to emit report");
        }
    }

    async fn persist(&self, inner: &ControllerInner) {
        let Some(store) = &self.store else {
            return;
        };
        let persisted = PersistedDeployment {
            config: self.config.clone(),
            state: inner.state,
            current_weight: inner.current_weight,
            paused: inner.paused,
            last_weight_change: inner.last_weight_change,
            started_at: inner.started_at,
            history: inner.history.clone(),
        };
        match store.save_deployment(&persisted) {
            Ok(()) => {
                if let Some(health) = &self.process_health {
                    health.set_healthy(components::STORE).await;
                }
            }
            Err(e) => {
                warn!(
                    deployment_id = %self.config.name,
                    error = %e,
                    "Failed to persist deployment state"
                );
                if let Some(health) = &self.process_health {
                    health
                        .set_degraded(components::STORE, e.to_string())
                        .await;
                }
            }
        }
    }
}
