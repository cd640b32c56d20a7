//! Observability infrastructure for the canary controller
//!
//! Provides:
//! - Prometheus metrics (canary weight, verdict outcomes, analysis latency)
//! - Structured JSON logging with tracing

use crate::analysis::Verdict;
use crate::anomaly::Anomaly;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, register_int_gauge_vec,
    Histogram, IntCounter, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for analysis latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct ControllerMetricsInner {
    canary_weight: IntGaugeVec,
    active_deployments: IntGauge,
    analysis_latency_seconds: Histogram,
    promotions: IntCounter,
    rollbacks: IntCounter,
    anomalies_detected: IntCounter,
    adapter_failures: IntCounter,
    ab_assignments: IntCounter,
    ab_exposures: IntCounter,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            canary_weight: register_int_gauge_vec!(
                "canary_controller_weight_percent",
                "Current canary traffic weight per deployment",
                &["deployment"]
            )
            .expect("Failed to register canary_weight"),

            active_deployments: register_int_gauge!(
                "canary_controller_active_deployments",
                "Number of deployments currently being driven"
            )
            .expect("Failed to register active_deployments"),

            analysis_latency_seconds: register_histogram!(
                "canary_controller_analysis_latency_seconds",
                "Time spent evaluating one analysis tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register analysis_latency_seconds"),

            promotions: register_int_counter!(
                "canary_controller_promotions_total",
                "Deployments promoted to full traffic"
            )
            .expect("Failed to register promotions"),

            rollbacks: register_int_counter!(
                "canary_controller_rollbacks_total",
                "Deployments rolled back to zero canary traffic"
            )
            .expect("Failed to register rollbacks"),

            anomalies_detected: register_int_counter!(
                "canary_controller_anomalies_detected_total",
                "Anomalies surfaced by the metric detectors"
            )
            .expect("Failed to register anomalies_detected"),

            adapter_failures: register_int_counter!(
                "canary_controller_adapter_failures_total",
                "Traffic splitter calls that failed after retries"
            )
            .expect("Failed to register adapter_failures"),

            ab_assignments: register_int_counter!(
                "canary_controller_ab_assignments_total",
                "First-time A/B variant assignments"
            )
            .expect("Failed to register ab_assignments"),

            ab_exposures: register_int_counter!(
                "canary_controller_ab_exposures_total",
                "A/B exposure events recorded"
            )
            .expect("Failed to register ab_exposures"),
        }
    }
}

/// Controller metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn set_canary_weight(&self, deployment: &str, weight: u8) {
        self.inner()
            .canary_weight
            .with_label_values(&[deployment])
            .set(weight as i64);
    }

    pub fn set_active_deployments(&self, count: i64) {
        self.inner().active_deployments.set(count);
    }

    pub fn observe_analysis_latency(&self, duration_secs: f64) {
        self.inner().analysis_latency_seconds.observe(duration_secs);
    }

    pub fn inc_promotions(&self) {
        self.inner().promotions.inc();
    }

    pub fn inc_rollbacks(&self) {
        self.inner().rollbacks.inc();
    }

    pub fn inc_anomalies(&self) {
        self.inner().anomalies_detected.inc();
    }

    pub fn inc_adapter_failures(&self) {
        self.inner().adapter_failures.inc();
    }

    pub fn inc_ab_assignments(&self) {
        self.inner().ab_assignments.inc();
    }

    pub fn inc_ab_exposures(&self) {
        self.inner().ab_exposures.inc();
    }
}

/// Structured logger for controller events
///
/// Provides consistent JSON-formatted logging for verdicts, weight
/// changes, rollbacks and assignments.
#[derive(Clone)]
pub struct StructuredLogger {
    scope: String,
}

impl StructuredLogger {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    /// Log process startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "controller_started",
            scope = %self.scope,
            controller_version = %version,
            "Canary controller started"
        );
    }

    /// Log process shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            scope = %self.scope,
            reason = %reason,
            "Canary controller shutting down"
        );
    }

    /// Log an analysis verdict
    pub fn log_verdict(&self, deployment_id: &str, verdict: Verdict, reason: &str) {
        info!(
            event = "analysis_verdict",
            scope = %self.scope,
            deployment_id = %deployment_id,
            verdict = %verdict,
            reason = %reason,
            "Analysis verdict"
        );
    }

    /// Log an applied weight change
    pub fn log_weight_change(&self, deployment_id: &str, previous: u8, new: u8, reason: &str) {
        info!(
            event = "weight_changed",
            scope = %self.scope,
            deployment_id = %deployment_id,
            previous_weight = previous,
            new_weight = new,
            reason = %reason,
            "Canary weight changed"
        );
    }

    /// Log a rollback with its reason
    pub fn log_rollback(&self, deployment_id: &str, reason: &str) {
        warn!(
            event = "rollback",
            scope = %self.scope,
            deployment_id = %deployment_id,
            reason = %reason,
            "Canary rolled back"
        );
    }

    /// Log a pause or resume
    pub fn log_pause(&self, deployment_id: &str, paused: bool) {
        info!(
            event = "pause_changed",
            scope = %self.scope,
            deployment_id = %deployment_id,
            paused = paused,
            "Deployment pause state changed"
        );
    }

    /// Log a detected anomaly
    pub fn log_anomaly(&self, deployment_id: &str, anomaly: &Anomaly) {
        match anomaly.severity {
            crate::anomaly::Severity::High => {
                warn!(
                    event = "anomaly_detected",
                    scope = %self.scope,
                    deployment_id = %deployment_id,
                    version = %anomaly.version,
                    metric = %anomaly.metric,
                    severity = %anomaly.severity,
                    evidence = %anomaly.evidence,
                    "High-severity anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    scope = %self.scope,
                    deployment_id = %deployment_id,
                    version = %anomaly.version,
                    metric = %anomaly.metric,
                    severity = %anomaly.severity,
                    evidence = %anomaly.evidence,
                    "Anomaly detected"
                );
            }
        }
    }

    /// Log a first-time A/B assignment
    pub fn log_assignment(&self, test_id: &str, subject_id: &str, variant: &str) {
        info!(
            event = "ab_assignment",
            scope = %self.scope,
            test_id = %test_id,
            subject_id = %subject_id,
            variant = %variant,
            "Subject assigned to variant"
        );
    }
}
