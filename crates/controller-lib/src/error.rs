//! Error taxonomy for the canary controller
//!
//! Transient failures (adapter, health checks) are retried locally and
//! surfaced as warnings; verdict-driven rollbacks always carry a
//! human-readable reason.

use thiserror::Error;

/// Errors produced by the controller and its collaborators
#[derive(Debug, Error)]
pub enum CanaryError {
    /// Invalid thresholds or weights. Fatal: the deployment never starts.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Stable or canary version failed readiness checks after retries.
    #[error("dependency unhealthy: {0}")]
    DependencyUnhealthy(String),

    /// The collector cannot produce a metrics window. Treated as
    /// insufficient data by the analysis step, never as a rollback trigger.
    #[error("metrics unavailable: {0}")]
    MetricsUnavailable(String),

    /// Traffic splitter call failed after exhausting retries. The weight
    /// is treated as not-yet-applied and retried on the next tick.
    #[error("traffic splitter error: {0}")]
    Adapter(String),

    /// High-severity anomaly triggering the immediate rollback path.
    #[error("anomaly detected: {0}")]
    AnomalyDetected(String),

    /// Operation referenced a deployment id that is not registered.
    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    /// Operation referenced an A/B test id that is not registered.
    #[error("unknown test: {0}")]
    UnknownTest(String),

    /// Operation is not valid in the deployment's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Durable state could not be read or written.
    #[error("state store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, CanaryError>;
