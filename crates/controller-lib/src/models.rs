//! Core data models for the canary controller

use crate::error::CanaryError;
use serde::{Deserialize, Serialize};

/// Immutable configuration for one canary deployment, created at launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryConfig {
    /// Target deployment name, also used as the deployment id
    pub name: String,
    pub namespace: String,
    /// Version identifier currently receiving the trusted traffic share
    pub stable_version: String,
    /// Version identifier under validation
    pub canary_version: String,
    /// Traffic percentage applied when the canary starts
    pub initial_weight: u8,
    /// Percentage added on each successful promotion step
    pub weight_increment: u8,
    /// Weight at which the canary is promoted (at most 100)
    pub max_weight: u8,
    /// Minimum seconds between two weight increases
    pub promotion_interval_secs: u64,
    /// Seconds between analysis ticks
    pub analysis_interval_secs: u64,
    /// Maximum tolerated canary-minus-stable error-rate delta, in percent
    pub max_error_rate_percent: f64,
    /// Maximum tolerated canary p95 latency increase over stable, in percent
    pub max_latency_increase_percent: f64,
    /// Request floor below which a verdict is inconclusive
    pub min_request_count: u64,
}

impl CanaryConfig {
    /// Validate invariants: weights ascending and capped, intervals positive
    pub fn validate(&self) -> Result<(), CanaryError> {
        if self.name.is_empty() {
            return Err(CanaryError::Configuration("name must not be empty".into()));
        }
        if self.stable_version == self.canary_version {
            return Err(CanaryError::Configuration(
                "stable and canary versions must differ".into(),
            ));
        }
        if self.max_weight > 100 {
            return Err(CanaryError::Configuration(format!(
                "max_weight {} exceeds 100",
                self.max_weight
            )));
        }
        if self.initial_weight > self.max_weight {
            return Err(CanaryError::Configuration(format!(
                "initial_weight {} exceeds max_weight {}",
                self.initial_weight, self.max_weight
            )));
        }
        if self.weight_increment == 0 {
            return Err(CanaryError::Configuration(
                "weight_increment must be positive".into(),
            ));
        }
        if self.promotion_interval_secs == 0 || self.analysis_interval_secs == 0 {
            return Err(CanaryError::Configuration(
                "intervals must be positive".into(),
            ));
        }
        if self.max_error_rate_percent < 0.0 || self.max_latency_increase_percent < 0.0 {
            return Err(CanaryError::Configuration(
                "thresholds must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// One timestamped metrics observation for a single version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Unix timestamp (seconds) of the observation
    pub timestamp: i64,
    pub request_count: u64,
    pub error_count: u64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub cpu_usage_cores: Option<f64>,
    pub memory_usage_bytes: Option<u64>,
}

impl MetricsSample {
    /// Error rate for this sample in percent, zero when no traffic was seen
    pub fn error_rate_percent(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.request_count as f64 * 100.0
    }
}

/// Lifecycle state of a canary deployment
///
/// `Succeeded`, `Failed` and `RolledBack` are terminal; a finished
/// deployment is never resurrected without a new launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryState {
    Pending,
    Progressing,
    Promoting,
    Succeeded,
    Failed,
    RolledBack,
}

impl CanaryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CanaryState::Succeeded | CanaryState::Failed | CanaryState::RolledBack
        )
    }
}

impl std::fmt::Display for CanaryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CanaryState::Pending => "pending",
            CanaryState::Progressing => "progressing",
            CanaryState::Promoting => "promoting",
            CanaryState::Succeeded => "succeeded",
            CanaryState::Failed => "failed",
            CanaryState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Action recorded in the promotion history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryAction {
    Started,
    WeightIncreased,
    Promoted,
    RolledBack,
    Failed,
}

/// Immutable audit record appended on every weight change or terminal
/// transition. Also used to gate "time since last promotion".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionHistoryEntry {
    /// Unix timestamp (seconds) of the transition
    pub timestamp: i64,
    pub previous_weight: u8,
    pub new_weight: u8,
    pub action: CanaryAction,
    pub reason: String,
}

/// Kind of metric an SLO targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloKind {
    /// Threshold is the minimum success percentage per sample
    Availability,
    /// Threshold is the maximum p95 latency in milliseconds
    LatencyP95Ms,
    /// Threshold is the maximum error percentage per sample
    ErrorRatePercent,
}

/// A named service level objective with its target threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slo {
    pub name: String,
    pub kind: SloKind,
    pub threshold: f64,
}

/// Structured report emitted on every terminal transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryReport {
    pub deployment_id: String,
    pub final_state: CanaryState,
    pub reason: String,
    pub weight_history: Vec<PromotionHistoryEntry>,
    pub started_at: Option<i64>,
    pub finished_at: i64,
}
