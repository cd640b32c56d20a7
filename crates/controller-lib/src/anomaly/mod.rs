//! Anomaly detection over version metric windows
//!
//! Two detector families:
//! - point anomalies: a metric deviating from its own trailing mean by
//!   more than a configured number of standard deviations
//! - correlation anomalies: stable and canary diverging in trend for the
//!   same metric over the trailing samples
//!
//! Repeated reports for the same (version, kind, metric) are suppressed
//! within a deduplication window.

mod correlation;
mod point;

pub use correlation::CorrelationDetector;
pub use point::{PointDetector, TrailingStats};

use crate::models::MetricsSample;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Default anomaly deduplication window (5 minutes)
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 5 * 60;

/// Which detector produced the anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Point,
    Correlation,
}

/// Metric the anomaly was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyMetric {
    ErrorRate,
    LatencyP95,
    Cpu,
}

impl std::fmt::Display for AnomalyMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnomalyMetric::ErrorRate => "error_rate",
            AnomalyMetric::LatencyP95 => "latency_p95",
            AnomalyMetric::Cpu => "cpu",
        };
        f.write_str(s)
    }
}

/// Severity ladder, escalating with deviation magnitude
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        f.write_str(s)
    }
}

/// A detected anomaly with its supporting evidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub metric: AnomalyMetric,
    pub severity: Severity,
    /// Version the anomaly was observed on
    pub version: String,
    /// Human-readable measured values backing the detection
    pub evidence: String,
    /// Unix timestamp (seconds) of the triggering sample
    pub timestamp: i64,
}

impl Anomaly {
    /// A high-severity error-rate anomaly forces an immediate rollback,
    /// bypassing the next scheduled analysis tick.
    pub fn is_rollback_trigger(&self) -> bool {
        self.severity == Severity::High && self.metric == AnomalyMetric::ErrorRate
    }
}

/// Extract a (timestamp, value) series for one metric from raw samples
pub(crate) fn metric_series(samples: &[MetricsSample], metric: AnomalyMetric) -> Vec<(i64, f64)> {
    samples
        .iter()
        .filter_map(|s| match metric {
            AnomalyMetric::ErrorRate => Some((s.timestamp, s.error_rate_percent())),
            AnomalyMetric::LatencyP95 => Some((s.timestamp, s.latency_p95_ms)),
            AnomalyMetric::Cpu => s.cpu_usage_cores.map(|c| (s.timestamp, c)),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    version: String,
    kind: AnomalyKind,
    metric: AnomalyMetric,
}

/// Suppresses repeated reports of the same anomaly within a window
pub struct AnomalyDeduper {
    window: Duration,
    recent: RwLock<HashMap<DedupKey, Instant>>,
}

impl AnomalyDeduper {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: RwLock::new(HashMap::new()),
        }
    }

    /// Returns true the first time an anomaly is seen within the window
    pub fn admit(&self, anomaly: &Anomaly) -> bool {
        let key = DedupKey {
            version: anomaly.version.clone(),
            kind: anomaly.kind,
            metric: anomaly.metric,
        };
        let mut recent = self.recent.write().unwrap();
        recent.retain(|_, t| t.elapsed() < self.window);
        if let Some(last) = recent.get(&key) {
            if last.elapsed() < self.window {
                return false;
            }
        }
        recent.insert(key, Instant::now());
        true
    }
}

impl Default for AnomalyDeduper {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS))
    }
}
