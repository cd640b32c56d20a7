//! Metrics collection for one canary deployment
//!
//! Owns the bounded per-version sample windows, computes SLO compliance
//! scores, and runs anomaly detection as samples arrive. Windows are
//! exposed read-only as snapshots; the analysis engine never observes a
//! partially-evicted window.

mod sampling;
mod window;

pub use sampling::{MetricsSource, SamplingConfig, SamplingLoop};
pub use window::{MetricsWindow, WindowAggregate, WindowConfig};

use crate::anomaly::{
    metric_series, Anomaly, AnomalyDeduper, AnomalyMetric, CorrelationDetector, PointDetector,
};
use crate::error::{CanaryError, Result};
use crate::models::{MetricsSample, Slo, SloKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Metrics the detectors watch on every recorded sample
const WATCHED_METRICS: &[AnomalyMetric] = &[
    AnomalyMetric::ErrorRate,
    AnomalyMetric::LatencyP95,
    AnomalyMetric::Cpu,
];

/// Configuration for a deployment's collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub window: WindowConfig,
    /// Request floor below which SLO scores are inconclusive
    pub min_request_count: u64,
    pub slos: Vec<Slo>,
    /// Standard deviations for the point detector
    pub point_std_dev_threshold: f64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            min_request_count: 10,
            slos: Vec::new(),
            point_std_dev_threshold: 3.0,
        }
    }
}

/// SLO compliance result for one evaluation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "score")]
pub enum SloCompliance {
    /// 0-100 score over the window's request volume
    Scored(f64),
    /// Window has not reached the request floor; no score is meaningful
    InsufficientData,
}

/// Per-deployment metrics collector for the stable/canary version pair
pub struct MetricsCollector {
    stable_version: String,
    canary_version: String,
    config: CollectorConfig,
    windows: RwLock<HashMap<String, MetricsWindow>>,
    point_detector: PointDetector,
    correlation_detector: CorrelationDetector,
    deduper: AnomalyDeduper,
}

impl MetricsCollector {
    pub fn new(
        stable_version: impl Into<String>,
        canary_version: impl Into<String>,
        config: CollectorConfig,
    ) -> Self {
        let stable_version = stable_version.into();
        let canary_version = canary_version.into();
        let mut windows = HashMap::new();
        windows.insert(
            stable_version.clone(),
            MetricsWindow::new(config.window.clone()),
        );
        windows.insert(
            canary_version.clone(),
            MetricsWindow::new(config.window.clone()),
        );

        let point_detector = PointDetector::new(config.point_std_dev_threshold);

        Self {
            stable_version,
            canary_version,
            config,
            windows: RwLock::new(windows),
            point_detector,
            correlation_detector: CorrelationDetector::default(),
            deduper: AnomalyDeduper::default(),
        }
    }

    pub fn stable_version(&self) -> &str {
        &self.stable_version
    }

    pub fn canary_version(&self) -> &str {
        &self.canary_version
    }

    /// Append a sample to a version's window and return any freshly
    /// detected (non-deduplicated) anomalies.
    pub async fn record(&self, version: &str, sample: MetricsSample) -> Result<Vec<Anomaly>> {
        let (snapshot, other_snapshot) = {
            let mut windows = self.windows.write().await;
            let window = windows
                .get_mut(version)
                .ok_or_else(|| CanaryError::MetricsUnavailable(format!("unknown version {version}")))?;
            window.record(sample);
            let snapshot = window.snapshot();
            let other = self.other_version(version);
            let other_snapshot = windows
                .get(other)
                .map(|w| w.snapshot())
                .unwrap_or_default();
            (snapshot, other_snapshot)
        };

        Ok(self.detect_for(version, &snapshot, &other_snapshot))
    }

    /// Copy-on-read snapshot of a version's window
    pub async fn snapshot(&self, version: &str) -> Result<Vec<MetricsSample>> {
        let windows = self.windows.read().await;
        let window = windows
            .get(version)
            .ok_or_else(|| CanaryError::MetricsUnavailable(format!("unknown version {version}")))?;
        if window.is_empty() {
            return Err(CanaryError::MetricsUnavailable(format!(
                "no samples recorded for version {version}"
            )));
        }
        Ok(window.snapshot())
    }

    /// Aggregate of a version's current window, `None` while empty
    pub async fn aggregate(&self, version: &str) -> Option<WindowAggregate> {
        let windows = self.windows.read().await;
        windows.get(version).and_then(|w| w.aggregate())
    }

    /// Per-SLO compliance scores for one version
    ///
    /// Scores are only produced once the window's request volume reaches
    /// the configured floor; anything below reports insufficient data
    /// rather than a false 100 or 0.
    pub async fn slo_compliance(&self, version: &str) -> HashMap<String, SloCompliance> {
        let snapshot = {
            let windows = self.windows.read().await;
            windows.get(version).map(|w| w.snapshot()).unwrap_or_default()
        };

        let total_requests: u64 = snapshot.iter().map(|s| s.request_count).sum();
        let mut scores = HashMap::new();

        for slo in &self.config.slos {
            let compliance = if total_requests < self.config.min_request_count {
                SloCompliance::InsufficientData
            } else {
                let meeting: u64 = snapshot
                    .iter()
                    .filter(|s| sample_meets_slo(s, slo))
                    .map(|s| s.request_count)
                    .sum();
                SloCompliance::Scored(meeting as f64 / total_requests as f64 * 100.0)
            };
            scores.insert(slo.name.clone(), compliance);
        }

        scores
    }

    /// Run point and correlation detection for both versions on the
    /// current windows. Deduplication applies.
    pub async fn detect_anomalies(&self) -> Vec<Anomaly> {
        let (stable_snapshot, canary_snapshot) = {
            let windows = self.windows.read().await;
            (
                windows
                    .get(&self.stable_version)
                    .map(|w| w.snapshot())
                    .unwrap_or_default(),
                windows
                    .get(&self.canary_version)
                    .map(|w| w.snapshot())
                    .unwrap_or_default(),
            )
        };

        let mut anomalies =
            self.detect_for(&self.stable_version, &stable_snapshot, &canary_snapshot);
        anomalies.extend(self.detect_for(
            &self.canary_version,
            &canary_snapshot,
            &stable_snapshot,
        ));
        anomalies
    }

    fn other_version(&self, version: &str) -> &str {
        if version == self.stable_version {
            &self.canary_version
        } else {
            &self.stable_version
        }
    }

    fn detect_for(
        &self,
        version: &str,
        snapshot: &[MetricsSample],
        other_snapshot: &[MetricsSample],
    ) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        for metric in WATCHED_METRICS {
            let series = metric_series(snapshot, *metric);
            if let Some(anomaly) = self.point_detector.detect(version, *metric, &series) {
                if self.deduper.admit(&anomaly) {
                    anomalies.push(anomaly);
                }
            }

            // Correlation divergence is attributed to the canary only
            if version == self.canary_version {
                let stable_series = metric_series(other_snapshot, *metric);
                if let Some(anomaly) = self.correlation_detector.detect(
                    version,
                    *metric,
                    &stable_series,
                    &series,
                ) {
                    if self.deduper.admit(&anomaly) {
                        anomalies.push(anomaly);
                    }
                }
            }
        }

        anomalies
    }
}

fn sample_meets_slo(sample: &MetricsSample, slo: &Slo) -> bool {
    match slo.kind {
        SloKind::Availability => {
            100.0 - sample.error_rate_percent() >= slo.threshold
        }
        SloKind::LatencyP95Ms => sample.latency_p95_ms <= slo.threshold,
        SloKind::ErrorRatePercent => sample.error_rate_percent() <= slo.threshold,
    }
}
