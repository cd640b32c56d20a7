//! Per-version metric sampling loop
//!
//! One loop runs per version of a deployment, pulling samples from a
//! `MetricsSource` at a fixed interval and recording them into the
//! collector. High-severity anomalies found while recording are forwarded
//! to the controller's anomaly channel so rollback does not wait for the
//! next scheduled analysis tick.

use super::MetricsCollector;
use crate::anomaly::Anomaly;
use crate::models::MetricsSample;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Source of raw metric samples for a version, implemented by the
/// metrics substrate adapter (mesh telemetry, scrape endpoint, ...)
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self, version: &str) -> Result<MetricsSample>;
}

/// Configuration for one sampling loop
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Interval between samples
    pub interval: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Periodic sampling task for one version
pub struct SamplingLoop {
    source: Arc<dyn MetricsSource>,
    collector: Arc<MetricsCollector>,
    version: String,
    config: SamplingConfig,
    /// Rollback-trigger anomalies are forwarded here
    anomaly_tx: mpsc::Sender<Anomaly>,
}

impl SamplingLoop {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        collector: Arc<MetricsCollector>,
        version: impl Into<String>,
        config: SamplingConfig,
        anomaly_tx: mpsc::Sender<Anomaly>,
    ) -> Self {
        Self {
            source,
            collector,
            version: version.into(),
            config,
            anomaly_tx,
        }
    }

    /// Run until the shutdown channel fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            version = %self.version,
            interval_secs = self.config.interval.as_secs(),
            "Starting metrics sampling loop"
        );

        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sample_once().await;
                }
                _ = shutdown.recv() => {
                    info!(version = %self.version, "Shutting down sampling loop");
                    break;
                }
            }
        }
    }

    /// Pull one sample, record it, and forward rollback triggers
    pub async fn sample_once(&self) {
        let sample = match self.source.sample(&self.version).await {
            Ok(s) => s,
            Err(e) => {
                // Sampling failures surface as insufficient data downstream
                warn!(version = %self.version, error = %e, "Failed to sample metrics");
                return;
            }
        };

        let anomalies = match self.collector.record(&self.version, sample).await {
            Ok(a) => a,
            Err(e) => {
                warn!(version = %self.version, error = %e, "Failed to record sample");
                return;
            }
        };

        for anomaly in anomalies {
            debug!(
                version = %self.version,
                metric = %anomaly.metric,
                severity = %anomaly.severity,
                evidence = %anomaly.evidence,
                "Anomaly detected"
            );
            if let Err(e) = self.anomaly_tx.send(anomaly).await {
                warn!(version = %self.version, error = %e, "Failed to forward anomaly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorConfig;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ScriptedSource {
        calls: AtomicU64,
    }

    #[async_trait]
    impl MetricsSource for ScriptedSource {
        async fn sample(&self, _version: &str) -> Result<MetricsSample> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            // Stable 1% baseline, then a 10x error spike
            let errors = if n < 20 { 10 } else { 100 };
            Ok(MetricsSample {
                timestamp: n as i64 * 10,
                request_count: 1000,
                error_count: errors,
                latency_p50_ms: 10.0,
                latency_p95_ms: 50.0,
                latency_p99_ms: 90.0,
                cpu_usage_cores: Some(0.4),
                memory_usage_bytes: None,
            })
        }
    }

    struct FailingSource;

    #[async_trait]
    impl MetricsSource for FailingSource {
        async fn sample(&self, _version: &str) -> Result<MetricsSample> {
            anyhow::bail!("scrape endpoint unreachable")
        }
    }

    #[tokio::test]
    async fn test_samples_are_recorded() {
        let collector = Arc::new(MetricsCollector::new(
            "v1",
            "v2",
            CollectorConfig::default(),
        ));
        let (tx, _rx) = mpsc::channel(16);
        let sampling = SamplingLoop::new(
            Arc::new(ScriptedSource {
                calls: AtomicU64::new(0),
            }),
            collector.clone(),
            "v2",
            SamplingConfig::default(),
            tx,
        );

        for _ in 0..5 {
            sampling.sample_once().await;
        }

        let agg = collector.aggregate("v2").await.unwrap();
        assert_eq!(agg.sample_count, 5);
    }

    #[tokio::test]
    async fn test_spike_forwarded_to_anomaly_channel() {
        let collector = Arc::new(MetricsCollector::new(
            "v1",
            "v2",
            CollectorConfig::default(),
        ));
        let (tx, mut rx) = mpsc::channel(16);
        let sampling = SamplingLoop::new(
            Arc::new(ScriptedSource {
                calls: AtomicU64::new(0),
            }),
            collector,
            "v2",
            SamplingConfig::default(),
            tx,
        );

        // 20 baseline samples then the spike
        for _ in 0..21 {
            sampling.sample_once().await;
        }

        let anomaly = rx.try_recv().expect("expected forwarded anomaly");
        assert!(anomaly.is_rollback_trigger());
    }

    #[tokio::test]
    async fn test_source_failure_does_not_record() {
        let collector = Arc::new(MetricsCollector::new(
            "v1",
            "v2",
            CollectorConfig::default(),
        ));
        let (tx, _rx) = mpsc::channel(16);
        let sampling = SamplingLoop::new(
            Arc::new(FailingSource),
            collector.clone(),
            "v2",
            SamplingConfig::default(),
            tx,
        );

        sampling.sample_once().await;

        assert!(collector.aggregate("v2").await.is_none());
    }
}
