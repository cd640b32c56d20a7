//! Bounded, time-ordered sample windows
//!
//! Each version accumulates samples in a window bounded both by capacity
//! and by a maximum sample age, so the window is never unbounded. Readers
//! always work on a copied snapshot and never observe a partial eviction.

use crate::models::MetricsSample;
use std::collections::VecDeque;
use std::time::Duration;

/// Default maximum sample age (30 minutes)
const DEFAULT_MAX_AGE_SECS: u64 = 30 * 60;

/// Default maximum samples retained per version
const DEFAULT_MAX_SAMPLES: usize = 360;

/// Eviction bounds for a metrics window
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Samples older than this (relative to the newest) are evicted
    pub max_age: Duration,
    /// Hard cap on retained samples
    pub max_samples: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECS),
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

/// Time-ordered window of samples for one version
#[derive(Debug)]
pub struct MetricsWindow {
    samples: VecDeque<MetricsSample>,
    config: WindowConfig,
}

impl MetricsWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.max_samples.min(1024)),
            config,
        }
    }

    /// Append a sample, evicting by age and then by capacity
    pub fn record(&mut self, sample: MetricsSample) {
        let cutoff = sample.timestamp - self.config.max_age.as_secs() as i64;
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() >= self.config.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Copy-on-read snapshot of the current window
    pub fn snapshot(&self) -> Vec<MetricsSample> {
        self.samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Aggregate the window into a single comparable summary
    pub fn aggregate(&self) -> Option<WindowAggregate> {
        aggregate(self.samples.iter())
    }
}

/// Request-weighted summary of one version's window
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WindowAggregate {
    pub sample_count: usize,
    pub request_count: u64,
    pub error_count: u64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub cpu_usage_cores: Option<f64>,
    pub oldest_timestamp: i64,
    pub newest_timestamp: i64,
}

impl WindowAggregate {
    /// Aggregate error rate in percent
    pub fn error_rate_percent(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.request_count as f64 * 100.0
    }
}

fn aggregate<'a>(samples: impl Iterator<Item = &'a MetricsSample>) -> Option<WindowAggregate> {
    let mut sample_count = 0usize;
    let mut requests = 0u64;
    let mut errors = 0u64;
    let mut p50_weighted = 0.0;
    let mut p95_weighted = 0.0;
    let mut p99_weighted = 0.0;
    let mut cpu_sum = 0.0;
    let mut cpu_count = 0usize;
    let mut oldest = i64::MAX;
    let mut newest = i64::MIN;

    for s in samples {
        sample_count += 1;
        requests += s.request_count;
        errors += s.error_count;
        let w = s.request_count as f64;
        p50_weighted += s.latency_p50_ms * w;
        p95_weighted += s.latency_p95_ms * w;
        p99_weighted += s.latency_p99_ms * w;
        if let Some(cpu) = s.cpu_usage_cores {
            cpu_sum += cpu;
            cpu_count += 1;
        }
        oldest = oldest.min(s.timestamp);
        newest = newest.max(s.timestamp);
    }

    if sample_count == 0 {
        return None;
    }

    // Latency percentiles are request-weighted means of the per-sample
    // percentiles. Exact merging would need the raw distributions.
    let total = requests as f64;
    let (p50, p95, p99) = if requests > 0 {
        (
            p50_weighted / total,
            p95_weighted / total,
            p99_weighted / total,
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    Some(WindowAggregate {
        sample_count,
        request_count: requests,
        error_count: errors,
        latency_p50_ms: p50,
        latency_p95_ms: p95,
        latency_p99_ms: p99,
        cpu_usage_cores: if cpu_count > 0 {
            Some(cpu_sum / cpu_count as f64)
        } else {
            None
        },
        oldest_timestamp: oldest,
        newest_timestamp: newest,
    })
}
