//! Point anomaly detection
//!
//! Flags the newest observation of a metric when it deviates from the
//! trailing mean by more than a configured number of standard deviations.

use super::{Anomaly, AnomalyKind, AnomalyMetric, Severity};

/// Minimum trailing samples required before a point can be judged
const MIN_TRAILING_SAMPLES: usize = 5;

/// Mean and standard deviation over a trailing series
#[derive(Debug, Clone)]
pub struct TrailingStats {
    pub mean: f64,
    pub std_dev: f64,
    pub count: usize,
}

impl TrailingStats {
    /// Compute over a series of (timestamp, value) points
    pub fn compute(series: &[(i64, f64)]) -> Self {
        let count = series.len();
        if count == 0 {
            return Self {
                mean: 0.0,
                std_dev: 0.0,
                count: 0,
            };
        }

        let mean = series.iter().map(|(_, v)| v).sum::<f64>() / count as f64;

        // Sample variance with Bessel's correction
        let std_dev = if count > 1 {
            let variance = series
                .iter()
                .map(|(_, v)| (v - mean).powi(2))
                .sum::<f64>()
                / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        Self {
            mean,
            std_dev,
            count,
        }
    }
}

/// Detects single observations exceeding a standard-deviation threshold
pub struct PointDetector {
    /// Number of standard deviations considered anomalous
    pub std_dev_threshold: f64,
}

impl PointDetector {
    pub fn new(std_dev_threshold: f64) -> Self {
        Self { std_dev_threshold }
    }

    /// Judge the newest point of `series` against the trailing points.
    ///
    /// The last element is the observation under test; everything before
    /// it forms the trailing baseline.
    pub fn detect(
        &self,
        version: &str,
        metric: AnomalyMetric,
        series: &[(i64, f64)],
    ) -> Option<Anomaly> {
        let (current, trailing) = series.split_last()?;
        if trailing.len() < MIN_TRAILING_SAMPLES {
            return None;
        }

        let stats = TrailingStats::compute(trailing);
        let (current_ts, current_value) = *current;

        let z_score = if stats.std_dev < f64::EPSILON {
            // Flat baseline: any upward departure is an unambiguous step
            if current_value > stats.mean + f64::EPSILON {
                f64::INFINITY
            } else {
                return None;
            }
        } else {
            (current_value - stats.mean) / stats.std_dev
        };

        if z_score <= self.std_dev_threshold {
            return None;
        }

        let severity = self.severity_for(z_score, current_value, stats.mean);
        let evidence = format!(
            "{} {:.3} vs trailing mean {:.3} over {} samples (z={:.1})",
            metric, current_value, stats.mean, stats.count, z_score
        );

        Some(Anomaly {
            kind: AnomalyKind::Point,
            metric,
            severity,
            version: version.to_string(),
            evidence,
            timestamp: current_ts,
        })
    }

    fn severity_for(&self, z_score: f64, current: f64, mean: f64) -> Severity {
        // A value many multiples of a non-trivial baseline is high
        // regardless of how tight the trailing variance happens to be.
        let magnitude_ratio = if mean > f64::EPSILON {
            current / mean
        } else {
            f64::INFINITY
        };

        if z_score >= self.std_dev_threshold + 2.0 || magnitude_ratio >= 5.0 {
            Severity::High
        } else if z_score >= self.std_dev_threshold + 1.0 || magnitude_ratio >= 2.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl Default for PointDetector {
    fn default() -> Self {
        Self::new(3.0)
    }
}
