//! Correlation anomaly detection
//!
//! Compares the trailing trend of the same metric on the stable and
//! canary versions. A canary climbing while stable stays flat is a
//! divergence the per-version point detector cannot see.

use super::{Anomaly, AnomalyKind, AnomalyMetric, Severity};

/// Minimum points per side before trends are compared
const MIN_SAMPLES_FOR_TREND: usize = 8;

/// Fraction of canary deltas that must be non-decreasing
const MONOTONICITY_THRESHOLD: f64 = 0.8;

/// Detects stable/canary trend divergence on one metric
pub struct CorrelationDetector {
    /// Trailing points considered on each side
    pub trailing_samples: usize,
    /// Minimum canary slope, as value units per second, to count as rising
    pub slope_threshold: f64,
}

impl CorrelationDetector {
    pub fn new(trailing_samples: usize, slope_threshold: f64) -> Self {
        Self {
            trailing_samples,
            slope_threshold,
        }
    }

    /// Compare trends; any anomaly is attributed to the canary version.
    pub fn detect(
        &self,
        canary_version: &str,
        metric: AnomalyMetric,
        stable: &[(i64, f64)],
        canary: &[(i64, f64)],
    ) -> Option<Anomaly> {
        let stable = tail(stable, self.trailing_samples);
        let canary = tail(canary, self.trailing_samples);

        if stable.len() < MIN_SAMPLES_FOR_TREND || canary.len() < MIN_SAMPLES_FOR_TREND {
            return None;
        }

        let canary_slope = regression_slope(canary);
        let stable_slope = regression_slope(stable);

        if canary_slope < self.slope_threshold {
            return None;
        }
        if monotonicity(canary) < MONOTONICITY_THRESHOLD {
            return None;
        }
        // Stable rising in step means a shared upstream cause, not a
        // canary regression.
        if stable_slope > canary_slope * 0.5 {
            return None;
        }

        let divergence = if stable_slope.abs() > f64::EPSILON {
            canary_slope / stable_slope.abs()
        } else {
            f64::INFINITY
        };

        let severity = if divergence >= 10.0 && canary_slope >= self.slope_threshold * 4.0 {
            Severity::High
        } else if divergence >= 4.0 {
            Severity::Medium
        } else {
            Severity::Low
        };

        let timestamp = canary.last().map(|(ts, _)| *ts).unwrap_or(0);
        let evidence = format!(
            "{} canary slope {:+.4}/s vs stable slope {:+.4}/s over {} samples",
            metric,
            canary_slope,
            stable_slope,
            canary.len()
        );

        Some(Anomaly {
            kind: AnomalyKind::Correlation,
            metric,
            severity,
            version: canary_version.to_string(),
            evidence,
            timestamp,
        })
    }
}

impl Default for CorrelationDetector {
    fn default() -> Self {
        // 0.01 units/sec: ~0.6 percentage points of error rate per minute
        Self::new(30, 0.01)
    }
}

fn tail(series: &[(i64, f64)], n: usize) -> &[(i64, f64)] {
    let start = series.len().saturating_sub(n);
    &series[start..]
}

/// Least-squares slope in value units per second
fn regression_slope(series: &[(i64, f64)]) -> f64 {
    let n = series.len() as f64;
    if n < 2.0 {
        return 0.0;
    }

    // Normalize timestamps to avoid precision loss
    let t0 = series.first().map(|(ts, _)| *ts).unwrap_or(0) as f64;

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;

    for (ts, v) in series {
        let x = *ts as f64 - t0;
        sum_x += x;
        sum_y += v;
        sum_xy += x * v;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

/// Fraction of consecutive pairs that are non-decreasing
fn monotonicity(series: &[(i64, f64)]) -> f64 {
    if series.len() < 2 {
        return 0.0;
    }
    let increasing = series
        .windows(2)
        .filter(|w| w[1].1 >= w[0].1)
        .count();
    increasing as f64 / (series.len() - 1) as f64
}
