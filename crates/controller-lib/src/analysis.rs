//! Stable-versus-canary analysis
//!
//! `analyze` is a pure function over two window aggregates and the
//! deployment config: identical inputs always produce the same verdict
//! and reason. Checks run in a fixed order and the first failing check
//! wins, which keeps the behavior deterministic and testable:
//!
//! 1. insufficient data (either window below the request floor)
//! 2. error-rate delta against `max_error_rate_percent`
//! 3. p95 latency delta against `max_latency_increase_percent`
//! 4. two-proportion significance test (advisory only)
//! 5. promote

use crate::collector::WindowAggregate;
use crate::models::CanaryConfig;
use serde::{Deserialize, Serialize};

/// Two-tailed critical value for the advisory significance note (95%)
const Z_CRITICAL: f64 = 1.96;

/// Per-arm request floor before the z-test approximation is trusted
const MIN_REQUESTS_FOR_Z_TEST: u64 = 100;

/// Decision for one evaluation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Keep observing; no weight change
    Continue,
    /// Canary is healthy; a weight increase is allowed
    Promote,
    /// Canary violated a threshold; cut traffic to zero
    Rollback,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Continue => "continue",
            Verdict::Promote => "promote",
            Verdict::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// Verdict plus the human-readable reason backing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub verdict: Verdict,
    pub reason: String,
}

impl Analysis {
    fn new(verdict: Verdict, reason: impl Into<String>) -> Self {
        Self {
            verdict,
            reason: reason.into(),
        }
    }
}

/// Compare the stable and canary windows against the configured thresholds
pub fn analyze(
    stable: Option<&WindowAggregate>,
    canary: Option<&WindowAggregate>,
    config: &CanaryConfig,
) -> Analysis {
    // 1. Insufficient data: below the floor no verdict is meaningful.
    let (stable, canary) = match (stable, canary) {
        (Some(s), Some(c))
            if s.request_count >= config.min_request_count
                && c.request_count >= config.min_request_count =>
        {
            (s, c)
        }
        _ => {
            return Analysis::new(
                Verdict::Continue,
                format!(
                    "insufficient data: stable={} canary={} requests, need {}",
                    stable.map(|a| a.request_count).unwrap_or(0),
                    canary.map(|a| a.request_count).unwrap_or(0),
                    config.min_request_count
                ),
            );
        }
    };

    // 2. Error-rate delta.
    let stable_error_rate = stable.error_rate_percent();
    let canary_error_rate = canary.error_rate_percent();
    let error_delta = canary_error_rate - stable_error_rate;
    if error_delta > config.max_error_rate_percent {
        return Analysis::new(
            Verdict::Rollback,
            format!(
                "error rate delta {:.2}% exceeds threshold {:.2}% \
                 (canary {:.2}%, stable {:.2}%)",
                error_delta, config.max_error_rate_percent, canary_error_rate, stable_error_rate
            ),
        );
    }

    // 3. p95 latency delta.
    if stable.latency_p95_ms > 0.0 {
        let latency_increase =
            (canary.latency_p95_ms - stable.latency_p95_ms) / stable.latency_p95_ms * 100.0;
        if latency_increase > config.max_latency_increase_percent {
            return Analysis::new(
                Verdict::Rollback,
                format!(
                    "p95 latency increase {:.1}% exceeds threshold {:.1}% \
                     (canary {:.1}ms, stable {:.1}ms)",
                    latency_increase,
                    config.max_latency_increase_percent,
                    canary.latency_p95_ms,
                    stable.latency_p95_ms
                ),
            );
        }
    }

    // 4. Significance test on error proportions, advisory only: it
    // annotates the reason but never flips the verdict.
    let mut reason = "all metrics within acceptable thresholds".to_string();
    if let Some(z) = two_proportion_z_score(
        stable.error_count,
        stable.request_count,
        canary.error_count,
        canary.request_count,
    ) {
        if z > Z_CRITICAL {
            reason.push_str(&format!(
                " (note: canary error rate elevated with statistical significance, z={z:.2})"
            ));
        }
    }

    // 5. Promote.
    Analysis::new(Verdict::Promote, reason)
}

/// Two-proportion z-score of the canary error rate against stable.
///
/// Pooled variance, two-tailed framing, no continuity correction.
/// Positive values mean the canary proportion is higher. Returns `None`
/// when either arm is too small for the normal approximation.
pub fn two_proportion_z_score(
    stable_errors: u64,
    stable_requests: u64,
    canary_errors: u64,
    canary_requests: u64,
) -> Option<f64> {
    if stable_requests < MIN_REQUESTS_FOR_Z_TEST || canary_requests < MIN_REQUESTS_FOR_Z_TEST {
        return None;
    }

    let p1 = stable_errors as f64 / stable_requests as f64;
    let p2 = canary_errors as f64 / canary_requests as f64;
    let pooled =
        (stable_errors + canary_errors) as f64 / (stable_requests + canary_requests) as f64;

    let variance =
        pooled * (1.0 - pooled) * (1.0 / stable_requests as f64 + 1.0 / canary_requests as f64);
    if variance <= f64::EPSILON {
        return None;
    }

    Some((p2 - p1) / variance.sqrt())
}
