//! Traffic splitter and readiness collaborator boundaries
//!
//! The controller never assumes mesh state beyond the adapter's return
//! value. Adapter calls may block on external I/O, so they are wrapped
//! with a timeout and a small retry budget; exhausting the budget leaves
//! the weight treated as not-yet-applied.

use crate::error::{CanaryError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Applies a traffic weight split. Implemented by the mesh/ingress adapter.
#[async_trait]
pub trait TrafficSplitter: Send + Sync {
    /// Route `canary_percent` of live traffic to the canary version
    async fn set_weight(&self, deployment_id: &str, canary_percent: u8) -> Result<()>;
}

/// Readiness collaborator polled before start and before weight increases
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn is_healthy(&self, version: &str) -> bool;
}

/// Timeout and retry budget for adapter calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Per-attempt timeout; bounded by the analysis interval
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Wraps a splitter with per-attempt timeouts and bounded retries
pub struct RetryingSplitter {
    inner: Arc<dyn TrafficSplitter>,
    policy: RetryPolicy,
}

impl RetryingSplitter {
    pub fn new(inner: Arc<dyn TrafficSplitter>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl TrafficSplitter for RetryingSplitter {
    async fn set_weight(&self, deployment_id: &str, canary_percent: u8) -> Result<()> {
        let mut backoff = self.policy.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            let call = self.inner.set_weight(deployment_id, canary_percent);
            match timeout(self.policy.call_timeout, call).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_error = format!(
                        "timed out after {}ms",
                        self.policy.call_timeout.as_millis()
                    );
                }
            }

            warn!(
                deployment_id = %deployment_id,
                canary_percent = canary_percent,
                attempt = attempt,
                error = %last_error,
                "Traffic splitter call failed"
            );

            if attempt < self.policy.max_attempts {
                sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(CanaryError::Adapter(format!(
            "set_weight({deployment_id}, {canary_percent}) failed after {} attempts: {last_error}",
            self.policy.max_attempts
        )))
    }
}
