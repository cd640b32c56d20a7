//! Built-in traffic splitter and health checker adapters
//!
//! The default build ships a dry-run splitter: weight changes are
//! logged and tracked but not pushed to a mesh. Mesh-specific adapters
//! implement the same `TrafficSplitter` trait against their control
//! plane API.

use async_trait::async_trait;
use controller_lib::controller::{HealthChecker, TrafficSplitter};
use controller_lib::Result;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::info;

/// Records applied weights without driving a real mesh
#[derive(Default)]
pub struct DryRunSplitter {
    weights: RwLock<HashMap<String, u8>>,
}

impl DryRunSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight(&self, deployment_id: &str) -> Option<u8> {
        self.weights.read().unwrap().get(deployment_id).copied()
    }
}

#[async_trait]
impl TrafficSplitter for DryRunSplitter {
    async fn set_weight(&self, deployment_id: &str, canary_percent: u8) -> Result<()> {
        self.weights
            .write()
            .unwrap()
            .insert(deployment_id.to_string(), canary_percent);
        info!(
            deployment_id = %deployment_id,
            canary_percent = canary_percent,
            "Applied traffic weight (dry-run)"
        );
        Ok(())
    }
}

/// Treats every version as ready; deployment readiness is assumed to be
/// gated by the platform's own probes before a canary is launched
pub struct PlatformHealthChecker;

#[async_trait]
impl HealthChecker for PlatformHealthChecker {
    async fn is_healthy(&self, _version: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_splitter_tracks_weights() {
        let splitter = DryRunSplitter::new();
        splitter.set_weight("checkout", 5).await.unwrap();
        splitter.set_weight("checkout", 25).await.unwrap();

        assert_eq!(splitter.weight("checkout"), Some(25));
        assert_eq!(splitter.weight("billing"), None);
    }
}
