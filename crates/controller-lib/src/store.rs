//! Durable state for deployments and A/B tests
//!
//! One JSON file per deployment and per test, written atomically via a
//! temp file and rename so a crash mid-write never leaves a truncated
//! document. Corrupt files are skipped on load with a warning.

use crate::abtest::AbTestConfig;
use crate::models::{CanaryConfig, CanaryState, PromotionHistoryEntry};
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Everything needed to rebuild a controller after a restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDeployment {
    pub config: CanaryConfig,
    pub state: CanaryState,
    pub current_weight: u8,
    pub paused: bool,
    pub last_weight_change: Option<i64>,
    pub started_at: Option<i64>,
    pub history: Vec<PromotionHistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedAbTest {
    pub config: AbTestConfig,
    /// subject_id -> variant name
    pub assignments: HashMap<String, String>,
}

pub struct StateStore {
    deployments_dir: PathBuf,
    abtests_dir: PathBuf,
}

impl StateStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let deployments_dir = root.join("deployments");
        let abtests_dir = root.join("abtests");
        fs::create_dir_all(&deployments_dir)
            .with_context(|| format!("creating {}", deployments_dir.display()))?;
        fs::create_dir_all(&abtests_dir)
            .with_context(|| format!("creating {}", abtests_dir.display()))?;
        Ok(Self {
            deployments_dir,
            abtests_dir,
        })
    }

    pub fn save_deployment(&self, deployment: &PersistedDeployment) -> Result<()> {
        let path = self
            .deployments_dir
            .join(file_name(&deployment.config.name));
        write_atomic(&path, deployment)
    }

    pub fn load_deployment(&self, name: &str) -> Result<Option<PersistedDeployment>> {
        read_optional(&self.deployments_dir.join(file_name(name)))
    }

    pub fn load_deployments(&self) -> Result<Vec<PersistedDeployment>> {
        read_dir(&self.deployments_dir)
    }

    pub fn remove_deployment(&self, name: &str) -> Result<()> {
        let path = self.deployments_dir.join(file_name(name));
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }

    pub fn save_ab_test(&self, test: &PersistedAbTest) -> Result<()> {
        let path = self.abtests_dir.join(file_name(&test.config.test_id));
        write_atomic(&path, test)
    }

    pub fn load_ab_tests(&self) -> Result<Vec<PersistedAbTest>> {
        read_dir(&self.abtests_dir)
    }
}

/// Identifier to file name, with path-hostile characters replaced
fn file_name(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{safe}.json")
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("serializing state")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

fn read_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => out.push(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping corrupt state file");
            }
        }
    }
    Ok(out)
}
