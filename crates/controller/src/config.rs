//! Controller process configuration

use anyhow::Result;
use serde::Deserialize;

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Instance name used as the logging scope
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for operator, health and metrics endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory holding persisted deployment and A/B test state
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Resume persisted non-terminal deployments on startup
    #[serde(default = "default_resume_on_start")]
    pub resume_on_start: bool,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "canary-controller".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_state_dir() -> String {
    "/var/lib/canary-controller".to_string()
}

fn default_resume_on_start() -> bool {
    true
}

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CANARY"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| ControllerConfig {
            instance_name: default_instance_name(),
            api_port: default_api_port(),
            state_dir: default_state_dir(),
            resume_on_start: default_resume_on_start(),
        }))
    }
}
