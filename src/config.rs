use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::spi::{DataAddress, Policy};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    /// Identity of this runtime instance; recorded as lessor and data flow owner
    #[serde(default = "default_runtime_id")]
    pub runtime_id: String,
    /// Participant id announced to data planes
    #[serde(default = "default_participant_id")]
    pub participant_id: String,
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub state_machine: StateMachineConfig,
    #[serde(default)]
    pub transfer_process: TransferProcessConfig,
    #[serde(default)]
    pub data_plane: DataPlaneConfig,
    /// PostgreSQL connection URL; in-memory stores are used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    /// Static contract policies, keyed by contract id
    #[serde(default)]
    pub policies: HashMap<String, Policy>,
    /// Static asset content addresses, keyed by asset id
    #[serde(default)]
    pub assets: HashMap<String, DataAddress>,
}

fn default_runtime_id() -> String {
    format!("runtime-{}", ulid::Ulid::new().to_string().to_lowercase())
}

fn default_participant_id() -> String {
    "participant".to_string()
}

/// Scheduling loop configuration shared by both state machines
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StateMachineConfig {
    /// Maximum entities leased per poll
    pub batch_size: usize,
    /// Poll pause after a productive poll
    pub min_wait_ms: u64,
    /// Poll pause cap after consecutive empty polls
    pub max_wait_ms: u64,
    /// Lease lifetime; an expired lease may be taken over by another runtime
    pub lease_duration_ms: u64,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            min_wait_ms: 100,
            max_wait_ms: 5_000,
            lease_duration_ms: 60_000,
        }
    }
}

impl StateMachineConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }
}

/// Per-entity retry configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts in one state before giving up
    pub limit: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: 7,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferProcessConfig {
    pub retry: RetryConfig,
    /// Protocol endpoint of this connector, sent as callback address
    pub callback_address: String,
    pub protocol: String,
}

impl Default for TransferProcessConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            callback_address: "http://localhost:8282/protocol".to_string(),
            protocol: "dataspace-protocol-http".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DataPlaneConfig {
    pub retry: RetryConfig,
    /// A STARTED flow of another runtime not updated for this long is taken over
    pub staleness_threshold_ms: u64,
    /// Own STARTED flows are re-saved at this interval
    pub heartbeat_interval_ms: u64,
    /// Attempts to lease a flow when its transfer completes
    pub completion_lease_attempts: u32,
    pub completion_lease_wait_ms: u64,
    /// Control plane endpoint used when a flow carries no callback address
    pub control_plane_url: Option<String>,
    /// Base URL handed to consumers of pull transfers
    pub public_api_url: String,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            staleness_threshold_ms: 60_000,
            heartbeat_interval_ms: 20_000,
            completion_lease_attempts: 10,
            completion_lease_wait_ms: 200,
            control_plane_url: None,
            public_api_url: "http://localhost:8185/public".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.state_machine.batch_size > 0,
            "state_machine.batch_size must be positive"
        );
        anyhow::ensure!(
            self.state_machine.min_wait_ms <= self.state_machine.max_wait_ms,
            "state_machine.min_wait_ms must not exceed max_wait_ms"
        );
        anyhow::ensure!(
            self.data_plane.heartbeat_interval_ms < self.data_plane.staleness_threshold_ms,
            "data_plane.heartbeat_interval_ms must be below staleness_threshold_ms"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: connector.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert!(config.runtime_id.starts_with("runtime-"));
        assert_eq!(config.state_machine.batch_size, 20);
        assert_eq!(config.transfer_process.retry, RetryConfig::default());
        assert_eq!(config.data_plane.completion_lease_attempts, 10);
        assert!(config.postgres_url.is_none());
        assert!(config.policies.is_empty());
    }

    #[test]
    fn test_sections_and_static_entries() {
        let yaml = format!(
            "{MINIMAL}
runtime_id: runtime-a
state_machine:
  batch_size: 5
transfer_process:
  retry:
    limit: 2
policies:
  contract-1:
    assigner: provider
assets:
  asset-1:
    type: File
    properties:
      path: /data/a.csv
"
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.runtime_id, "runtime-a");
        assert_eq!(config.state_machine.batch_size, 5);
        assert_eq!(config.state_machine.max_wait_ms, 5_000);
        assert_eq!(config.transfer_process.retry.limit, 2);
        assert_eq!(config.transfer_process.retry.base_delay_ms, 1_000);
        assert_eq!(
            config.policies["contract-1"].assigner.as_deref(),
            Some("provider")
        );
        assert_eq!(
            config.assets["asset-1"].property("path"),
            Some("/data/a.csv")
        );
    }

    #[test]
    fn test_rejects_heartbeat_above_staleness() {
        let yaml = format!(
            "{MINIMAL}
data_plane:
  staleness_threshold_ms: 1000
  heartbeat_interval_ms: 5000
"
        );
        assert!(AppConfig::from_yaml(&yaml).is_err());
    }
}
