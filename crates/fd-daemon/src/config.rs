//! Daemon configuration loading.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fault_detection::{FaultDetectionConfig, NodeId};
use serde::{Deserialize, Serialize};

/// Main configuration for the fault detection daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Human-readable node name
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Persistent node ID (generated at startup if not set)
    #[serde(default)]
    pub node_id: Option<NodeId>,

    /// Address to listen on for incoming connections
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Address other nodes should use to reach us (defaults to the bound address)
    #[serde(default)]
    pub advertised_address: Option<String>,

    /// Cluster name; pings from other clusters are rejected
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Addresses dialed to discover cluster members
    #[serde(default)]
    pub seeds: Vec<String>,

    /// How often unconnected seeds are dialed, in milliseconds (default: 1s)
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_ms: u64,

    /// Ping settings (durations in milliseconds)
    #[serde(default)]
    pub fault_detection: FaultDetectionConfig,
}

fn default_node_name() -> String {
    "node".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:9300".to_string()
}

fn default_cluster_name() -> String {
    "fault-detection".to_string()
}

fn default_discovery_interval() -> u64 {
    1000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            node_id: None,
            listen: default_listen(),
            advertised_address: None,
            cluster_name: default_cluster_name(),
            seeds: Vec::new(),
            discovery_interval_ms: default_discovery_interval(),
            fault_detection: FaultDetectionConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the config directory.
    ///
    /// Writes a default `config.json` for reference if none exists.
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_file = config_path.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: DaemonConfig = serde_json::from_str(&content)
                .with_context(|| "Failed to parse config.json")?;
            config
                .fault_detection
                .validate()
                .with_context(|| format!("Invalid fault_detection section in {:?}", config_file))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = DaemonConfig::default();

            std::fs::create_dir_all(config_path)
                .with_context(|| format!("Failed to create config directory: {:?}", config_path))?;

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms.max(1))
    }
}
