use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server-wide configuration: bind address, data directory, auth token and
/// the tunable constants the orchestrator otherwise hard-codes.
///
/// Loaded from an optional `forge-server.toml` next to the data directory,
/// then overridden by CLI flags, then by the `AUTODEV_TOKEN` environment
/// variable for the token field specifically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            data_dir: default_data_dir(),
            token: None,
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

/// Tunables for the orchestrator core that the distilled design left
/// hard-coded constants; exposed here per the loop-detector Open Question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSettings {
    #[serde(default = "default_loop_window")]
    pub loop_detect_window: usize,
    #[serde(default = "default_loop_similarity")]
    pub loop_detect_similarity: f64,
    #[serde(default = "default_first_output_heartbeat_secs")]
    pub first_output_heartbeat_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_loop_kill_grace_secs")]
    pub loop_kill_grace_secs: u64,
    #[serde(default = "default_chain_delay_secs")]
    pub chain_delay_secs: u64,
    #[serde(default = "default_watcher_interval_secs")]
    pub watcher_interval_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            loop_detect_window: default_loop_window(),
            loop_detect_similarity: default_loop_similarity(),
            first_output_heartbeat_secs: default_first_output_heartbeat_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            loop_kill_grace_secs: default_loop_kill_grace_secs(),
            chain_delay_secs: default_chain_delay_secs(),
            watcher_interval_secs: default_watcher_interval_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    4173
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".autodev-data")
}
fn default_loop_window() -> usize {
    5
}
fn default_loop_similarity() -> f64 {
    0.5
}
fn default_first_output_heartbeat_secs() -> u64 {
    15
}
fn default_stop_grace_secs() -> u64 {
    5
}
fn default_loop_kill_grace_secs() -> u64 {
    3
}
fn default_chain_delay_secs() -> u64 {
    3
}
fn default_watcher_interval_secs() -> u64 {
    3
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read forge-server.toml: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse forge-server.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize forge-server.toml: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from `path` if it exists, else fall back to defaults; either way
    /// apply the `AUTODEV_TOKEN` environment variable on top when set.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        if let Ok(token) = std::env::var("AUTODEV_TOKEN") {
            config.token = Some(token);
        }
        Ok(config)
    }
}
