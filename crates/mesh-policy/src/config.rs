use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration, usually read from a TOML file
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct PolicyEngineConfig {
    #[serde(default)]
    pub policy: PolicySection,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PolicySection {
    /// Directory holding `.policy` files
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Seconds between rescans of the directory, 0 loads once and does not watch
    #[serde(default)]
    pub watch_interval_secs: u64,

    /// Public keys for workload signature checks; no checks when unset
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Password given to workloads that do not set their own
    #[serde(default)]
    pub default_workload_password: String,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            watch_interval_secs: 0,
            key_path: None,
            default_workload_password: String::new(),
        }
    }
}

impl PolicySection {
    /// Rescan interval, `None` when watching is off
    pub fn watch_interval(&self) -> Option<Duration> {
        (self.watch_interval_secs > 0).then(|| Duration::from_secs(self.watch_interval_secs))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct LoggingSection {
    /// Log level filter, e.g. `info` or `mesh_policy=debug`
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: default_level() }
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from("/etc/mesh/policy.d")
}

fn default_level() -> String {
    "info".to_string()
}

pub fn load_engine_config(path: &Path) -> anyhow::Result<PolicyEngineConfig> {
    let config_content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file from {}: {}", path.display(), e))?;
    let config: PolicyEngineConfig = toml::from_str(&config_content)
        .map_err(|e| anyhow::anyhow!("Failed to parse TOML config from {}: {}", path.display(), e))?;
    Ok(config)
}
