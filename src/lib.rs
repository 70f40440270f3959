pub mod error;
pub mod external;
pub mod listener;
pub mod logging;
pub mod matcher;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod signature;
pub mod webhook;

#[cfg(test)]
mod test_utils;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{HookError, Result};

pub use orchestrator::Orchestrator;

pub type SharedState = Arc<Orchestrator>;

/// Daemon settings, read from TOML. Every field has a default.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Interface every webhook listener binds to.
    pub bind_host: String,
    pub pm2_bin: String,
    pub git_bin: String,
    /// Shell used for pre/post hooks, invoked as `<shell> -c <command>`.
    pub shell: String,
    pub poll_interval_secs: u64,
    /// Pause between restarting an application and its admin counterpart.
    pub settle_delay_secs: u64,
    pub admin_segment: String,
    /// Queue runs of the same application instead of letting them overlap.
    pub serialize_deploys: bool,
    /// Largest request body that is buffered and matched. Larger ones are
    /// still acknowledged, then dropped.
    pub max_body_bytes: usize,
    pub log_dir: Option<PathBuf>,
    pub max_log_files: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            pm2_bin: "pm2".to_string(),
            git_bin: "git".to_string(),
            shell: "sh".to_string(),
            poll_interval_secs: 2,
            settle_delay_secs: 5,
            admin_segment: pipeline::DEFAULT_ADMIN_SEGMENT.to_string(),
            serialize_deploys: false,
            max_body_bytes: 25 * 1024 * 1024,
            log_dir: None,
            max_log_files: 5,
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    /// Applies `BIND_HOST`, `PM2_BIN` and `LOG_DIR` from `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("BIND_HOST") {
            self.bind_host = host;
        }
        if let Some(bin) = lookup("PM2_BIN") {
            self.pm2_bin = bin;
        }
        if let Some(dir) = lookup("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        self
    }
}

/// Load and parse the configuration file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<DaemonConfig> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }

    let config_str = std::fs::read_to_string(path).map_err(|e| {
        HookError::InvalidConfiguration(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let config: DaemonConfig = toml::from_str(&config_str)?;
    Ok(config)
}
