use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fault::{FailConfig, FailMode};

pub const DEFAULT_PORT: u16 = 2224;
const DEFAULT_CONFIG_FILE: &str = ".testsshd.yaml";

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default, alias = "fail-mode")]
    pub fail_mode: FailMode,
    #[serde(default, alias = "fail-after")]
    pub fail_after: i64,
    /// OpenSSH private key to use as host key. Ephemeral when unset.
    #[serde(default, alias = "host-key")]
    pub host_key: Option<PathBuf>,
    #[serde(default = "default_log_level", alias = "log-level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            fail_mode: FailMode::None,
            fail_after: 0,
            host_key: None,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// `$HOME/.testsshd.yaml`
    pub fn default_file_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_FILE))
    }

    /// Pick the config file to read. An explicit path must exist; the
    /// default one is optional.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                Ok(Some(path.to_path_buf()))
            }
            None => Ok(Self::default_file_path().filter(|p| p.exists())),
        }
    }

    /// Parse a config file; `.json` files as JSON, anything else as YAML.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else if contents.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&contents).context("Failed to parse config file")?
        };
        Ok(config)
    }

    pub fn fail_config(&self) -> FailConfig {
        FailConfig::new(self.fail_mode, self.fail_after)
    }

    pub fn listen_addr(&self) -> String {
        if self.bind.contains(':') && !self.bind.starts_with('[') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }
}
