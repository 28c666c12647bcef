// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

// Engine Configuration
//
// Settings collaborator for the stack engine:
// - Stacks root directory (one sub-directory per stack)
// - Docker connection
// - Auto-update switch, poll interval and opt-in label
// - Runtime tunables (stop timeout, status cache TTL, rename attempts)
// - Logging and metrics

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::compose::labels;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BerthConfig {
    /// Directory holding one sub-directory per stack
    #[serde(default = "default_stacks_root")]
    pub stacks_root: PathBuf,

    /// Path to Docker socket (None = platform default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_socket_path: Option<String>,

    #[serde(default)]
    pub auto_update: AutoUpdateConfig,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoUpdateConfig {
    /// Global switch; when off, ticks are skipped entirely
    #[serde(default)]
    pub enabled: bool,

    /// Poll interval (e.g. "15m")
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Opt-in label checked on containers and compose services
    #[serde(default = "default_auto_update_label")]
    pub label: String,
}

impl Default for AutoUpdateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_interval(),
            label: default_auto_update_label(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Grace period before the engine kills a stopping container
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: i64,

    /// TTL of the stack listing cache
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub status_cache_ttl: Duration,

    /// Slug disambiguation attempts on rename
    #[serde(default = "default_rename_attempts")]
    pub rename_max_attempts: u32,

    /// On recreate, prefer an attached non-bridge network over the recorded
    /// network mode when the two disagree
    #[serde(default = "default_true")]
    pub prefer_attached_network: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout(),
            status_cache_ttl: default_cache_ttl(),
            rename_max_attempts: default_rename_attempts(),
            prefer_attached_network: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_stacks_root() -> PathBuf {
    PathBuf::from("/opt/stacks")
}

fn default_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_auto_update_label() -> String {
    labels::DEFAULT_AUTO_UPDATE.to_string()
}

fn default_stop_timeout() -> i64 {
    10
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(5)
}

fn default_rename_attempts() -> u32 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9464
}

impl Default for BerthConfig {
    fn default() -> Self {
        Self {
            stacks_root: default_stacks_root(),
            docker_socket_path: None,
            auto_update: AutoUpdateConfig::default(),
            runtime: RuntimeSettings::default(),
            logging: LoggingConfig::default(),
            metrics: None,
        }
    }
}

impl BerthConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. BERTH_CONFIG_PATH environment variable
    /// 2. ./berth.yaml (working directory)
    /// 3. ~/.berth/config.yaml (user home)
    /// 4. /etc/berth/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BERTH_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./berth.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".berth").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/berth/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BERTH_STACKS_DIR") {
            tracing::info!("Environment override: BERTH_STACKS_DIR={}", val);
            self.stacks_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("BERTH_DOCKER_SOCKET") {
            tracing::info!("Environment override: BERTH_DOCKER_SOCKET={}", val);
            self.docker_socket_path = Some(val);
        }

        if let Ok(val) = std::env::var("BERTH_AUTO_UPDATE") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: BERTH_AUTO_UPDATE=true");
                    self.auto_update.enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: BERTH_AUTO_UPDATE=false");
                    self.auto_update.enabled = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for BERTH_AUTO_UPDATE: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("BERTH_AUTO_UPDATE_INTERVAL") {
            match humantime::parse_duration(&val) {
                Ok(interval) => {
                    tracing::info!("Environment override: BERTH_AUTO_UPDATE_INTERVAL={}", val);
                    self.auto_update.interval = interval;
                }
                Err(e) => {
                    tracing::warn!(
                        "Invalid value for BERTH_AUTO_UPDATE_INTERVAL: '{}' ({}). Ignoring.",
                        val, e
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stacks_root.as_os_str().is_empty() {
            anyhow::bail!("stacks_root cannot be empty");
        }

        if self.auto_update.interval.is_zero() {
            anyhow::bail!("auto_update.interval must be greater than zero");
        }

        if self.auto_update.label.trim().is_empty() {
            anyhow::bail!("auto_update.label cannot be empty");
        }

        if self.runtime.rename_max_attempts == 0 {
            anyhow::bail!("runtime.rename_max_attempts must be at least 1");
        }

        if self.runtime.stop_timeout_secs < 0 {
            anyhow::bail!("runtime.stop_timeout_secs cannot be negative");
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("logging.format must be 'json' or 'text', got '{}'", other),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BerthConfig::default();
        assert!(!config.auto_update.enabled);
        assert_eq!(config.auto_update.interval, Duration::from_secs(900));
        assert_eq!(config.auto_update.label, labels::DEFAULT_AUTO_UPDATE);
        assert_eq!(config.runtime.rename_max_attempts, 100);
        assert!(config.runtime.prefer_attached_network);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_durations() {
        let yaml = r#"
stacks_root: /srv/stacks
auto_update:
  enabled: true
  interval: 30m
runtime:
  status_cache_ttl: 2s
  prefer_attached_network: false
logging:
  format: json
"#;
        let config = BerthConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.stacks_root, PathBuf::from("/srv/stacks"));
        assert!(config.auto_update.enabled);
        assert_eq!(config.auto_update.interval, Duration::from_secs(1800));
        assert_eq!(config.runtime.status_cache_ttl, Duration::from_secs(2));
        assert!(!config.runtime.prefer_attached_network);
        assert_eq!(config.runtime.stop_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = BerthConfig::default();

        config.auto_update.interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.auto_update.interval = Duration::from_secs(60);

        config.auto_update.label = " ".to_string();
        assert!(config.validate().is_err());
        config.auto_update.label = "x".to_string();

        config.runtime.rename_max_attempts = 0;
        assert!(config.validate().is_err());
        config.runtime.rename_max_attempts = 5;

        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }
}
