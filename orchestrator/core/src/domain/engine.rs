// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Container Engine Port
//!
//! The narrow slice of the container engine API the stack engine consumes.
//! `infrastructure::docker::DockerEngine` implements it over bollard;
//! `infrastructure::mock_engine::MockContainerEngine` implements it in memory.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Engine-agnostic container, network and image types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Engine error, classified the way callers need to branch on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Name already in use.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Nothing to do (container already stopped / already started).
    #[error("Not modified: {0}")]
    NotModified(String),

    #[error("Engine request failed: {0}")]
    Request(String),

    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Restarting)
    }
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    /// Without the engine's leading `/`.
    pub name: String,
    /// Image reference the container was created from.
    pub image: String,
    pub image_id: String,
    pub state: ContainerState,
    pub status_text: String,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSummary {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Listing filter. Label entries are `key` or `key=value`; `name` is a
/// substring match on the engine side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub all: bool,
    pub labels: Vec<String>,
    pub name: Option<String>,
    pub id: Option<String>,
}

impl ContainerFilter {
    pub fn by_label(key: &str, value: &str) -> Self {
        Self {
            all: true,
            labels: vec![format!("{}={}", key, value)],
            ..Default::default()
        }
    }

    pub fn with_label_key(key: &str) -> Self {
        Self {
            all: true,
            labels: vec![key.to_string()],
            ..Default::default()
        }
    }

    pub fn by_name(name: &str) -> Self {
        Self {
            all: true,
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn by_id(id: &str) -> Self {
        Self {
            all: true,
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn running_only(mut self) -> Self {
        self.all = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    /// `None` lets the engine pick an ephemeral port.
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    OnFailure { max_retries: Option<i64> },
    UnlessStopped,
}

impl RestartPolicy {
    /// Compose `restart:` value; `None` for values the engine does not know.
    pub fn from_compose(value: &str) -> Option<Self> {
        let value = value.trim();
        match value {
            "" | "no" => Some(RestartPolicy::No),
            "always" => Some(RestartPolicy::Always),
            "unless-stopped" => Some(RestartPolicy::UnlessStopped),
            v if v.starts_with("on-failure") => {
                let max_retries = v
                    .strip_prefix("on-failure:")
                    .and_then(|n| n.parse::<i64>().ok());
                Some(RestartPolicy::OnFailure { max_retries })
            }
            _ => None,
        }
    }

    pub fn as_engine_name(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure { .. } => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: Option<i64>,
    /// 1 CPU = 1e9 nano CPUs.
    pub nano_cpus: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthcheckSpec {
    /// Always list form: `["CMD", ...]`, `["CMD-SHELL", "..."]` or `["NONE"]`.
    pub test: Vec<String>,
    pub interval_ns: Option<i64>,
    pub timeout_ns: Option<i64>,
    pub retries: Option<i64>,
    pub start_period_ns: Option<i64>,
}

/// Per-network endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub aliases: Vec<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Keys like `80/tcp`.
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    /// `source:target[:ro]`.
    pub binds: Vec<String>,
    /// Anonymous volume targets.
    pub volumes: Vec<String>,
    pub restart_policy: RestartPolicy,
    pub resources: ResourceLimits,
    /// Primary network (or `host`, `none`, `container:<id>`).
    pub network_mode: Option<String>,
    /// Endpoint for the primary network only; others are connected after create.
    pub endpoints: BTreeMap<String, EndpointSpec>,
    pub healthcheck: Option<HealthcheckSpec>,
    pub hostname: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub tty: bool,
    pub stdin_open: bool,
}

/// Inspect result, with the creation spec reconstructed from the engine's view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
    pub spec: ContainerSpec,
    /// Attached networks with their endpoint settings.
    pub networks: BTreeMap<String, EndpointSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub tail: Option<usize>,
    pub timestamps: bool,
    /// Unix seconds.
    pub since: Option<i64>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            tail: Some(100),
            timestamps: false,
            since: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
}

impl ContainerStats {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_limit_bytes == 0 {
            0.0
        } else {
            self.memory_usage_bytes as f64 / self.memory_limit_bytes as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IpamPool {
    pub subnet: Option<String>,
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    pub driver: Option<String>,
    pub options: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub internal: bool,
    pub attachable: bool,
    pub enable_ipv6: bool,
    pub ipam: Vec<IpamPool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkFilter {
    pub labels: Vec<String>,
    pub name: Option<String>,
}

impl NetworkFilter {
    pub fn by_label(key: &str, value: &str) -> Self {
        Self {
            labels: vec![format!("{}={}", key, value)],
            name: None,
        }
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>, EngineError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError>;
    /// Returns the new container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), EngineError>;
    async fn restart_container(&self, id: &str, timeout_secs: i64) -> Result<(), EngineError>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;
    async fn connect_network(&self, network: &str, container_id: &str, endpoint: &EndpointSpec) -> Result<(), EngineError>;
    async fn container_logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogLine>, EngineError>;
    async fn container_stats(&self, id: &str) -> Result<ContainerStats, EngineError>;

    async fn list_networks(&self, filter: &NetworkFilter) -> Result<Vec<NetworkSummary>, EngineError>;
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError>;
    async fn remove_network(&self, name_or_id: &str) -> Result<(), EngineError>;

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;
    /// Local image id for a reference, `None` when not present locally.
    async fn image_id(&self, reference: &str) -> Result<Option<String>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_from_compose() {
        assert_eq!(RestartPolicy::from_compose("always"), Some(RestartPolicy::Always));
        assert_eq!(RestartPolicy::from_compose("no"), Some(RestartPolicy::No));
        assert_eq!(
            RestartPolicy::from_compose("on-failure:3"),
            Some(RestartPolicy::OnFailure { max_retries: Some(3) })
        );
        assert_eq!(
            RestartPolicy::from_compose("on-failure"),
            Some(RestartPolicy::OnFailure { max_retries: None })
        );
        assert_eq!(RestartPolicy::from_compose("sometimes"), None);
    }

    #[test]
    fn test_container_state_parse() {
        assert!(ContainerState::parse("running").is_running());
        assert!(!ContainerState::parse("exited").is_running());
        assert_eq!(ContainerState::parse("weird"), ContainerState::Unknown);
    }

    #[test]
    fn test_memory_percent() {
        let stats = ContainerStats {
            cpu_percent: 1.0,
            memory_usage_bytes: 50,
            memory_limit_bytes: 200,
        };
        assert_eq!(stats.memory_percent(), 25.0);
        assert_eq!(ContainerStats::default().memory_percent(), 0.0);
    }
}
