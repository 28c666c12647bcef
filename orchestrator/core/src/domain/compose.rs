// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Parsed compose document.
//!
//! Output of `infrastructure::compose_parser`: interpolated, normalized and
//! in document order. Derived fresh on every reconciliation, never persisted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::engine::{HealthcheckSpec, IpamPool, ResourceLimits, RestartPolicy};

/// Compose-compatible labels stamped on everything the engine creates.
pub mod labels {
    pub const PROJECT: &str = "com.docker.compose.project";
    pub const SERVICE: &str = "com.docker.compose.service";
    pub const CONTAINER_NUMBER: &str = "com.docker.compose.container-number";
    pub const CONFIG_FILES: &str = "com.docker.compose.project.config_files";
    pub const WORKING_DIR: &str = "com.docker.compose.project.working_dir";
    pub const NETWORK: &str = "com.docker.compose.network";
    pub const MANAGED_BY: &str = "io.berth.managed";
    pub const DEFAULT_AUTO_UPDATE: &str = "io.berth.auto-update";
}

/// Network key every service without explicit networks joins.
pub const DEFAULT_NETWORK: &str = "default";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParsedDocument {
    /// Document order.
    pub services: Vec<ServiceDefinition>,
    /// Document order.
    pub networks: Vec<NetworkDefinition>,
    /// Top-level named volumes: key → external.
    pub volumes: BTreeMap<String, bool>,
    /// Variable names that stayed unresolved anywhere in the document.
    pub unresolved: Vec<String>,
}

impl ParsedDocument {
    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn network(&self, key: &str) -> Option<&NetworkDefinition> {
        self.networks.iter().find(|n| n.key == key)
    }

    pub fn has_external_network(&self) -> bool {
        self.networks.iter().any(|n| n.external)
    }

    /// True when the implicit `{stack}_default` network must exist.
    pub fn needs_default_network(&self) -> bool {
        self.networks.is_empty()
            || self
                .services
                .iter()
                .any(|s| s.network_mode.is_none() && s.networks.is_empty())
            || self
                .services
                .iter()
                .any(|s| s.networks.iter().any(|n| n.name == DEFAULT_NETWORK))
    }

    /// Sum of replicas across services: the container count a fully running
    /// stack has.
    pub fn expected_container_count(&self) -> usize {
        self.services.iter().map(|s| s.replicas as usize).sum()
    }

    /// Unique image references, first occurrence order.
    pub fn image_references(&self) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        for image in self.services.iter().filter_map(|s| s.image.as_ref()) {
            if !refs.contains(image) {
                refs.push(image.clone());
            }
        }
        refs
    }

    /// True when any service carries `label` with a truthy value.
    pub fn any_service_labeled(&self, label: &str) -> bool {
        self.services
            .iter()
            .any(|s| s.labels.get(label).map(|v| is_truthy(v)).unwrap_or(false))
    }
}

/// `true`, `1`, `yes`, `on` (case-insensitive).
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub image: Option<String>,
    /// Already overridden with the derived name when it contained an
    /// unresolved variable.
    pub container_name: Option<String>,
    pub command: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    /// Flattened `KEY=VALUE`.
    pub environment: Vec<String>,
    /// Short syntax, long form already rendered to it.
    pub ports: Vec<String>,
    /// Short syntax `source:target[:mode]` or a bare anonymous target.
    pub volumes: Vec<String>,
    /// First entry is the primary network.
    pub networks: Vec<ServiceNetwork>,
    pub network_mode: Option<String>,
    pub restart_policy: RestartPolicy,
    pub healthcheck: Option<HealthcheckSpec>,
    pub labels: BTreeMap<String, String>,
    pub replicas: u32,
    pub resources: ResourceLimits,
    pub hostname: Option<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub privileged: bool,
    pub cap_add: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub tty: bool,
    pub stdin_open: bool,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceNetwork {
    /// Key under the document's `networks:` section.
    pub name: String,
    pub aliases: Vec<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkDefinition {
    pub key: String,
    pub external: bool,
    /// Explicit `name:` (or legacy `external.name`), as written after interpolation.
    pub name: Option<String>,
    pub driver: Option<String>,
    pub driver_opts: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub internal: bool,
    pub attachable: bool,
    pub enable_ipv6: bool,
    pub ipam: Vec<IpamPool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, image: &str) -> ServiceDefinition {
        ServiceDefinition {
            name: name.to_string(),
            image: Some(image.to_string()),
            replicas: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_image_references_are_unique_in_order() {
        let doc = ParsedDocument {
            services: vec![
                service("a", "redis:7"),
                service("b", "nginx:1.25"),
                service("c", "redis:7"),
            ],
            ..Default::default()
        };
        assert_eq!(doc.image_references(), vec!["redis:7", "nginx:1.25"]);
        assert_eq!(doc.expected_container_count(), 3);
    }

    #[test]
    fn test_needs_default_network() {
        let mut doc = ParsedDocument {
            services: vec![service("a", "redis:7")],
            ..Default::default()
        };
        assert!(doc.needs_default_network());

        doc.networks.push(NetworkDefinition {
            key: "back".to_string(),
            ..Default::default()
        });
        assert!(doc.needs_default_network());

        doc.services[0].networks.push(ServiceNetwork {
            name: "back".to_string(),
            ..Default::default()
        });
        assert!(!doc.needs_default_network());
    }

    #[test]
    fn test_any_service_labeled() {
        let mut doc = ParsedDocument {
            services: vec![service("a", "redis:7")],
            ..Default::default()
        };
        assert!(!doc.any_service_labeled(labels::DEFAULT_AUTO_UPDATE));
        doc.services[0]
            .labels
            .insert(labels::DEFAULT_AUTO_UPDATE.to_string(), "True".to_string());
        assert!(doc.any_service_labeled(labels::DEFAULT_AUTO_UPDATE));
    }
}
