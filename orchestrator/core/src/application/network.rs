// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Network Provisioner
//!
//! Makes every network a stack's document needs exist before containers are
//! created. Engine-managed networks are named `{stackId}_{key}` and labeled
//! with the project; external networks are only resolved by name.
//!
//! Creation is idempotent: a "name already in use" answer from the engine is
//! success, which is what lets `deploy` run again over a live stack.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::compose::{labels, NetworkDefinition, ParsedDocument, DEFAULT_NETWORK};
use crate::domain::engine::{ContainerEngine, NetworkFilter, NetworkSpec};
use crate::domain::stack::{StackError, StackId};

/// Networks the engine ships with; never removed, even when labeled.
pub const PROTECTED_NETWORKS: [&str; 5] = ["bridge", "host", "none", "ingress", "docker_gwbridge"];

pub struct NetworkProvisioner {
    engine: Arc<dyn ContainerEngine>,
}

impl NetworkProvisioner {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Engine-side name for a declared network.
    ///
    /// External: explicit `name` unless it still holds an unresolved
    /// variable, in which case the document key. Managed: `{stackId}_{key}`,
    /// or the explicit `name` when one is given.
    pub fn resolve_name(stack_id: &StackId, network: &NetworkDefinition) -> String {
        let explicit = network.name.as_deref().filter(|n| !n.trim().is_empty());
        match explicit {
            Some(name) if name.contains("${") => {
                warn!(
                    "Stack {}: network '{}' name '{}' has an unresolved variable; using '{}'",
                    stack_id, network.key, name, network.key
                );
                if network.external {
                    network.key.clone()
                } else {
                    stack_id.network_name(&network.key)
                }
            }
            Some(name) => name.to_string(),
            None if network.external => network.key.clone(),
            None => stack_id.network_name(&network.key),
        }
    }

    /// Engine-side name for a network key as a service references it.
    pub fn engine_network_name(stack_id: &StackId, document: &ParsedDocument, key: &str) -> String {
        match document.network(key) {
            Some(definition) => Self::resolve_name(stack_id, definition),
            None => stack_id.network_name(key),
        }
    }

    fn project_labels(stack_id: &StackId, key: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (labels::PROJECT.to_string(), stack_id.to_string()),
            (labels::NETWORK.to_string(), key.to_string()),
            (labels::MANAGED_BY.to_string(), "true".to_string()),
        ])
    }

    /// Create or resolve every network the document uses. Returns the
    /// engine-side names, default network first when one is needed.
    pub async fn ensure_networks(&self, stack_id: &StackId, document: &ParsedDocument) -> Result<Vec<String>, StackError> {
        let mut ensured = Vec::new();

        let default_declared = document.network(DEFAULT_NETWORK).is_some();
        if document.needs_default_network() && !default_declared {
            let spec = NetworkSpec {
                name: stack_id.network_name(DEFAULT_NETWORK),
                driver: Some("bridge".to_string()),
                labels: Self::project_labels(stack_id, DEFAULT_NETWORK),
                ..Default::default()
            };
            self.create_idempotent(stack_id, &spec).await?;
            ensured.push(spec.name);
        }

        for network in &document.networks {
            let name = Self::resolve_name(stack_id, network);
            if network.external {
                debug!("Stack {}: using external network '{}'", stack_id, name);
                ensured.push(name);
                continue;
            }

            let mut network_labels = network.labels.clone();
            network_labels.extend(Self::project_labels(stack_id, &network.key));
            let spec = NetworkSpec {
                name,
                driver: network.driver.clone().or_else(|| Some("bridge".to_string())),
                options: network.driver_opts.clone(),
                labels: network_labels,
                internal: network.internal,
                attachable: network.attachable,
                enable_ipv6: network.enable_ipv6,
                ipam: network.ipam.clone(),
            };
            self.create_idempotent(stack_id, &spec).await?;
            ensured.push(spec.name);
        }

        Ok(ensured)
    }

    async fn create_idempotent(&self, stack_id: &StackId, spec: &NetworkSpec) -> Result<(), StackError> {
        match self.engine.create_network(spec).await {
            Ok(_) => {
                info!("Stack {}: created network {}", stack_id, spec.name);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                debug!("Stack {}: network {} already exists", stack_id, spec.name);
                Ok(())
            }
            Err(e) => Err(StackError::provisioning(
                stack_id,
                format!("network {}: {}", spec.name, e),
            )),
        }
    }

    /// Remove every network labeled with the stack's project. Best-effort;
    /// returns how many were removed.
    pub async fn remove_stack_networks(&self, stack_id: &StackId) -> usize {
        let networks = match self
            .engine
            .list_networks(&NetworkFilter::by_label(labels::PROJECT, stack_id.as_str()))
            .await
        {
            Ok(networks) => networks,
            Err(e) => {
                warn!("Stack {}: failed to list networks for removal: {}", stack_id, e);
                return 0;
            }
        };

        let mut removed = 0;
        for network in networks {
            if PROTECTED_NETWORKS.contains(&network.name.as_str()) {
                warn!("Stack {}: refusing to remove built-in network {}", stack_id, network.name);
                continue;
            }
            match self.engine.remove_network(&network.name).await {
                Ok(()) => {
                    debug!("Stack {}: removed network {}", stack_id, network.name);
                    removed += 1;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Stack {}: failed to remove network {}: {}", stack_id, network.name, e),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::compose_parser::{ComposeParser, EnvironmentOverlay};
    use crate::infrastructure::mock_engine::MockContainerEngine;

    fn parse(doc: &str) -> ParsedDocument {
        ComposeParser::parse(&StackId::new("media").unwrap(), doc, &EnvironmentOverlay::default().isolated()).unwrap()
    }

    #[tokio::test]
    async fn test_ensure_networks_is_idempotent() {
        let engine = Arc::new(MockContainerEngine::new());
        let provisioner = NetworkProvisioner::new(engine.clone());
        let id = StackId::new("media").unwrap();
        let doc = parse(
            r#"
services:
  web: {image: nginx, networks: [front, back]}
networks:
  front: {}
  back: {driver: bridge, internal: true}
"#,
        );

        let first = provisioner.ensure_networks(&id, &doc).await.unwrap();
        let second = provisioner.ensure_networks(&id, &doc).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec!["media_front", "media_back"]);

        let mut names = engine.network_names();
        names.sort();
        assert_eq!(names, vec!["media_back", "media_front"]);
        let back = engine.network_spec("media_back").unwrap();
        assert!(back.internal);
        assert_eq!(back.labels.get(labels::PROJECT).map(String::as_str), Some("media"));
    }

    #[tokio::test]
    async fn test_external_networks_are_never_created() {
        let engine = Arc::new(MockContainerEngine::new());
        let provisioner = NetworkProvisioner::new(engine.clone());
        let id = StackId::new("media").unwrap();
        let doc = parse(
            r#"
services:
  web: {image: nginx, networks: [proxy]}
networks:
  proxy:
    external: true
    name: "${PROXY_NET}"
"#,
        );

        let ensured = provisioner.ensure_networks(&id, &doc).await.unwrap();
        assert_eq!(ensured, vec!["proxy"]);
        assert!(engine.network_names().is_empty());
        assert_eq!(engine.count_calls("create_network"), 0);
    }

    #[tokio::test]
    async fn test_default_network_when_a_service_has_none() {
        let engine = Arc::new(MockContainerEngine::new());
        let provisioner = NetworkProvisioner::new(engine.clone());
        let id = StackId::new("media").unwrap();
        let doc = parse(
            r#"
services:
  web: {image: nginx, networks: [proxy]}
  db: {image: postgres}
networks:
  proxy: {external: true}
"#,
        );

        let ensured = provisioner.ensure_networks(&id, &doc).await.unwrap();
        assert_eq!(ensured, vec!["media_default", "proxy"]);
        assert_eq!(engine.network_names(), vec!["media_default"]);
    }

    #[tokio::test]
    async fn test_create_failure_is_provisioning_error() {
        let engine = Arc::new(MockContainerEngine::new());
        engine.fail_network_create_for("media_default");
        let provisioner = NetworkProvisioner::new(engine);
        let id = StackId::new("media").unwrap();
        let doc = parse("services: {web: {image: nginx}}");
        assert!(matches!(
            provisioner.ensure_networks(&id, &doc).await,
            Err(StackError::Provisioning { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_skips_builtin_networks() {
        let engine = Arc::new(MockContainerEngine::new());
        let id = StackId::new("media").unwrap();
        for name in ["media_default", "ingress"] {
            engine.seed_network(NetworkSpec {
                name: name.to_string(),
                labels: BTreeMap::from([(labels::PROJECT.to_string(), "media".to_string())]),
                ..Default::default()
            });
        }
        let provisioner = NetworkProvisioner::new(engine.clone());
        assert_eq!(provisioner.remove_stack_networks(&id).await, 1);
        assert_eq!(engine.network_names(), vec!["ingress"]);
    }
}
