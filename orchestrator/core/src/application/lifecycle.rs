// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Container Lifecycle Manager
//!
//! Translates parsed services into engine creation specs and drives single
//! containers through create, start, stop, remove and recreate. Also owns the
//! one resolver that finds a stack's containers (project label, then name
//! prefix) and the best-effort cleanup built on it.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Service → container translation and per-container operations
//! - **Collaborators:** [`ContainerEngine`], [`NetworkProvisioner`] naming,
//!   [`EventBus`]

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::application::network::NetworkProvisioner;
use crate::domain::compose::{labels, ParsedDocument, ServiceDefinition, DEFAULT_NETWORK};
use crate::domain::engine::{
    ContainerEngine, ContainerFilter, ContainerSpec, ContainerStats, ContainerSummary,
    EndpointSpec, EngineError, LogLine, LogOptions, PortBinding,
};
use crate::domain::events::StackEvent;
use crate::domain::stack::{StackError, StackId};
use crate::infrastructure::compose_parser::EnvironmentOverlay;
use crate::infrastructure::event_bus::EventBus;

/// Everything about a stack a service needs to become a container.
pub struct StackContext<'a> {
    pub stack_id: &'a StackId,
    /// Base for relative bind sources.
    pub stack_dir: &'a Path,
    pub compose_path: &'a Path,
    pub document: &'a ParsedDocument,
    pub overlay: &'a EnvironmentOverlay,
}

/// A creation spec plus the networks to connect after create.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedContainer {
    pub spec: ContainerSpec,
    pub extra_networks: Vec<(String, EndpointSpec)>,
}

/// Compose port entries to the engine's binding map keyed by `port/proto`.
///
/// Accepts `80`, `8080:80`, `127.0.0.1:8080:80`, `[::1]:8080:80`, `:80`
/// style empty host ports, `/udp` suffixes and equal-length ranges
/// (`8000-8001:80-81`).
pub fn prepare_ports(ports: &[String]) -> Result<BTreeMap<String, Vec<PortBinding>>, StackError> {
    let mut bindings: BTreeMap<String, Vec<PortBinding>> = BTreeMap::new();
    for entry in ports {
        for (key, binding) in parse_port(entry)? {
            bindings.entry(key).or_default().push(binding);
        }
    }
    Ok(bindings)
}

fn parse_port(entry: &str) -> Result<Vec<(String, PortBinding)>, StackError> {
    let invalid = || StackError::Parse(format!("invalid port specification '{}'", entry));

    let entry = entry.trim();
    let (mapping, protocol) = match entry.rsplit_once('/') {
        Some((mapping, protocol)) => (mapping, protocol),
        None => (entry, "tcp"),
    };

    let (host_ip, host, container) = match mapping.strip_prefix('[') {
        Some(bracketed) => {
            let (ip, rest) = bracketed.split_once("]:").ok_or_else(invalid)?;
            let (host, container) = rest.split_once(':').ok_or_else(invalid)?;
            (Some(ip), Some(host), container)
        }
        None => {
            let parts: Vec<&str> = mapping.split(':').collect();
            match parts.as_slice() {
                [container] => (None, None, *container),
                [host, container] => (None, Some(*host), *container),
                [ip, host, container] => (Some(*ip), Some(*host), *container),
                _ => return Err(invalid()),
            }
        }
    };

    let containers = expand_range(container).ok_or_else(invalid)?;
    let hosts = match host.filter(|h| !h.is_empty()) {
        Some(h) => Some(expand_range(h).ok_or_else(invalid)?),
        None => None,
    };
    if let Some(hosts) = &hosts {
        if hosts.len() != containers.len() {
            return Err(invalid());
        }
    }

    Ok(containers
        .iter()
        .enumerate()
        .map(|(i, port)| {
            (
                format!("{}/{}", port, protocol),
                PortBinding {
                    host_ip: host_ip.filter(|ip| !ip.is_empty()).map(str::to_string),
                    host_port: hosts.as_ref().map(|h| h[i].to_string()),
                },
            )
        })
        .collect())
}

fn expand_range(value: &str) -> Option<Vec<u16>> {
    match value.split_once('-') {
        Some((start, end)) => {
            let start: u16 = start.trim().parse().ok()?;
            let end: u16 = end.trim().parse().ok()?;
            (start <= end).then(|| (start..=end).collect())
        }
        None => Some(vec![value.trim().parse().ok()?]),
    }
}

/// One `volumes:` entry after source resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeMount {
    /// `source:target[:mode]` for the engine's bind list.
    Bind(String),
    /// Anonymous volume at this container path.
    Anonymous(String),
}

/// Resolve a short-syntax volume entry.
///
/// Relative and `~` sources become absolute host paths, anchored at the stack
/// directory; named volumes are prefixed `{stackId}_` unless declared
/// external.
pub fn prepare_volume(
    stack_id: &StackId,
    stack_dir: &Path,
    entry: &str,
    declared_volumes: &BTreeMap<String, bool>,
) -> VolumeMount {
    let mut parts = entry.splitn(3, ':');
    let first = parts.next().unwrap_or_default();
    let Some(target) = parts.next() else {
        return VolumeMount::Anonymous(first.to_string());
    };
    let mode = parts.next();

    let source = if first.starts_with('/') {
        first.to_string()
    } else if first == "~" || first.starts_with("~/") {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        home.join(first.trim_start_matches('~').trim_start_matches('/'))
            .display()
            .to_string()
    } else if first.starts_with('.') {
        normalize_path(&stack_dir.join(first)).display().to_string()
    } else if declared_volumes.get(first).copied().unwrap_or(false) {
        first.to_string()
    } else {
        format!("{}_{}", stack_id, first)
    };

    match mode {
        Some(mode) => VolumeMount::Bind(format!("{}:{}:{}", source, target, mode)),
        None => VolumeMount::Bind(format!("{}:{}", source, target)),
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Service environment merged with the overlay. Service values win; overlay
/// keys the service does not set are appended.
pub fn merge_environment(service_env: &[String], overlay: &EnvironmentOverlay) -> Vec<String> {
    let mut merged: Vec<String> = service_env.to_vec();
    let present: HashSet<String> = service_env
        .iter()
        .map(|e| e.split_once('=').map(|(k, _)| k).unwrap_or(e).to_string())
        .collect();
    for (key, value) in overlay.values() {
        if !present.contains(key) {
            merged.push(format!("{}={}", key, value));
        }
    }
    merged
}

pub struct ContainerLifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    events: EventBus,
    stop_timeout_secs: i64,
    prefer_attached_network: bool,
}

impl ContainerLifecycleManager {
    pub fn new(engine: Arc<dyn ContainerEngine>, events: EventBus, stop_timeout_secs: i64, prefer_attached_network: bool) -> Self {
        Self {
            engine,
            events,
            stop_timeout_secs,
            prefer_attached_network,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Creation spec for one replica of a service.
    pub fn build_spec(&self, ctx: &StackContext<'_>, service: &ServiceDefinition, replica: u32) -> Result<PlannedContainer, StackError> {
        let stack_id = ctx.stack_id;
        let image = service
            .image
            .clone()
            .ok_or_else(|| StackError::Parse(format!("service '{}' has no image", service.name)))?;

        let name = match (&service.container_name, service.replicas > 1) {
            (Some(explicit), false) => explicit.clone(),
            (explicit, true) => {
                if explicit.is_some() && replica == 1 {
                    warn!(
                        "Service '{}' sets container_name with {} replicas; using derived names",
                        service.name, service.replicas
                    );
                }
                stack_id.container_name(&service.name, Some(replica))
            }
            (None, false) => stack_id.container_name(&service.name, None),
        };

        let mut container_labels = service.labels.clone();
        container_labels.insert(labels::PROJECT.to_string(), stack_id.to_string());
        container_labels.insert(labels::SERVICE.to_string(), service.name.clone());
        container_labels.insert(labels::CONTAINER_NUMBER.to_string(), replica.to_string());
        container_labels.insert(labels::CONFIG_FILES.to_string(), ctx.compose_path.display().to_string());
        container_labels.insert(labels::WORKING_DIR.to_string(), ctx.stack_dir.display().to_string());
        container_labels.insert(labels::MANAGED_BY.to_string(), "true".to_string());

        let mut binds = Vec::new();
        let mut volumes = Vec::new();
        for entry in &service.volumes {
            match prepare_volume(stack_id, ctx.stack_dir, entry, &ctx.document.volumes) {
                VolumeMount::Bind(bind) => binds.push(bind),
                VolumeMount::Anonymous(target) => volumes.push(target),
            }
        }

        let mut endpoints = BTreeMap::new();
        let mut extra_networks = Vec::new();
        let network_mode = match &service.network_mode {
            Some(mode) => Some(match mode.strip_prefix("service:") {
                Some(other) => format!("container:{}", stack_id.container_name(other, None)),
                None => mode.clone(),
            }),
            None => {
                let attachments: Vec<(String, EndpointSpec)> = if service.networks.is_empty() {
                    vec![(
                        NetworkProvisioner::engine_network_name(stack_id, ctx.document, DEFAULT_NETWORK),
                        EndpointSpec {
                            aliases: vec![service.name.clone()],
                            ..Default::default()
                        },
                    )]
                } else {
                    service
                        .networks
                        .iter()
                        .map(|n| {
                            let mut aliases = vec![service.name.clone()];
                            aliases.extend(n.aliases.iter().filter(|a| **a != service.name).cloned());
                            (
                                NetworkProvisioner::engine_network_name(stack_id, ctx.document, &n.name),
                                EndpointSpec {
                                    aliases,
                                    ipv4_address: n.ipv4_address.clone(),
                                    ipv6_address: n.ipv6_address.clone(),
                                },
                            )
                        })
                        .collect()
                };

                let mut attachments = attachments.into_iter();
                match attachments.next() {
                    Some((primary, endpoint)) => {
                        endpoints.insert(primary.clone(), endpoint);
                        extra_networks.extend(attachments);
                        Some(primary)
                    }
                    None => None,
                }
            }
        };

        let spec = ContainerSpec {
            name,
            image,
            command: service.command.clone(),
            entrypoint: service.entrypoint.clone(),
            env: merge_environment(&service.environment, ctx.overlay),
            labels: container_labels,
            port_bindings: prepare_ports(&service.ports)?,
            binds,
            volumes,
            restart_policy: service.restart_policy.clone(),
            resources: service.resources.clone(),
            network_mode,
            endpoints,
            healthcheck: service.healthcheck.clone(),
            hostname: service.hostname.clone(),
            working_dir: service.working_dir.clone(),
            user: service.user.clone(),
            privileged: service.privileged,
            cap_add: service.cap_add.clone(),
            extra_hosts: service.extra_hosts.clone(),
            tty: service.tty,
            stdin_open: service.stdin_open,
        };

        Ok(PlannedContainer { spec, extra_networks })
    }

    /// Create, wire and start every replica of a service. Any failure is a
    /// provisioning error; the caller cleans up.
    pub async fn create_service(&self, ctx: &StackContext<'_>, service: &ServiceDefinition) -> Result<Vec<String>, StackError> {
        let mut ids = Vec::new();
        for replica in 1..=service.replicas {
            let planned = self.build_spec(ctx, service, replica)?;
            let id = self.create(&planned).await.map_err(|e| {
                StackError::provisioning(ctx.stack_id, format!("service '{}': {}", service.name, e))
            })?;
            self.start(&id).await.map_err(|e| {
                StackError::provisioning(ctx.stack_id, format!("service '{}': start failed: {}", service.name, e))
            })?;
            info!("Stack {}: started {} ({})", ctx.stack_id, planned.spec.name, short_id(&id));
            ids.push(id);
        }
        Ok(ids)
    }

    /// Create a container and connect its secondary networks.
    pub async fn create(&self, planned: &PlannedContainer) -> Result<String, EngineError> {
        let id = self.engine.create_container(&planned.spec).await?;
        for (network, endpoint) in &planned.extra_networks {
            self.engine.connect_network(network, &id, endpoint).await?;
        }
        debug!("Created container {} ({})", planned.spec.name, short_id(&id));
        Ok(id)
    }

    /// Start; "already started" is success.
    pub async fn start(&self, id: &str) -> Result<(), EngineError> {
        match self.engine.start_container(id).await {
            Err(EngineError::NotModified(_)) => Ok(()),
            other => other,
        }
    }

    /// Stop; "already stopped" is success.
    pub async fn stop(&self, id: &str) -> Result<(), EngineError> {
        match self.engine.stop_container(id, self.stop_timeout_secs).await {
            Err(EngineError::NotModified(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn restart(&self, id: &str) -> Result<(), EngineError> {
        self.engine.restart_container(id, self.stop_timeout_secs).await
    }

    pub async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError> {
        self.engine.remove_container(id, force).await
    }

    pub async fn fetch_logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogLine>, StackError> {
        self.engine.container_logs(id, options).await.map_err(not_found_or_engine)
    }

    pub async fn fetch_stats(&self, id: &str) -> Result<ContainerStats, StackError> {
        self.engine.container_stats(id).await.map_err(not_found_or_engine)
    }

    /// Replace a container with an equivalent one on its current image
    /// reference. The caller pulls the new image first.
    ///
    /// Once the old container is removed, any failure is a
    /// [`StackError::PartialFailure`] naming the original.
    pub async fn recreate(&self, container_id: &str) -> Result<ContainerSummary, StackError> {
        let result = self.recreate_inner(container_id).await;
        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!("berth_container_recreates_total", "result" => outcome).increment(1);
        result
    }

    async fn recreate_inner(&self, container_id: &str) -> Result<ContainerSummary, StackError> {
        let details = self
            .engine
            .inspect_container(container_id)
            .await
            .map_err(not_found_or_engine)?;
        let original_id = details.id.clone();
        let original_name = details.name.clone();
        let short = short_id(&original_id).to_string();

        let mut spec = details.spec.clone();
        if spec.hostname.as_deref() == Some(short.as_str()) {
            spec.hostname = None;
        }

        let attached: Vec<&String> = details
            .networks
            .keys()
            .filter(|n| !matches!(n.as_str(), "bridge" | "host" | "none"))
            .collect();
        let recorded = spec.network_mode.clone();
        let recorded_is_special = recorded
            .as_deref()
            .map(|m| m == "host" || m == "none" || m.starts_with("container:"))
            .unwrap_or(false);
        let primary = match recorded {
            Some(ref mode) if recorded_is_special => Some(mode.clone()),
            Some(ref mode) if attached.iter().any(|n| *n == mode) => Some(mode.clone()),
            _ if self.prefer_attached_network && !attached.is_empty() => {
                let chosen = attached[0].clone();
                if recorded.as_deref().map(|r| r != "default" && r != "bridge").unwrap_or(false) {
                    warn!(
                        "Recreate {}: recorded network mode {:?} differs from attached network {}; using {}",
                        original_name, recorded, chosen, chosen
                    );
                }
                Some(chosen)
            }
            _ => recorded.clone(),
        };
        spec.network_mode = primary.clone();

        let strip = |endpoint: &EndpointSpec| EndpointSpec {
            aliases: endpoint
                .aliases
                .iter()
                .filter(|a| **a != short && **a != original_id)
                .cloned()
                .collect(),
            ..endpoint.clone()
        };
        spec.endpoints.clear();
        let mut extra_networks = Vec::new();
        for (network, endpoint) in &details.networks {
            if Some(network) == primary.as_ref() {
                spec.endpoints.insert(network.clone(), strip(endpoint));
            } else if !recorded_is_special && network != "bridge" {
                extra_networks.push((network.clone(), strip(endpoint)));
            }
        }

        info!("Recreating container {} ({}) from {}", original_name, short, spec.image);

        if let Err(e) = self.engine.stop_container(&original_id, self.stop_timeout_secs).await {
            match e {
                EngineError::NotModified(_) | EngineError::NotFound(_) => {
                    debug!("Recreate {}: stop skipped: {}", original_name, e)
                }
                other => return Err(other.into()),
            }
        }
        match self.engine.remove_container(&original_id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        // The original is gone from here on
        let partial = |reason: String| {
            error!(
                "Recreate of {} ({}) left no running replacement: {}",
                original_name, original_id, reason
            );
            StackError::PartialFailure {
                original_id: original_id.clone(),
                original_name: original_name.clone(),
                reason,
            }
        };

        let new_id = self
            .engine
            .create_container(&spec)
            .await
            .map_err(|e| partial(format!("create failed: {}", e)))?;

        for (network, endpoint) in &extra_networks {
            if let Err(e) = self.engine.connect_network(network, &new_id, endpoint).await {
                warn!("Recreate {}: could not reconnect network {}: {}", original_name, network, e);
            }
        }

        self.start(&new_id)
            .await
            .map_err(|e| partial(format!("start failed: {}", e)))?;

        let summary = self
            .engine
            .list_containers(&ContainerFilter::by_id(&new_id))
            .await
            .map_err(|e| partial(format!("listing replacement failed: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| partial("replacement disappeared after start".to_string()))?;

        self.events.publish_stack_event(StackEvent::ContainerRecreated {
            container_name: original_name.clone(),
            old_container_id: original_id.clone(),
            new_container_id: new_id.clone(),
            recreated_at: Utc::now(),
        });
        info!("Recreated {}: {} -> {}", original_name, short, short_id(&new_id));
        Ok(summary)
    }

    /// Every container belonging to a stack: project label first, then the
    /// `{stackId}_` name prefix for containers created without labels.
    /// De-duplicated by engine id, sorted by name.
    pub async fn resolve_stack_containers(&self, stack_id: &StackId) -> Result<Vec<ContainerSummary>, StackError> {
        let by_label = self
            .engine
            .list_containers(&ContainerFilter::by_label(labels::PROJECT, stack_id.as_str()))
            .await?;

        let prefix = stack_id.container_prefix();
        let by_prefix = self
            .engine
            .list_containers(&ContainerFilter::by_name(&prefix))
            .await?
            .into_iter()
            .filter(|c| c.name.starts_with(&prefix))
            .filter(|c| {
                c.label(labels::PROJECT)
                    .map(|p| p == stack_id.as_str())
                    .unwrap_or(true)
            });

        let mut seen = HashSet::new();
        let mut containers: Vec<ContainerSummary> = by_label
            .into_iter()
            .chain(by_prefix)
            .filter(|c| seen.insert(c.id.clone()))
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    /// Stop then force-remove every container of the stack. A failure on one
    /// container is logged and the rest are still processed. Returns how
    /// many were removed.
    pub async fn cleanup_stack(&self, stack_id: &StackId) -> usize {
        let containers = match self.resolve_stack_containers(stack_id).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Stack {}: cleanup could not list containers: {}", stack_id, e);
                return 0;
            }
        };

        let mut removed = 0;
        for container in containers {
            if container.state.is_running() {
                if let Err(e) = self.stop(&container.id).await {
                    warn!("Stack {}: failed to stop {}: {}", stack_id, container.name, e);
                }
            }
            match self.remove(&container.id, true).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("Stack {}: failed to remove {}: {}", stack_id, container.name, e),
            }
        }
        if removed > 0 {
            debug!("Stack {}: removed {} containers", stack_id, removed);
        }
        removed
    }
}

fn not_found_or_engine(e: EngineError) -> StackError {
    match e {
        EngineError::NotFound(what) => StackError::NotFound(what),
        other => StackError::Engine(other),
    }
}

pub(crate) fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::engine::RestartPolicy;
    use crate::infrastructure::compose_parser::ComposeParser;
    use crate::infrastructure::mock_engine::MockContainerEngine;

    fn binding(port: Option<&str>) -> PortBinding {
        PortBinding {
            host_ip: None,
            host_port: port.map(str::to_string),
        }
    }

    #[test]
    fn test_prepare_ports() {
        let ports = prepare_ports(&[
            "8080:80".to_string(),
            "53:53/udp".to_string(),
            "9000".to_string(),
            "127.0.0.1:8443:443".to_string(),
            "7000-7001:7000-7001".to_string(),
        ])
        .unwrap();
        assert_eq!(ports["80/tcp"], vec![binding(Some("8080"))]);
        assert_eq!(ports["53/udp"], vec![binding(Some("53"))]);
        assert_eq!(ports["9000/tcp"], vec![binding(None)]);
        assert_eq!(ports["443/tcp"][0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(ports["7001/tcp"], vec![binding(Some("7001"))]);

        assert!(prepare_ports(&["http".to_string()]).is_err());
        assert!(prepare_ports(&["8000-8002:80-81".to_string()]).is_err());
    }

    #[test]
    fn test_prepare_ports_bracketed_ipv6_host() {
        let ports = prepare_ports(&["[::1]:8080:80".to_string(), "[fe80::2]::53/udp".to_string()]).unwrap();
        assert_eq!(ports["80/tcp"][0].host_ip.as_deref(), Some("::1"));
        assert_eq!(ports["80/tcp"][0].host_port.as_deref(), Some("8080"));
        assert_eq!(ports["53/udp"][0].host_ip.as_deref(), Some("fe80::2"));
        assert_eq!(ports["53/udp"][0].host_port, None);

        assert!(prepare_ports(&["[::1]:80".to_string()]).is_err());
        assert!(prepare_ports(&["[::1:8080:80".to_string()]).is_err());
    }

    #[test]
    fn test_prepare_volume() {
        let id = StackId::new("media").unwrap();
        let dir = Path::new("/opt/stacks/media");
        let declared = BTreeMap::from([("shared".to_string(), true), ("data".to_string(), false)]);

        assert_eq!(
            prepare_volume(&id, dir, "./config:/config", &declared),
            VolumeMount::Bind("/opt/stacks/media/config:/config".to_string())
        );
        assert_eq!(
            prepare_volume(&id, dir, "../shared/x:/x:ro", &declared),
            VolumeMount::Bind("/opt/stacks/shared/x:/x:ro".to_string())
        );
        assert_eq!(
            prepare_volume(&id, dir, "/srv/media:/media", &declared),
            VolumeMount::Bind("/srv/media:/media".to_string())
        );
        assert_eq!(
            prepare_volume(&id, dir, "data:/var/lib/data", &declared),
            VolumeMount::Bind("media_data:/var/lib/data".to_string())
        );
        assert_eq!(
            prepare_volume(&id, dir, "shared:/shared", &declared),
            VolumeMount::Bind("shared:/shared".to_string())
        );
        assert_eq!(
            prepare_volume(&id, dir, "/cache", &declared),
            VolumeMount::Anonymous("/cache".to_string())
        );
    }

    #[test]
    fn test_merge_environment_service_wins() {
        let overlay = EnvironmentOverlay::from_pairs([("TZ", "UTC"), ("MODE", "overlay")]).isolated();
        let merged = merge_environment(&["MODE=service".to_string()], &overlay);
        assert_eq!(merged, vec!["MODE=service", "TZ=UTC"]);
    }

    #[test]
    fn test_build_spec_networks_and_labels() {
        let engine: Arc<dyn ContainerEngine> = Arc::new(MockContainerEngine::new());
        let manager = ContainerLifecycleManager::new(engine, EventBus::new(4), 10, true);
        let id = StackId::new("media").unwrap();
        let overlay = EnvironmentOverlay::default().isolated();
        let document = ComposeParser::parse(
            &id,
            r#"
services:
  web:
    image: nginx:1.25
    restart: always
    ports: ["8080:80"]
    networks:
      front: {aliases: [www], ipv4_address: 172.30.0.5}
      proxy: {}
networks:
  front: {}
  proxy: {external: true, name: traefik}
"#,
            &overlay,
        )
        .unwrap();
        let ctx = StackContext {
            stack_id: &id,
            stack_dir: Path::new("/opt/stacks/media"),
            compose_path: Path::new("/opt/stacks/media/compose.yaml"),
            document: &document,
            overlay: &overlay,
        };

        let planned = manager.build_spec(&ctx, &document.services[0], 1).unwrap();
        let spec = &planned.spec;
        assert_eq!(spec.name, "media_web");
        assert_eq!(spec.network_mode.as_deref(), Some("media_front"));
        assert_eq!(spec.endpoints["media_front"].aliases, vec!["web", "www"]);
        assert_eq!(spec.endpoints["media_front"].ipv4_address.as_deref(), Some("172.30.0.5"));
        assert_eq!(planned.extra_networks.len(), 1);
        assert_eq!(planned.extra_networks[0].0, "traefik");
        assert_eq!(spec.restart_policy, RestartPolicy::Always);
        assert_eq!(spec.labels[labels::PROJECT], "media");
        assert_eq!(spec.labels[labels::SERVICE], "web");
        assert_eq!(spec.labels[labels::CONFIG_FILES], "/opt/stacks/media/compose.yaml");
    }

    #[test]
    fn test_build_spec_replica_names() {
        let engine: Arc<dyn ContainerEngine> = Arc::new(MockContainerEngine::new());
        let manager = ContainerLifecycleManager::new(engine, EventBus::new(4), 10, true);
        let id = StackId::new("media").unwrap();
        let overlay = EnvironmentOverlay::default().isolated();
        let document = ComposeParser::parse(
            &id,
            "services:\n  worker:\n    image: w\n    deploy: {replicas: 2}\n",
            &overlay,
        )
        .unwrap();
        let ctx = StackContext {
            stack_id: &id,
            stack_dir: Path::new("/s/media"),
            compose_path: Path::new("/s/media/compose.yaml"),
            document: &document,
            overlay: &overlay,
        };
        let second = manager.build_spec(&ctx, &document.services[0], 2).unwrap();
        assert_eq!(second.spec.name, "media_worker_2");
        assert_eq!(second.spec.network_mode.as_deref(), Some("media_default"));
        assert_eq!(second.spec.labels[labels::CONTAINER_NUMBER], "2");
    }

    #[tokio::test]
    async fn test_resolver_unions_label_and_prefix() {
        let engine = Arc::new(MockContainerEngine::new());
        let labeled = ContainerSpec {
            name: "media_web".to_string(),
            image: "nginx".to_string(),
            labels: BTreeMap::from([(labels::PROJECT.to_string(), "media".to_string())]),
            ..Default::default()
        };
        engine.seed_container(labeled, true);
        engine.seed_container(
            ContainerSpec {
                name: "media_legacy".to_string(),
                image: "redis".to_string(),
                ..Default::default()
            },
            false,
        );
        engine.seed_container(
            ContainerSpec {
                name: "media_other".to_string(),
                image: "redis".to_string(),
                labels: BTreeMap::from([(labels::PROJECT.to_string(), "media_other".to_string())]),
                ..Default::default()
            },
            true,
        );
        engine.seed_container(
            ContainerSpec {
                name: "xmedia_web".to_string(),
                image: "nginx".to_string(),
                ..Default::default()
            },
            true,
        );

        let manager = ContainerLifecycleManager::new(engine.clone(), EventBus::new(4), 10, true);
        let id = StackId::new("media").unwrap();
        let names: Vec<String> = manager
            .resolve_stack_containers(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["media_legacy", "media_web"]);

        assert_eq!(manager.cleanup_stack(&id).await, 2);
        assert_eq!(engine.containers().len(), 2);
    }

    #[tokio::test]
    async fn test_recreate_not_found() {
        let engine: Arc<dyn ContainerEngine> = Arc::new(MockContainerEngine::new());
        let manager = ContainerLifecycleManager::new(engine, EventBus::new(4), 10, true);
        assert!(matches!(manager.recreate("deadbeef0000").await, Err(StackError::NotFound(_))));
    }
}
