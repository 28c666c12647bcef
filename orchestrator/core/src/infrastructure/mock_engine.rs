// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! In-memory container engine.
//!
//! Behaves like the engine for the calls the stack engine makes: names are
//! unique, creating a container on a missing network fails, stopping a
//! stopped container answers `NotModified`. Failures can be injected per
//! container name, network name or image reference. Exported for
//! integration tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::domain::engine::{
    ContainerDetails, ContainerEngine, ContainerFilter, ContainerSpec, ContainerState,
    ContainerStats, ContainerSummary, EndpointSpec, EngineError, LogLine, LogOptions,
    NetworkFilter, NetworkSpec, NetworkSummary,
};

const BUILTIN_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    spec: ContainerSpec,
    state: ContainerState,
    image_id: String,
    networks: BTreeMap<String, EndpointSpec>,
    logs: Vec<LogLine>,
    stats: ContainerStats,
}

#[derive(Debug, Clone)]
struct MockNetwork {
    id: String,
    spec: NetworkSpec,
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    networks: Vec<MockNetwork>,
    local_images: HashMap<String, String>,
    remote_images: HashMap<String, String>,
    fail_create: HashSet<String>,
    fail_start: HashSet<String>,
    fail_pull: HashSet<String>,
    fail_network_create: HashSet<String>,
    calls: Vec<String>,
    next_id: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:012x}", prefix, self.next_id)
    }

    fn find(&self, id_or_name: &str) -> Option<usize> {
        self.containers.iter().position(|c| {
            c.id == id_or_name
                || c.spec.name == id_or_name
                || (id_or_name.len() >= 4 && c.id.starts_with(id_or_name))
        })
    }

    fn network_exists(&self, name: &str) -> bool {
        BUILTIN_NETWORKS.contains(&name) || self.networks.iter().any(|n| n.spec.name == name || n.id == name)
    }
}

fn label_matches(labels: &BTreeMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).map(|v| v == value).unwrap_or(false),
        None => labels.contains_key(filter),
    }
}

fn summary(c: &MockContainer) -> ContainerSummary {
    ContainerSummary {
        id: c.id.clone(),
        name: c.spec.name.clone(),
        image: c.spec.image.clone(),
        image_id: c.image_id.clone(),
        state: c.state,
        status_text: format!("{:?}", c.state),
        labels: c.spec.labels.clone(),
    }
}

#[derive(Default)]
pub struct MockContainerEngine {
    state: Mutex<MockState>,
}

impl MockContainerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a container directly, as if created outside the stack engine.
    pub fn seed_container(&self, spec: ContainerSpec, running: bool) -> String {
        let mut state = self.state.lock();
        let id = state.next_id("c0ffee");
        let image_id = state
            .local_images
            .get(&spec.image)
            .cloned()
            .unwrap_or_else(|| format!("sha256:seed-{}", spec.image));
        let mut networks = BTreeMap::new();
        if let Some(mode) = &spec.network_mode {
            networks.insert(mode.clone(), spec.endpoints.get(mode).cloned().unwrap_or_default());
        }
        state.containers.push(MockContainer {
            id: id.clone(),
            spec,
            state: if running { ContainerState::Running } else { ContainerState::Exited },
            image_id,
            networks,
            logs: Vec::new(),
            stats: ContainerStats::default(),
        });
        id
    }

    /// Add a network directly.
    pub fn seed_network(&self, spec: NetworkSpec) -> String {
        let mut state = self.state.lock();
        let id = state.next_id("net");
        state.networks.push(MockNetwork { id: id.clone(), spec });
        id
    }

    /// Attach an existing container to an additional network.
    pub fn attach_network(&self, container: &str, network: &str, endpoint: EndpointSpec) {
        let mut state = self.state.lock();
        if let Some(idx) = state.find(container) {
            state.containers[idx].networks.insert(network.to_string(), endpoint);
        }
    }

    pub fn set_local_image(&self, reference: &str, image_id: &str) {
        self.state
            .lock()
            .local_images
            .insert(reference.to_string(), image_id.to_string());
    }

    /// Image id a pull of `reference` will produce.
    pub fn set_remote_image(&self, reference: &str, image_id: &str) {
        self.state
            .lock()
            .remote_images
            .insert(reference.to_string(), image_id.to_string());
    }

    pub fn set_logs(&self, container: &str, logs: Vec<LogLine>) {
        let mut state = self.state.lock();
        if let Some(idx) = state.find(container) {
            state.containers[idx].logs = logs;
        }
    }

    pub fn set_stats(&self, container: &str, stats: ContainerStats) {
        let mut state = self.state.lock();
        if let Some(idx) = state.find(container) {
            state.containers[idx].stats = stats;
        }
    }

    pub fn set_container_state(&self, container: &str, new_state: ContainerState) {
        let mut state = self.state.lock();
        if let Some(idx) = state.find(container) {
            state.containers[idx].state = new_state;
        }
    }

    pub fn fail_create_for(&self, container_name: &str) {
        self.state.lock().fail_create.insert(container_name.to_string());
    }

    pub fn fail_start_for(&self, container_name: &str) {
        self.state.lock().fail_start.insert(container_name.to_string());
    }

    pub fn fail_pull_for(&self, reference: &str) {
        self.state.lock().fail_pull.insert(reference.to_string());
    }

    pub fn fail_network_create_for(&self, network_name: &str) {
        self.state.lock().fail_network_create.insert(network_name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_create.clear();
        state.fail_start.clear();
        state.fail_pull.clear();
        state.fail_network_create.clear();
    }

    pub fn containers(&self) -> Vec<ContainerSummary> {
        self.state.lock().containers.iter().map(summary).collect()
    }

    pub fn container_spec(&self, name: &str) -> Option<ContainerSpec> {
        let state = self.state.lock();
        state.find(name).map(|idx| state.containers[idx].spec.clone())
    }

    pub fn container_networks(&self, name: &str) -> BTreeMap<String, EndpointSpec> {
        let state = self.state.lock();
        state
            .find(name)
            .map(|idx| state.containers[idx].networks.clone())
            .unwrap_or_default()
    }

    pub fn network_names(&self) -> Vec<String> {
        self.state.lock().networks.iter().map(|n| n.spec.name.clone()).collect()
    }

    pub fn network_spec(&self, name: &str) -> Option<NetworkSpec> {
        self.state
            .lock()
            .networks
            .iter()
            .find(|n| n.spec.name == name)
            .map(|n| n.spec.clone())
    }

    /// Every engine call made so far, as `operation target`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .count()
    }

    fn record(&self, state: &mut MockState, operation: &str, target: &str) {
        state.calls.push(format!("{} {}", operation, target));
    }
}

#[async_trait]
impl ContainerEngine for MockContainerEngine {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "list_containers", "");
        Ok(state
            .containers
            .iter()
            .filter(|c| filter.all || c.state.is_running())
            .filter(|c| filter.labels.iter().all(|l| label_matches(&c.spec.labels, l)))
            .filter(|c| filter.name.as_ref().map(|n| c.spec.name.contains(n.as_str())).unwrap_or(true))
            .filter(|c| filter.id.as_ref().map(|id| c.id.starts_with(id.as_str())).unwrap_or(true))
            .map(summary)
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "inspect_container", id);
        let idx = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
        let c = &state.containers[idx];
        Ok(ContainerDetails {
            id: c.id.clone(),
            name: c.spec.name.clone(),
            image_id: c.image_id.clone(),
            state: c.state,
            exit_code: (!c.state.is_running()).then_some(0),
            spec: c.spec.clone(),
            networks: c.networks.clone(),
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "create_container", &spec.name);

        if state.fail_create.contains(&spec.name) {
            return Err(EngineError::Request(format!("injected create failure for {}", spec.name)));
        }
        if state.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::Conflict(format!(
                "container name \"/{}\" is already in use",
                spec.name
            )));
        }

        let mut networks = BTreeMap::new();
        if let Some(mode) = &spec.network_mode {
            let attaches = !mode.starts_with("container:") && mode != "host" && mode != "none";
            if attaches {
                if !state.network_exists(mode) {
                    return Err(EngineError::NotFound(format!("network {} not found", mode)));
                }
                networks.insert(mode.clone(), spec.endpoints.get(mode).cloned().unwrap_or_default());
            }
        }

        let id = state.next_id("c0ffee");
        let image_id = state
            .local_images
            .get(&spec.image)
            .cloned()
            .unwrap_or_else(|| format!("sha256:local-{}", spec.image));
        state.containers.push(MockContainer {
            id: id.clone(),
            spec: spec.clone(),
            state: ContainerState::Created,
            image_id,
            networks,
            logs: Vec::new(),
            stats: ContainerStats::default(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "start_container", id);
        let idx = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
        if state.fail_start.contains(&state.containers[idx].spec.name) {
            return Err(EngineError::Request(format!("injected start failure for {}", id)));
        }
        if state.containers[idx].state.is_running() {
            return Err(EngineError::NotModified(format!("container {} already started", id)));
        }
        state.containers[idx].state = ContainerState::Running;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "stop_container", id);
        let idx = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
        if !state.containers[idx].state.is_running() {
            return Err(EngineError::NotModified(format!("container {} already stopped", id)));
        }
        state.containers[idx].state = ContainerState::Exited;
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout_secs: i64) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "restart_container", id);
        let idx = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
        state.containers[idx].state = ContainerState::Running;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "remove_container", id);
        let idx = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
        if state.containers[idx].state.is_running() && !force {
            return Err(EngineError::Conflict(format!(
                "cannot remove running container {}; stop it first",
                id
            )));
        }
        state.containers.remove(idx);
        Ok(())
    }

    async fn connect_network(&self, network: &str, container_id: &str, endpoint: &EndpointSpec) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "connect_network", &format!("{}:{}", network, container_id));
        if !state.network_exists(network) {
            return Err(EngineError::NotFound(format!("network {} not found", network)));
        }
        let idx = state
            .find(container_id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", container_id)))?;
        state.containers[idx]
            .networks
            .insert(network.to_string(), endpoint.clone());
        Ok(())
    }

    async fn container_logs(&self, id: &str, options: &LogOptions) -> Result<Vec<LogLine>, EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "container_logs", id);
        let idx = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
        let logs = &state.containers[idx].logs;
        let skip = options
            .tail
            .map(|tail| logs.len().saturating_sub(tail))
            .unwrap_or(0);
        Ok(logs[skip..].to_vec())
    }

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "container_stats", id);
        let idx = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))?;
        Ok(state.containers[idx].stats.clone())
    }

    async fn list_networks(&self, filter: &NetworkFilter) -> Result<Vec<NetworkSummary>, EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "list_networks", "");
        Ok(state
            .networks
            .iter()
            .filter(|n| filter.labels.iter().all(|l| label_matches(&n.spec.labels, l)))
            .filter(|n| filter.name.as_ref().map(|f| n.spec.name.contains(f.as_str())).unwrap_or(true))
            .map(|n| NetworkSummary {
                id: n.id.clone(),
                name: n.spec.name.clone(),
                driver: n.spec.driver.clone(),
                labels: n.spec.labels.clone(),
            })
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "create_network", &spec.name);
        if state.fail_network_create.contains(&spec.name) {
            return Err(EngineError::Request(format!("injected network failure for {}", spec.name)));
        }
        if state.network_exists(&spec.name) {
            return Err(EngineError::Conflict(format!("network with name {} already exists", spec.name)));
        }
        let id = state.next_id("net");
        state.networks.push(MockNetwork {
            id: id.clone(),
            spec: spec.clone(),
        });
        Ok(id)
    }

    async fn remove_network(&self, name_or_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "remove_network", name_or_id);
        let idx = state
            .networks
            .iter()
            .position(|n| n.spec.name == name_or_id || n.id == name_or_id)
            .ok_or_else(|| EngineError::NotFound(format!("network {} not found", name_or_id)))?;
        let name = state.networks[idx].spec.name.clone();
        if state.containers.iter().any(|c| c.networks.contains_key(&name)) {
            return Err(EngineError::Request(format!("network {} has active endpoints", name)));
        }
        state.networks.remove(idx);
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "pull_image", reference);
        if state.fail_pull.contains(reference) {
            return Err(EngineError::Request(format!("pull access denied for {}", reference)));
        }
        let pulled = state
            .remote_images
            .get(reference)
            .cloned()
            .or_else(|| state.local_images.get(reference).cloned())
            .unwrap_or_else(|| format!("sha256:pulled-{}", reference));
        state.local_images.insert(reference.to_string(), pulled);
        Ok(())
    }

    async fn image_id(&self, reference: &str) -> Result<Option<String>, EngineError> {
        let mut state = self.state.lock();
        self.record(&mut state, "image_id", reference);
        Ok(state.local_images.get(reference).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, network: Option<&str>) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "nginx:1.25".to_string(),
            network_mode: network.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_container_lifecycle_semantics() {
        let engine = MockContainerEngine::new();
        let id = engine.create_container(&spec("web", Some("bridge"))).await.unwrap();

        assert!(engine.create_container(&spec("web", None)).await.unwrap_err().is_conflict());
        engine.start_container(&id).await.unwrap();
        assert!(matches!(engine.start_container(&id).await, Err(EngineError::NotModified(_))));
        assert!(engine.remove_container(&id, false).await.unwrap_err().is_conflict());
        engine.stop_container(&id, 10).await.unwrap();
        assert!(matches!(engine.stop_container(&id, 10).await, Err(EngineError::NotModified(_))));
        engine.remove_container(&id, false).await.unwrap();
        assert!(engine.inspect_container(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_requires_network() {
        let engine = MockContainerEngine::new();
        assert!(engine
            .create_container(&spec("web", Some("media_default")))
            .await
            .unwrap_err()
            .is_not_found());

        engine
            .create_network(&NetworkSpec {
                name: "media_default".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        engine.create_container(&spec("web", Some("media_default"))).await.unwrap();
        assert!(engine.container_networks("web").contains_key("media_default"));
    }

    #[tokio::test]
    async fn test_pull_updates_local_image_id() {
        let engine = MockContainerEngine::new();
        engine.set_local_image("nginx:1.25", "sha256:old");
        engine.set_remote_image("nginx:1.25", "sha256:new");
        assert_eq!(engine.image_id("nginx:1.25").await.unwrap().as_deref(), Some("sha256:old"));
        engine.pull_image("nginx:1.25").await.unwrap();
        assert_eq!(engine.image_id("nginx:1.25").await.unwrap().as_deref(), Some("sha256:new"));
        assert_eq!(engine.count_calls("pull_image"), 1);
    }
}
