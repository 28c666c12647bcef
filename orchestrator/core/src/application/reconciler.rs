// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Stack Reconciler
//!
//! Drives a stack between stopped and running. `deploying` only exists for
//! the duration of a [`StackReconciler::deploy`] call and is never persisted.
//!
//! A failed deploy never leaves a half-started stack: every container found
//! under the stack's label or name prefix is stopped and removed before the
//! error is returned.
//!
//! The reconciler holds no per-stack lock. Callers serialize user-triggered
//! operations on the same stack; the auto-update orchestrator serializes its
//! own through its in-progress registry.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::lifecycle::{ContainerLifecycleManager, StackContext};
use crate::application::network::NetworkProvisioner;
use crate::domain::config::BerthConfig;
use crate::domain::engine::ContainerEngine;
use crate::domain::events::StackEvent;
use crate::domain::repository::StackRepository;
use crate::domain::stack::{RuntimeInfo, Stack, StackError, StackId};
use crate::infrastructure::compose_parser::{ComposeParser, EnvironmentOverlay};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::filesystem::StackFilesystem;
use crate::infrastructure::runtime_cache::{RuntimeCache, STACK_LIST_KEY};

#[async_trait]
pub trait StackReconciler: Send + Sync {
    /// Pull, provision networks, and create+start every service in document
    /// order. Existing containers of the stack are replaced.
    async fn deploy(&self, id: &StackId) -> Result<Stack, StackError>;
    /// Stop and remove every container of the stack, then its labeled
    /// networks. Returns how many containers were removed.
    async fn stop(&self, id: &StackId) -> Result<usize, StackError>;
    async fn restart(&self, id: &StackId) -> Result<Stack, StackError>;
    async fn redeploy(&self, id: &StackId) -> Result<Stack, StackError>;
    /// Stack with live counts recomputed from the engine.
    async fn get_stack(&self, id: &StackId) -> Result<Stack, StackError>;
    /// Every known stack (metadata and directories), live counts, ordered by id.
    async fn list_stacks(&self) -> Result<Vec<Stack>, StackError>;
}

pub struct StandardStackReconciler {
    repository: Arc<dyn StackRepository>,
    filesystem: Arc<StackFilesystem>,
    networks: Arc<NetworkProvisioner>,
    lifecycle: Arc<ContainerLifecycleManager>,
    cache: RuntimeCache<Vec<Stack>>,
    events: EventBus,
    auto_update_label: String,
}

impl StandardStackReconciler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        repository: Arc<dyn StackRepository>,
        filesystem: Arc<StackFilesystem>,
        events: EventBus,
        config: &BerthConfig,
    ) -> Self {
        let lifecycle = ContainerLifecycleManager::new(
            engine.clone(),
            events.clone(),
            config.runtime.stop_timeout_secs,
            config.runtime.prefer_attached_network,
        );
        Self {
            repository,
            filesystem,
            networks: Arc::new(NetworkProvisioner::new(engine)),
            lifecycle: Arc::new(lifecycle),
            cache: RuntimeCache::new(config.runtime.status_cache_ttl),
            events,
            auto_update_label: config.auto_update.label.clone(),
        }
    }

    pub fn lifecycle(&self) -> &Arc<ContainerLifecycleManager> {
        &self.lifecycle
    }

    pub fn networks(&self) -> &Arc<NetworkProvisioner> {
        &self.networks
    }

    pub fn filesystem(&self) -> &Arc<StackFilesystem> {
        &self.filesystem
    }

    pub fn repository(&self) -> &Arc<dyn StackRepository> {
        &self.repository
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn auto_update_label(&self) -> &str {
        &self.auto_update_label
    }

    /// Drop the memoized stack list. Every mutating operation calls this.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate(STACK_LIST_KEY);
    }

    /// Metadata for a stack with the document refreshed from disk.
    ///
    /// A directory without metadata is registered on the fly; metadata
    /// without a directory keeps its cached document.
    pub async fn load_stack(&self, id: &StackId) -> Result<Stack, StackError> {
        let stored = self.repository.get_stack_by_id(id).await?;
        let on_disk = self.filesystem.exists(id);

        match (stored, on_disk) {
            (Some(mut stack), true) => {
                let compose = self.filesystem.read_compose(id).await?;
                let env = self.filesystem.read_env(id).await?;
                if compose != stack.compose_document || env != stack.env_overlay {
                    debug!("Stack {}: refreshing cached document from disk", id);
                    self.repository.update_content(id, &compose, &env).await?;
                    stack.compose_document = compose;
                    stack.env_overlay = env;
                }
                Ok(stack)
            }
            (Some(stack), false) => {
                warn!("Stack {}: directory missing, using cached document", id);
                Ok(stack)
            }
            (None, true) => {
                let compose = self.filesystem.read_compose(id).await?;
                let env = self.filesystem.read_env(id).await?;
                let mut stack = Stack::new(id.clone(), id.as_str(), compose, env);
                stack.auto_update_enabled = self.auto_update_flag(&stack);
                self.repository.save_stack(&stack).await?;
                info!("Stack {}: registered from directory", id);
                Ok(stack)
            }
            (None, false) => Err(StackError::NotFound(format!("stack '{}'", id))),
        }
    }

    /// Parse a stack's cached document with its own overlay.
    pub fn parse(&self, stack: &Stack) -> Result<crate::domain::compose::ParsedDocument, StackError> {
        let overlay = EnvironmentOverlay::parse(&stack.env_overlay);
        ComposeParser::parse(&stack.id, &stack.compose_document, &overlay)
    }

    fn auto_update_flag(&self, stack: &Stack) -> bool {
        self.parse(stack)
            .map(|doc| doc.any_service_labeled(&self.auto_update_label))
            .unwrap_or(false)
    }

    /// Expected container count: from the document when it parses, else the
    /// last recorded count.
    fn expected_count(&self, stack: &Stack) -> usize {
        match self.parse(stack) {
            Ok(doc) => doc.expected_container_count(),
            Err(e) => {
                debug!("Stack {}: {}; keeping recorded service count", stack.id, e);
                stack.service_count
            }
        }
    }

    async fn running_count(&self, id: &StackId) -> Result<usize, StackError> {
        Ok(self
            .lifecycle
            .resolve_stack_containers(id)
            .await?
            .iter()
            .filter(|c| c.state.is_running())
            .count())
    }

    /// Concurrent best-effort pulls. Returns the references that failed.
    async fn pull_images(&self, id: &StackId, references: &[String]) -> Vec<String> {
        let engine = self.lifecycle.engine();
        let pulls = references.iter().map(|reference| async move {
            (reference, engine.pull_image(reference).await)
        });

        let mut failed = Vec::new();
        for (reference, result) in join_all(pulls).await {
            match result {
                Ok(()) => debug!("Stack {}: pulled {}", id, reference),
                Err(e) => {
                    warn!("Stack {}: pull of {} failed, using local image: {}", id, reference, e);
                    failed.push(reference.clone());
                }
            }
        }
        failed
    }

    async fn deploy_inner(&self, id: &StackId) -> Result<Stack, StackError> {
        // 1. Load stack and parse. No engine call before the document is valid.
        let mut stack = self.load_stack(id).await?;
        let overlay = EnvironmentOverlay::parse(&stack.env_overlay);
        let document = ComposeParser::parse(id, &stack.compose_document, &overlay)?;
        if document.has_external_network() {
            debug!("Stack {}: resolving external networks by name", id);
        }

        // 2. Pull every referenced image
        let references = document.image_references();
        let failed = self.pull_images(id, &references).await;
        if !failed.is_empty() {
            warn!("Stack {}: {}/{} image pulls failed", id, failed.len(), references.len());
        }

        // 3. Networks
        self.networks.ensure_networks(id, &document).await?;

        // 4. Replace whatever the stack is currently running
        let replaced = self.lifecycle.cleanup_stack(id).await;
        if replaced > 0 {
            info!("Stack {}: replacing {} existing containers", id, replaced);
        }

        // 5. Services, sequentially in document order
        let stack_dir = self.filesystem.stack_dir(id);
        let compose_path = self.filesystem.compose_path(id);
        let ctx = StackContext {
            stack_id: id,
            stack_dir: &stack_dir,
            compose_path: &compose_path,
            document: &document,
            overlay: &overlay,
        };
        for service in &document.services {
            if let Err(e) = self.lifecycle.create_service(&ctx, service).await {
                error!("Stack {}: deploy failed at service '{}': {}", id, service.name, e);
                let removed = self.lifecycle.cleanup_stack(id).await;
                info!("Stack {}: rolled back {} containers", id, removed);
                return Err(e);
            }
        }

        // 6. Record
        let running = self.running_count(id).await?;
        let runtime = RuntimeInfo::reconciled(document.expected_container_count(), running);
        stack.apply_runtime(&runtime);
        stack.auto_update_enabled = document.any_service_labeled(&self.auto_update_label);
        self.repository.save_stack(&stack).await?;

        info!(
            "Stack {} deployed: {}/{} containers running ({})",
            id, running, runtime.service_count, stack.status
        );
        Ok(stack)
    }
}

#[async_trait]
impl StackReconciler for StandardStackReconciler {
    async fn deploy(&self, id: &StackId) -> Result<Stack, StackError> {
        info!("Deploying stack {}", id);
        let result = self.deploy_inner(id).await;
        self.invalidate_cache();

        match &result {
            Ok(stack) => {
                metrics::counter!("berth_stack_deploys_total", "result" => "success").increment(1);
                self.events.publish_stack_event(StackEvent::StackDeployed {
                    stack_id: id.clone(),
                    service_count: stack.service_count,
                    deployed_at: Utc::now(),
                });
            }
            Err(e) => {
                metrics::counter!("berth_stack_deploys_total", "result" => "failure").increment(1);
                self.events.publish_stack_event(StackEvent::StackDeployFailed {
                    stack_id: id.clone(),
                    reason: e.to_string(),
                    failed_at: Utc::now(),
                });
            }
        }
        result
    }

    async fn stop(&self, id: &StackId) -> Result<usize, StackError> {
        let stack = self.load_stack(id).await?;
        info!("Stopping stack {}", id);

        let removed = self.lifecycle.cleanup_stack(id).await;
        let networks = self.networks.remove_stack_networks(id).await;
        debug!("Stack {}: removed {} networks", id, networks);

        let runtime = RuntimeInfo::observed(self.expected_count(&stack), self.running_count(id).await?);
        self.repository.update_runtime_info(id, &runtime).await?;
        self.invalidate_cache();

        metrics::counter!("berth_stack_stops_total").increment(1);
        self.events.publish_stack_event(StackEvent::StackStopped {
            stack_id: id.clone(),
            removed_containers: removed,
            stopped_at: Utc::now(),
        });
        info!("Stack {} stopped ({} containers removed)", id, removed);
        Ok(removed)
    }

    async fn restart(&self, id: &StackId) -> Result<Stack, StackError> {
        self.stop(id).await?;
        self.deploy(id).await
    }

    async fn redeploy(&self, id: &StackId) -> Result<Stack, StackError> {
        // deploy always pulls and always replaces containers
        self.deploy(id).await
    }

    async fn get_stack(&self, id: &StackId) -> Result<Stack, StackError> {
        let mut stack = self.load_stack(id).await?;
        let runtime = RuntimeInfo::observed(self.expected_count(&stack), self.running_count(id).await?);
        self.repository.update_runtime_info(id, &runtime).await?;
        stack.apply_runtime(&runtime);
        Ok(stack)
    }

    async fn list_stacks(&self) -> Result<Vec<Stack>, StackError> {
        if let Some(stacks) = self.cache.get(STACK_LIST_KEY) {
            return Ok(stacks);
        }

        let mut ids: BTreeSet<StackId> = self
            .repository
            .list_all()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.extend(self.filesystem.list_stack_dirs().await?);

        let mut stacks = Vec::with_capacity(ids.len());
        for (id, result) in join_all(ids.iter().map(|id| async move { (id, self.get_stack(id).await) })).await {
            match result {
                Ok(stack) => stacks.push(stack),
                Err(e) => warn!("Skipping stack {} in listing: {}", id, e),
            }
        }

        self.cache.put(STACK_LIST_KEY, stacks.clone());
        Ok(stacks)
    }
}
