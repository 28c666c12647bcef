// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Auto-Update Orchestrator
//!
//! Periodic poll that pulls images for opted-in containers and stacks and
//! replaces whatever runs on an image id that changed. Standalone containers
//! are recreated in place; stacks are redeployed as a whole.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Image-change detection and update dispatch
//! - **Collaborators:** [`StandardStackReconciler`], [`ContainerLifecycleManager`]
//!
//! Failures are isolated per entity: one failed check or redeploy is
//! recorded in the [`TickReport`] and the tick moves on.
//!
//! [`ContainerLifecycleManager`]: crate::application::lifecycle::ContainerLifecycleManager

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::reconciler::{StackReconciler, StandardStackReconciler};
use crate::domain::compose::{is_truthy, labels};
use crate::domain::config::AutoUpdateConfig;
use crate::domain::engine::{ContainerFilter, ContainerSummary};
use crate::domain::events::{AutoUpdateEvent, UpdateTarget};
use crate::domain::stack::{Stack, StackError, StackId};
use crate::infrastructure::compose_parser::{scan_image_references, EnvironmentOverlay};

/// Entities with an update in flight. An entry lives exactly as long as
/// its [`InProgressGuard`].
#[derive(Debug, Clone, Default)]
pub struct InProgressRegistry {
    entries: Arc<Mutex<HashSet<String>>>,
}

impl InProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the key is already held.
    pub fn try_acquire(&self, key: impl Into<String>) -> Option<InProgressGuard> {
        let key = key.into();
        if !self.entries.lock().insert(key.clone()) {
            return None;
        }
        Some(InProgressGuard {
            registry: self.clone(),
            key,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub struct InProgressGuard {
    registry: InProgressRegistry,
    key: String,
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.registry.entries.lock().remove(&self.key);
    }
}

pub fn container_key(id: &str) -> String {
    format!("container:{}", id)
}

pub fn stack_key(id: &StackId) -> String {
    format!("stack:{}", id)
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub containers_checked: usize,
    pub containers_updated: Vec<String>,
    pub stacks_checked: usize,
    pub stacks_updated: Vec<StackId>,
    /// Entities skipped because an update was already in flight.
    pub skipped: Vec<String>,
    pub failures: Vec<(UpdateTarget, String)>,
}

pub struct AutoUpdateOrchestrator {
    reconciler: Arc<StandardStackReconciler>,
    config: AutoUpdateConfig,
    in_progress: InProgressRegistry,
}

impl AutoUpdateOrchestrator {
    pub fn new(reconciler: Arc<StandardStackReconciler>, config: AutoUpdateConfig) -> Self {
        Self {
            reconciler,
            config,
            in_progress: InProgressRegistry::new(),
        }
    }

    pub fn in_progress(&self) -> &InProgressRegistry {
        &self.in_progress
    }

    fn label(&self) -> &str {
        &self.config.label
    }

    /// Poll until cancelled. Returns at once when auto-update is disabled.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Auto-update disabled; poll loop not started");
            return;
        }
        info!(
            "Auto-update loop started (interval {}, label {})",
            humantime::format_duration(self.config.interval),
            self.label()
        );

        let mut interval = tokio::time::interval(self.config.interval.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Auto-update loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    info!(
                        "Auto-update tick: {} containers checked ({} updated), {} stacks checked ({} updated), {} failures",
                        report.containers_checked,
                        report.containers_updated.len(),
                        report.stacks_checked,
                        report.stacks_updated.len(),
                        report.failures.len()
                    );
                }
            }
        }
    }

    /// One poll cycle over every eligible container and stack.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.eligible_containers().await {
            Ok(containers) => {
                for container in containers {
                    let Some(_guard) = self.in_progress.try_acquire(container_key(&container.id)) else {
                        debug!("Container {} already updating, skipped", container.name);
                        report.skipped.push(container.name.clone());
                        continue;
                    };
                    report.containers_checked += 1;
                    match self.update_container(&container).await {
                        Ok(true) => report.containers_updated.push(container.name.clone()),
                        Ok(false) => {}
                        Err(e) => report.failures.push((container_target(&container), e.to_string())),
                    }
                }
            }
            Err(e) => error!("Auto-update: listing containers failed: {}", e),
        }

        match self.eligible_stacks().await {
            Ok(stacks) => {
                for stack in stacks {
                    let Some(_guard) = self.in_progress.try_acquire(stack_key(&stack.id)) else {
                        debug!("Stack {} already updating, skipped", stack.id);
                        report.skipped.push(stack.id.to_string());
                        continue;
                    };
                    report.stacks_checked += 1;
                    match self.update_stack(&stack).await {
                        Ok(changed) if !changed.is_empty() => report.stacks_updated.push(stack.id.clone()),
                        Ok(_) => {}
                        Err(e) => report.failures.push((UpdateTarget::Stack { id: stack.id.clone() }, e.to_string())),
                    }
                }
            }
            Err(e) => error!("Auto-update: listing stacks failed: {}", e),
        }

        report
    }

    /// Running containers carrying a truthy opt-in label that do not belong
    /// to a managed stack.
    pub async fn eligible_containers(&self) -> Result<Vec<ContainerSummary>, StackError> {
        let engine = self.reconciler.lifecycle().engine();
        let containers = engine
            .list_containers(&ContainerFilter::with_label_key(self.label()).running_only())
            .await?;

        let filesystem = self.reconciler.filesystem();
        Ok(containers
            .into_iter()
            .filter(|c| c.state.is_running())
            .filter(|c| c.label(self.label()).map(is_truthy).unwrap_or(false))
            .filter(|c| {
                let managed = c
                    .label(labels::PROJECT)
                    .and_then(|p| StackId::new(p).ok())
                    .map(|id| filesystem.exists(&id))
                    .unwrap_or(false);
                if managed {
                    debug!("Container {} belongs to a managed stack; left to the stack path", c.name);
                }
                !managed
            })
            .collect())
    }

    /// Running or partially running stacks with at least one opted-in service.
    pub async fn eligible_stacks(&self) -> Result<Vec<Stack>, StackError> {
        let mut ids: BTreeSet<StackId> = self
            .reconciler
            .repository()
            .list_by_auto_update_flag(true)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.extend(self.reconciler.filesystem().list_stack_dirs().await?);

        let mut eligible = Vec::new();
        for id in ids {
            let stack = match self.reconciler.get_stack(&id).await {
                Ok(stack) => stack,
                Err(e) => {
                    warn!("Auto-update: skipping stack {}: {}", id, e);
                    continue;
                }
            };
            if !stack.status.is_active() {
                continue;
            }
            match self.reconciler.parse(&stack) {
                Ok(doc) if doc.any_service_labeled(self.label()) => eligible.push(stack),
                Ok(_) => {}
                Err(e) => warn!("Auto-update: stack {} document does not parse: {}", id, e),
            }
        }
        Ok(eligible)
    }

    /// Pull the container's image reference and recreate it when the image
    /// id moved. Returns whether it was recreated.
    pub async fn update_container(&self, container: &ContainerSummary) -> Result<bool, StackError> {
        let target = container_target(container);
        let result = self.check_and_recreate(container, &target).await;
        self.record(&target, "container", &result.as_ref().map(|changed| *changed));
        result
    }

    async fn check_and_recreate(&self, container: &ContainerSummary, target: &UpdateTarget) -> Result<bool, StackError> {
        let reference = &container.image;
        if reference.starts_with("sha256:") {
            debug!("Container {} runs a bare image id; nothing to pull", container.name);
            return Ok(false);
        }

        let engine = self.reconciler.lifecycle().engine();
        engine.pull_image(reference).await?;
        let latest = engine
            .image_id(reference)
            .await?
            .ok_or_else(|| StackError::NotFound(format!("image {} after pull", reference)))?;
        let changed = latest != container.image_id;

        self.reconciler.events().publish_update_event(AutoUpdateEvent::ImageChecked {
            target: target.clone(),
            reference: reference.clone(),
            changed,
            checked_at: Utc::now(),
        });
        if !changed {
            return Ok(false);
        }

        info!("Container {}: {} has a new image, recreating", container.name, reference);
        let replacement = self.reconciler.lifecycle().recreate(&container.id).await?;
        self.reconciler.events().publish_update_event(AutoUpdateEvent::ContainerUpdated {
            target: target.clone(),
            new_container_id: replacement.id,
            updated_at: Utc::now(),
        });
        Ok(true)
    }

    /// Pull every image the stack's document references and redeploy when
    /// any id moved. Every reference is checked even after a change is
    /// found. Returns the changed references.
    pub async fn update_stack(&self, stack: &Stack) -> Result<Vec<String>, StackError> {
        let target = UpdateTarget::Stack { id: stack.id.clone() };
        let result = self.check_and_redeploy(stack, &target).await;
        self.record(&target, "stack", &result.as_ref().map(|changed| !changed.is_empty()));
        result
    }

    async fn check_and_redeploy(&self, stack: &Stack, target: &UpdateTarget) -> Result<Vec<String>, StackError> {
        let overlay = EnvironmentOverlay::parse(&stack.env_overlay);
        let references = scan_image_references(&stack.compose_document, &overlay);
        let engine = self.reconciler.lifecycle().engine();

        let mut changed = Vec::new();
        for reference in references {
            let before = match engine.image_id(&reference).await {
                Ok(id) => id,
                Err(e) => {
                    warn!("Stack {}: cannot resolve {}: {}", stack.id, reference, e);
                    None
                }
            };
            if let Err(e) = engine.pull_image(&reference).await {
                warn!("Stack {}: pull of {} failed: {}", stack.id, reference, e);
                continue;
            }
            let after = match engine.image_id(&reference).await {
                Ok(id) => id,
                Err(e) => {
                    warn!("Stack {}: cannot resolve {} after pull: {}", stack.id, reference, e);
                    continue;
                }
            };

            let moved = after.is_some() && before != after;
            info!(
                "Stack {}: {} {}",
                stack.id,
                reference,
                if moved { "changed" } else { "up to date" }
            );
            self.reconciler.events().publish_update_event(AutoUpdateEvent::ImageChecked {
                target: target.clone(),
                reference: reference.clone(),
                changed: moved,
                checked_at: Utc::now(),
            });
            if moved {
                changed.push(reference);
            }
        }

        if !changed.is_empty() {
            info!("Stack {}: {} images changed, redeploying", stack.id, changed.len());
            self.reconciler.redeploy(&stack.id).await?;
            self.reconciler.events().publish_update_event(AutoUpdateEvent::StackUpdated {
                target: target.clone(),
                changed_images: changed.clone(),
                updated_at: Utc::now(),
            });
        }
        Ok(changed)
    }

    fn record(&self, target: &UpdateTarget, kind: &'static str, outcome: &Result<bool, &StackError>) {
        let result = match outcome {
            Ok(true) => "updated",
            Ok(false) => "unchanged",
            Err(e) => {
                error!("Auto-update of {:?} failed: {}", target, e);
                self.reconciler.events().publish_update_event(AutoUpdateEvent::UpdateFailed {
                    target: target.clone(),
                    reason: e.to_string(),
                    failed_at: Utc::now(),
                });
                "failed"
            }
        };
        metrics::counter!("berth_auto_update_checks_total", "kind" => kind, "result" => result).increment(1);
    }
}

fn container_target(container: &ContainerSummary) -> UpdateTarget {
    UpdateTarget::Container {
        id: container.id.clone(),
        name: container.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::BerthConfig;
    use crate::domain::engine::ContainerSpec;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::filesystem::StackFilesystem;
    use crate::infrastructure::mock_engine::MockContainerEngine;
    use crate::infrastructure::repositories::InMemoryStackRepository;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<MockContainerEngine>, Arc<StandardStackReconciler>, AutoUpdateOrchestrator) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockContainerEngine::new());
        let config = BerthConfig::default();
        let reconciler = Arc::new(StandardStackReconciler::new(
            engine.clone(),
            Arc::new(InMemoryStackRepository::new()),
            Arc::new(StackFilesystem::new(dir.path())),
            EventBus::new(64),
            &config,
        ));
        let orchestrator = AutoUpdateOrchestrator::new(reconciler.clone(), config.auto_update.clone());
        (dir, engine, reconciler, orchestrator)
    }

    fn standalone(name: &str, image: &str, opted_in: bool) -> ContainerSpec {
        let mut spec_labels = BTreeMap::new();
        if opted_in {
            spec_labels.insert(labels::DEFAULT_AUTO_UPDATE.to_string(), "true".to_string());
        }
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            labels: spec_labels,
            ..Default::default()
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = InProgressRegistry::new();
        let guard = registry.try_acquire("stack:media").unwrap();
        assert!(registry.try_acquire("stack:media").is_none());
        drop(guard);
        assert!(registry.is_empty());
        assert!(registry.try_acquire("stack:media").is_some());
    }

    #[tokio::test]
    async fn test_container_with_new_image_is_recreated() {
        let (_dir, engine, _reconciler, orchestrator) = setup();
        engine.set_local_image("app:latest", "sha256:old");
        engine.seed_container(standalone("app", "app:latest", true), true);
        engine.set_remote_image("app:latest", "sha256:new");

        let report = orchestrator.tick().await;
        assert_eq!(report.containers_checked, 1);
        assert_eq!(report.containers_updated, vec!["app"]);
        assert!(report.failures.is_empty());

        let containers = engine.containers();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].image_id, "sha256:new");
        assert!(orchestrator.in_progress().is_empty());
    }

    #[tokio::test]
    async fn test_unlabeled_container_is_never_eligible() {
        let (_dir, engine, _reconciler, orchestrator) = setup();
        engine.set_local_image("app:latest", "sha256:old");
        engine.seed_container(standalone("plain", "app:latest", false), true);
        engine.set_remote_image("app:latest", "sha256:new");

        assert!(orchestrator.eligible_containers().await.unwrap().is_empty());
        let report = orchestrator.tick().await;
        assert_eq!(report.containers_checked, 0);
        assert_eq!(engine.count_calls("pull_image"), 0);
    }

    #[tokio::test]
    async fn test_in_flight_entity_is_skipped() {
        let (_dir, engine, _reconciler, orchestrator) = setup();
        let id = engine.seed_container(standalone("app", "app:latest", true), true);
        let _held = orchestrator.in_progress().try_acquire(container_key(&id)).unwrap();

        let report = orchestrator.tick().await;
        assert_eq!(report.skipped, vec!["app"]);
        assert_eq!(report.containers_checked, 0);
    }

    #[tokio::test]
    async fn test_failed_pull_is_isolated() {
        let (_dir, engine, _reconciler, orchestrator) = setup();
        engine.seed_container(standalone("broken", "broken:latest", true), true);
        engine.seed_container(standalone("fine", "fine:latest", true), true);
        engine.fail_pull_for("broken:latest");

        let report = orchestrator.tick().await;
        assert_eq!(report.containers_checked, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(orchestrator.in_progress().is_empty());
    }
}
