// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Stack Identity Manager
//!
//! Everything that changes which stacks exist or what they are called:
//! create, content updates, delete, rename, layout migration, and adoption
//! of compose projects started by other tooling.

use chrono::Utc;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::application::reconciler::{StackReconciler, StandardStackReconciler};
use crate::domain::compose::labels;
use crate::domain::engine::{ContainerFilter, ContainerSummary};
use crate::domain::events::StackEvent;
use crate::domain::repository::RepositoryError;
use crate::domain::stack::{slugify, Stack, StackError, StackId};
use crate::infrastructure::compose_parser::{ComposeParser, EnvironmentOverlay};

/// Outcome of moving flat `<name>.yml` files into per-stack directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: Vec<StackId>,
    /// File names left in place, with the reason.
    pub skipped: Vec<(String, String)>,
}

/// A compose project running on the engine with no managed directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalStack {
    /// Project label value.
    pub project: String,
    /// First config file recorded on the containers, if any.
    pub config_file: Option<String>,
    pub containers: Vec<ContainerSummary>,
}

impl ExternalStack {
    pub fn running_count(&self) -> usize {
        self.containers.iter().filter(|c| c.state.is_running()).count()
    }
}

pub struct StackIdentityManager {
    reconciler: Arc<StandardStackReconciler>,
    rename_max_attempts: u32,
}

impl StackIdentityManager {
    pub fn new(reconciler: Arc<StandardStackReconciler>, rename_max_attempts: u32) -> Self {
        Self {
            reconciler,
            rename_max_attempts,
        }
    }

    fn validate_document(&self, id: &StackId, compose: &str, env: &str) -> Result<bool, StackError> {
        let document = ComposeParser::parse(id, compose, &EnvironmentOverlay::parse(env))?;
        Ok(document.any_service_labeled(self.reconciler.auto_update_label()))
    }

    async fn id_taken(&self, id: &StackId) -> Result<bool, StackError> {
        Ok(self.reconciler.filesystem().exists(id)
            || self.reconciler.repository().get_stack_by_id(id).await?.is_some())
    }

    /// New managed stack from a display name. Duplicate id → `Conflict`,
    /// invalid document → `Parse`; nothing is written in either case.
    pub async fn create(&self, name: &str, compose: &str, env: &str) -> Result<Stack, StackError> {
        let id = slugify(name)
            .ok_or_else(|| StackError::InvalidName(format!("'{}' yields an empty stack id", name)))?;
        if self.id_taken(&id).await? {
            return Err(StackError::Conflict(format!("stack '{}' already exists", id)));
        }
        let auto_update = self.validate_document(&id, compose, env)?;

        self.reconciler.filesystem().write(&id, compose, Some(env)).await?;
        let mut stack = Stack::new(id.clone(), name.trim(), compose, env);
        stack.auto_update_enabled = auto_update;
        if let Err(e) = self.reconciler.repository().save_stack(&stack).await {
            error!("Stack {}: metadata save failed, removing directory: {}", id, e);
            self.reconciler.filesystem().remove(&id).await?;
            return Err(e.into());
        }

        self.reconciler.invalidate_cache();
        info!("Created stack {} ({})", id, stack.name);
        Ok(stack)
    }

    /// Replace the compose document, and the overlay when given. Running
    /// containers are untouched until the next deploy.
    pub async fn update_content(&self, id: &StackId, compose: &str, env: Option<&str>) -> Result<Stack, StackError> {
        let mut stack = self.reconciler.load_stack(id).await?;
        let env = env.map(str::to_string).unwrap_or_else(|| stack.env_overlay.clone());
        stack.auto_update_enabled = self.validate_document(id, compose, &env)?;

        self.reconciler.filesystem().write(id, compose, Some(env.as_str())).await?;
        stack.compose_document = compose.to_string();
        stack.env_overlay = env;
        self.reconciler.repository().save_stack(&stack).await?;

        self.reconciler.invalidate_cache();
        info!("Updated content of stack {}", id);
        Ok(stack)
    }

    /// Tear down containers and networks, then remove the directory and
    /// metadata.
    pub async fn delete(&self, id: &StackId) -> Result<(), StackError> {
        if !self.id_taken(id).await? {
            return Err(StackError::NotFound(format!("stack '{}'", id)));
        }

        let removed = self.reconciler.lifecycle().cleanup_stack(id).await;
        self.reconciler.networks().remove_stack_networks(id).await;
        self.reconciler.filesystem().remove(id).await?;
        match self.reconciler.repository().delete_stack(id).await {
            Ok(()) | Err(RepositoryError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.reconciler.invalidate_cache();
        self.reconciler.events().publish_stack_event(StackEvent::StackDeleted {
            stack_id: id.clone(),
            deleted_at: Utc::now(),
        });
        info!("Deleted stack {} ({} containers removed)", id, removed);
        Ok(())
    }

    /// First free slug for `name`: the slug itself, then `-2`, `-3`, ...
    async fn free_slug(&self, old_id: &StackId, name: &str) -> Result<StackId, StackError> {
        let base = slugify(name)
            .ok_or_else(|| StackError::InvalidName(format!("'{}' yields an empty stack id", name)))?;

        for attempt in 1..=self.rename_max_attempts {
            let candidate = if attempt == 1 {
                base.clone()
            } else {
                StackId::new(format!("{}-{}", base, attempt))?
            };
            if &candidate == old_id {
                continue;
            }
            if !self.id_taken(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(StackError::Conflict(format!(
            "no free stack id for '{}' after {} attempts",
            name, self.rename_max_attempts
        )))
    }

    /// Rename a stopped stack. Any running container under the stack rejects
    /// the rename untouched, whatever status the document yields.
    ///
    /// The directory moves first; metadata for the new id is written right
    /// after, and the directory is moved back if that write fails.
    pub async fn rename(&self, old_id: &StackId, new_name: &str) -> Result<Stack, StackError> {
        let stack = self.reconciler.get_stack(old_id).await?;
        if stack.status.is_active() || stack.running_count > 0 {
            return Err(StackError::StackRunning(old_id.to_string()));
        }
        let new_id = self.free_slug(old_id, new_name).await?;

        // Stopped containers and networks still carry the old names
        let lifecycle = self.reconciler.lifecycle();
        let removed = lifecycle.cleanup_stack(old_id).await;
        self.reconciler.networks().remove_stack_networks(old_id).await;
        debug!("Stack {}: removed {} stopped containers before rename", old_id, removed);

        let filesystem = self.reconciler.filesystem();
        let moved = filesystem.exists(old_id);
        if moved {
            filesystem.rename(old_id, &new_id).await?;
        }

        let renamed = Stack {
            id: new_id.clone(),
            name: new_name.trim().to_string(),
            ..stack
        };
        let repository = self.reconciler.repository();
        if let Err(e) = repository.save_stack(&renamed).await {
            error!("Stack {}: metadata write for {} failed, restoring directory: {}", old_id, new_id, e);
            if moved {
                filesystem.rename(&new_id, old_id).await?;
            }
            return Err(e.into());
        }
        if let Err(e) = repository.delete_stack(old_id).await {
            warn!("Stack {}: stale metadata left after rename: {}", old_id, e);
        }

        self.reconciler.invalidate_cache();
        self.reconciler.events().publish_stack_event(StackEvent::StackRenamed {
            old_id: old_id.clone(),
            new_id: new_id.clone(),
            renamed_at: Utc::now(),
        });
        info!("Renamed stack {} -> {}", old_id, new_id);
        Ok(renamed)
    }

    /// Move flat `<root>/<name>.yml` (+ `<name>.env`) files into
    /// `<root>/<slug>/`. Existing targets are skipped, never overwritten.
    pub async fn migrate_layout(&self) -> Result<MigrationReport, StackError> {
        let filesystem = self.reconciler.filesystem();
        let mut report = MigrationReport::default();

        for legacy in filesystem.legacy_files().await? {
            let file_name = legacy
                .compose
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| legacy.name.clone());
            let Some(id) = slugify(&legacy.name) else {
                report.skipped.push((file_name, "name yields an empty stack id".to_string()));
                continue;
            };
            if filesystem.exists(&id) {
                report.skipped.push((file_name, format!("stack '{}' already exists", id)));
                continue;
            }

            let compose = tokio::fs::read_to_string(&legacy.compose)
                .await
                .map_err(|e| StackError::io(&legacy.compose, e))?;
            let env = match &legacy.env {
                Some(path) => tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| StackError::io(path, e))?,
                None => String::new(),
            };

            filesystem.write(&id, &compose, Some(env.as_str())).await?;
            tokio::fs::remove_file(&legacy.compose)
                .await
                .map_err(|e| StackError::io(&legacy.compose, e))?;
            if let Some(path) = &legacy.env {
                tokio::fs::remove_file(path).await.map_err(|e| StackError::io(path, e))?;
            }

            let repository = self.reconciler.repository();
            if repository.get_stack_by_id(&id).await?.is_none() {
                let mut stack = Stack::new(id.clone(), legacy.name.clone(), compose, env);
                stack.auto_update_enabled = self
                    .validate_document(&id, &stack.compose_document, &stack.env_overlay)
                    .unwrap_or(false);
                repository.save_stack(&stack).await?;
            }
            info!("Migrated {} into stack directory {}", file_name, id);
            report.migrated.push(id);
        }

        if !report.migrated.is_empty() {
            self.reconciler.invalidate_cache();
        }
        Ok(report)
    }

    /// Compose projects on the engine that have no managed directory, one
    /// entry per distinct project label value.
    pub async fn discover_external(&self) -> Result<Vec<ExternalStack>, StackError> {
        let containers = self
            .reconciler
            .lifecycle()
            .engine()
            .list_containers(&ContainerFilter::with_label_key(labels::PROJECT))
            .await?;

        let mut projects: BTreeMap<String, Vec<ContainerSummary>> = BTreeMap::new();
        for container in containers {
            if let Some(project) = container.label(labels::PROJECT) {
                projects.entry(project.to_string()).or_default().push(container);
            }
        }

        let filesystem = self.reconciler.filesystem();
        Ok(projects
            .into_iter()
            .filter(|(project, _)| {
                StackId::new(project.as_str())
                    .map(|id| !filesystem.exists(&id))
                    .unwrap_or(true)
            })
            .map(|(project, containers)| ExternalStack {
                config_file: containers.iter().find_map(config_file_of),
                project,
                containers,
            })
            .collect())
    }

    /// Adopt an external project as a managed stack. The document is read
    /// from the recorded config file when reachable, otherwise rebuilt from
    /// the containers' images.
    pub async fn import(&self, project: &str) -> Result<Stack, StackError> {
        let id = StackId::new(project)
            .ok()
            .or_else(|| slugify(project))
            .ok_or_else(|| StackError::InvalidName(format!("'{}' yields an empty stack id", project)))?;
        if self.id_taken(&id).await? {
            return Err(StackError::Conflict(format!("stack '{}' already exists", id)));
        }

        let mut containers = self
            .reconciler
            .lifecycle()
            .engine()
            .list_containers(&ContainerFilter::by_label(labels::PROJECT, project))
            .await?;
        if containers.is_empty() {
            return Err(StackError::NotFound(format!("no containers for project '{}'", project)));
        }
        containers.sort_by(|a, b| a.name.cmp(&b.name));

        let recorded = match containers.iter().find_map(config_file_of) {
            Some(path) => match tokio::fs::read_to_string(&path).await {
                Ok(text) if ComposeParser::parse(&id, &text, &EnvironmentOverlay::default()).is_ok() => Some(text),
                Ok(_) => {
                    warn!("Import {}: {} does not parse, reconstructing", project, path);
                    None
                }
                Err(e) => {
                    warn!("Import {}: cannot read {}: {}; reconstructing", project, path, e);
                    None
                }
            },
            None => None,
        };
        let reconstructed = recorded.is_none();
        let compose = match recorded {
            Some(text) => text,
            None => reconstruct_document(project, &containers, self.reconciler.auto_update_label())?,
        };

        self.reconciler.filesystem().write(&id, &compose, None).await?;
        let mut stack = Stack::new(id.clone(), project, compose, "");
        stack.is_external = true;
        stack.auto_update_enabled = self.validate_document(&id, &stack.compose_document, "").unwrap_or(false);
        self.reconciler.repository().save_stack(&stack).await?;

        self.reconciler.invalidate_cache();
        self.reconciler.events().publish_stack_event(StackEvent::StackImported {
            stack_id: id.clone(),
            reconstructed,
            imported_at: Utc::now(),
        });
        info!("Imported project {} as stack {} (reconstructed: {})", project, id, reconstructed);
        Ok(stack)
    }
}

fn config_file_of(container: &ContainerSummary) -> Option<String> {
    container
        .label(labels::CONFIG_FILES)
        .and_then(|files| files.split(',').next())
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
}

/// Minimal compose document from container images: one service per
/// container, named by its service label or by the name minus the
/// project prefix. Opt-in labels are carried over.
pub fn reconstruct_document(
    project: &str,
    containers: &[ContainerSummary],
    auto_update_label: &str,
) -> Result<String, StackError> {
    let prefix = format!("{}_", project);
    let mut services = Mapping::new();

    for container in containers {
        let name = container
            .label(labels::SERVICE)
            .map(str::to_string)
            .unwrap_or_else(|| {
                container
                    .name
                    .strip_prefix(&prefix)
                    .unwrap_or(&container.name)
                    .to_string()
            });
        if services.contains_key(name.as_str()) {
            continue;
        }

        let mut service = Mapping::new();
        service.insert("image".into(), container.image.clone().into());
        if let Some(value) = container.label(auto_update_label) {
            let mut service_labels = Mapping::new();
            service_labels.insert(auto_update_label.into(), value.into());
            service.insert("labels".into(), Value::Mapping(service_labels));
        }
        services.insert(name.into(), Value::Mapping(service));
    }

    let mut root = Mapping::new();
    root.insert("services".into(), Value::Mapping(services));
    let body = serde_yaml::to_string(&Value::Mapping(root))
        .map_err(|e| StackError::Parse(format!("failed to render reconstructed document: {}", e)))?;

    Ok(format!(
        "# Reconstructed from the running containers of project '{}'.\n\
         # Only images were recovered: review ports, volumes and environment.\n{}",
        project, body
    ))
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
    use tempfile::TempDir;

    const DOC: &str = "services:\n  web:\n    image: nginx:1.25\n";

    fn setup() -> (TempDir, Arc<MockContainerEngine>, StackIdentityManager) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(MockContainerEngine::new());
        let reconciler = Arc::new(StandardStackReconciler::new(
            engine.clone(),
            Arc::new(InMemoryStackRepository::new()),
            Arc::new(StackFilesystem::new(dir.path())),
            EventBus::new(16),
            &BerthConfig::default(),
        ));
        (dir, engine, StackIdentityManager::new(reconciler, 100))
    }

    #[tokio::test]
    async fn test_create_conflict_and_parse_errors() {
        let (_dir, _engine, identity) = setup();
        let stack = identity.create("My Media", DOC, "").await.unwrap();
        assert_eq!(stack.id.as_str(), "my-media");

        assert!(matches!(identity.create("my media", DOC, "").await, Err(StackError::Conflict(_))));
        assert!(matches!(
            identity.create("broken", "services: [", "").await,
            Err(StackError::Parse(_))
        ));
        assert!(!identity.reconciler.filesystem().exists(&StackId::new("broken").unwrap()));
        assert!(matches!(identity.create("!!!", DOC, "").await, Err(StackError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_rename_disambiguates() {
        let (_dir, _engine, identity) = setup();
        identity.create("media", DOC, "").await.unwrap();
        identity.create("tools", DOC, "").await.unwrap();

        let renamed = identity.rename(&StackId::new("tools").unwrap(), "Media").await.unwrap();
        assert_eq!(renamed.id.as_str(), "media-2");
        assert_eq!(renamed.name, "Media");

        let filesystem = identity.reconciler.filesystem();
        assert!(filesystem.exists(&renamed.id));
        assert!(!filesystem.exists(&StackId::new("tools").unwrap()));
        let repository = identity.reconciler.repository();
        assert!(repository.get_stack_by_id(&StackId::new("tools").unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_tears_down() {
        let (_dir, engine, identity) = setup();
        let stack = identity.create("media", DOC, "").await.unwrap();
        identity.reconciler.deploy(&stack.id).await.unwrap();

        identity.delete(&stack.id).await.unwrap();
        assert!(engine.containers().is_empty());
        assert!(engine.network_names().is_empty());
        assert!(matches!(identity.delete(&stack.id).await, Err(StackError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_migrate_layout() {
        let (dir, _engine, identity) = setup();
        std::fs::write(dir.path().join("Home Lab.yml"), DOC).unwrap();
        std::fs::write(dir.path().join("Home Lab.env"), "TZ=UTC\n").unwrap();
        identity.create("media", DOC, "").await.unwrap();
        std::fs::write(dir.path().join("media.yaml"), DOC).unwrap();

        let report = identity.migrate_layout().await.unwrap();
        assert_eq!(report.migrated, vec![StackId::new("home-lab").unwrap()]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "media.yaml");
        assert!(dir.path().join("home-lab").join(".env").is_file());
        assert!(!dir.path().join("Home Lab.yml").exists());
    }

    #[tokio::test]
    async fn test_discover_and_import_reconstructs() {
        let (dir, engine, identity) = setup();
        identity.create("media", DOC, "").await.unwrap();
        for (name, project, service) in [
            ("legacy_app", "legacy", "app"),
            ("legacy_db", "legacy", "db"),
            ("media_web", "media", "web"),
        ] {
            engine.seed_container(
                ContainerSpec {
                    name: name.to_string(),
                    image: format!("{}:latest", service),
                    labels: BTreeMap::from([
                        (labels::PROJECT.to_string(), project.to_string()),
                        (labels::SERVICE.to_string(), service.to_string()),
                        (labels::CONFIG_FILES.to_string(), "/nonexistent/compose.yaml".to_string()),
                    ]),
                    ..Default::default()
                },
                true,
            );
        }

        let external = identity.discover_external().await.unwrap();
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].project, "legacy");
        assert_eq!(external[0].running_count(), 2);
        assert_eq!(external[0].config_file.as_deref(), Some("/nonexistent/compose.yaml"));

        let stack = identity.import("legacy").await.unwrap();
        assert!(stack.is_external);
        assert!(stack.compose_document.starts_with("# Reconstructed"));
        let written = std::fs::read_to_string(dir.path().join("legacy").join("compose.yaml")).unwrap();
        assert!(written.contains("app:latest"));
        assert!(written.contains("db:latest"));
        assert!(identity.discover_external().await.unwrap().is_empty());
    }
}
