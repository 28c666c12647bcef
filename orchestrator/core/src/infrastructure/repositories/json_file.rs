// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::repository::{RepositoryError, StackRepository};
use crate::domain::stack::{RuntimeInfo, Stack, StackId};

/// Directory under the stacks root holding engine metadata.
pub const METADATA_DIR: &str = ".berth";
const STORE_FILE: &str = "stacks.json";

/// Stack metadata persisted as one JSON document.
///
/// The whole map is held in memory and rewritten on every mutation through
/// a temp file and rename, so a crash never leaves a half-written store.
pub struct JsonFileStackRepository {
    path: PathBuf,
    stacks: Mutex<BTreeMap<StackId, Stack>>,
}

impl JsonFileStackRepository {
    /// Open (or start) the store under `stacks_root`.
    pub async fn open(stacks_root: &Path) -> Result<Self, RepositoryError> {
        let path = stacks_root.join(METADATA_DIR).join(STORE_FILE);
        let stacks = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => {
                let list: Vec<Stack> = serde_json::from_str(&text)?;
                list.into_iter().map(|s| (s.id.clone(), s)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Opened stack store {:?} with {} entries", path, stacks.len());
        Ok(Self {
            path,
            stacks: Mutex::new(stacks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, stacks: &BTreeMap<StackId, Stack>) -> Result<(), RepositoryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let list: Vec<&Stack> = stacks.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StackRepository for JsonFileStackRepository {
    async fn get_stack_by_id(&self, id: &StackId) -> Result<Option<Stack>, RepositoryError> {
        Ok(self.stacks.lock().await.get(id).cloned())
    }

    async fn save_stack(&self, stack: &Stack) -> Result<(), RepositoryError> {
        let mut stacks = self.stacks.lock().await;
        stacks.insert(stack.id.clone(), stack.clone());
        self.persist(&stacks).await
    }

    async fn update_runtime_info(&self, id: &StackId, info: &RuntimeInfo) -> Result<(), RepositoryError> {
        let mut stacks = self.stacks.lock().await;
        stacks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?
            .apply_runtime(info);
        self.persist(&stacks).await
    }

    async fn update_content(&self, id: &StackId, compose_document: &str, env_overlay: &str) -> Result<(), RepositoryError> {
        let mut stacks = self.stacks.lock().await;
        let stack = stacks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        stack.compose_document = compose_document.to_string();
        stack.env_overlay = env_overlay.to_string();
        self.persist(&stacks).await
    }

    async fn delete_stack(&self, id: &StackId) -> Result<(), RepositoryError> {
        let mut stacks = self.stacks.lock().await;
        if stacks.remove(id).is_some() {
            self.persist(&stacks).await?;
        }
        Ok(())
    }

    async fn list_by_auto_update_flag(&self, enabled: bool) -> Result<Vec<Stack>, RepositoryError> {
        Ok(self
            .stacks
            .lock()
            .await
            .values()
            .filter(|s| s.auto_update_enabled == enabled)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Stack>, RepositoryError> {
        Ok(self.stacks.lock().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stack::StackStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = StackId::new("media").unwrap();
        {
            let repo = JsonFileStackRepository::open(dir.path()).await.unwrap();
            let mut stack = Stack::new(id.clone(), "Media", "services: {}", "TZ=UTC\n");
            stack.auto_update_enabled = true;
            repo.save_stack(&stack).await.unwrap();
            repo.update_runtime_info(&id, &RuntimeInfo::reconciled(2, 2)).await.unwrap();
        }

        let repo = JsonFileStackRepository::open(dir.path()).await.unwrap();
        assert!(repo.path().ends_with(".berth/stacks.json"));
        let stored = repo.get_stack_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Media");
        assert_eq!(stored.env_overlay, "TZ=UTC\n");
        assert_eq!(stored.status, StackStatus::Running);
        assert!(stored.last_reconciled_at.is_some());
        assert_eq!(repo.list_by_auto_update_flag(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_missing_update() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileStackRepository::open(dir.path()).await.unwrap();
        let id = StackId::new("web").unwrap();
        repo.save_stack(&Stack::new(id.clone(), "web", "", "")).await.unwrap();
        repo.delete_stack(&id).await.unwrap();
        assert!(repo.list_all().await.unwrap().is_empty());
        assert!(matches!(
            repo.update_content(&id, "x", "").await,
            Err(RepositoryError::NotFound(_))
        ));
    }
}
