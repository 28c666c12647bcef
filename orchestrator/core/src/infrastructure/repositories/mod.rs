// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the `StackRepository` port.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve stack metadata
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **JsonFileStackRepository** - single JSON document under the stacks
//!   root (`.berth/stacks.json`), rewritten atomically on every change
//! - **InMemoryStackRepository** - HashMap-backed storage for tests and
//!   throwaway sessions

pub mod json_file;

pub use json_file::JsonFileStackRepository;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::repository::{RepositoryError, StackRepository};
use crate::domain::stack::{RuntimeInfo, Stack, StackId};

#[derive(Clone, Default)]
pub struct InMemoryStackRepository {
    stacks: Arc<RwLock<HashMap<StackId, Stack>>>,
}

impl InMemoryStackRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StackRepository for InMemoryStackRepository {
    async fn get_stack_by_id(&self, id: &StackId) -> Result<Option<Stack>, RepositoryError> {
        Ok(self.stacks.read().get(id).cloned())
    }

    async fn save_stack(&self, stack: &Stack) -> Result<(), RepositoryError> {
        self.stacks.write().insert(stack.id.clone(), stack.clone());
        Ok(())
    }

    async fn update_runtime_info(&self, id: &StackId, info: &RuntimeInfo) -> Result<(), RepositoryError> {
        let mut stacks = self.stacks.write();
        let stack = stacks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        stack.apply_runtime(info);
        Ok(())
    }

    async fn update_content(&self, id: &StackId, compose_document: &str, env_overlay: &str) -> Result<(), RepositoryError> {
        let mut stacks = self.stacks.write();
        let stack = stacks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        stack.compose_document = compose_document.to_string();
        stack.env_overlay = env_overlay.to_string();
        Ok(())
    }

    async fn delete_stack(&self, id: &StackId) -> Result<(), RepositoryError> {
        self.stacks.write().remove(id);
        Ok(())
    }

    async fn list_by_auto_update_flag(&self, enabled: bool) -> Result<Vec<Stack>, RepositoryError> {
        let mut stacks: Vec<Stack> = self
            .stacks
            .read()
            .values()
            .filter(|s| s.auto_update_enabled == enabled)
            .cloned()
            .collect();
        stacks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stacks)
    }

    async fn list_all(&self) -> Result<Vec<Stack>, RepositoryError> {
        let mut stacks: Vec<Stack> = self.stacks.read().values().cloned().collect();
        stacks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stack::StackStatus;

    fn stack(id: &str) -> Stack {
        Stack::new(StackId::new(id).unwrap(), id, "services: {}", "")
    }

    #[tokio::test]
    async fn test_save_and_list_sorted() {
        let repo = InMemoryStackRepository::new();
        repo.save_stack(&stack("web")).await.unwrap();
        repo.save_stack(&stack("db")).await.unwrap();

        let ids: Vec<String> = repo
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["db", "web"]);
    }

    #[tokio::test]
    async fn test_update_runtime_info_derives_status() {
        let repo = InMemoryStackRepository::new();
        let id = StackId::new("web").unwrap();
        repo.save_stack(&stack("web")).await.unwrap();

        repo.update_runtime_info(&id, &RuntimeInfo::observed(3, 1)).await.unwrap();
        let stored = repo.get_stack_by_id(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, StackStatus::PartiallyRunning);
        assert_eq!(stored.running_count, 1);
        assert!(stored.last_reconciled_at.is_none());

        let missing = StackId::new("nope").unwrap();
        assert!(matches!(
            repo.update_runtime_info(&missing, &RuntimeInfo::observed(1, 1)).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_by_auto_update_flag() {
        let repo = InMemoryStackRepository::new();
        let mut opted_in = stack("watched");
        opted_in.auto_update_enabled = true;
        repo.save_stack(&opted_in).await.unwrap();
        repo.save_stack(&stack("plain")).await.unwrap();

        let found = repo.list_by_auto_update_flag(true).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "watched");
    }
}
