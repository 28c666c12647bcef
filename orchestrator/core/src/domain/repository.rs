// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contract for the `Stack` aggregate. The filesystem stays the
//! source of truth for compose documents; the repository holds metadata and
//! a cached copy of the document.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `StackRepository` | `Stack` | `InMemoryStackRepository`, `JsonFileStackRepository` |

use async_trait::async_trait;
use crate::domain::stack::{RuntimeInfo, Stack, StackId};

/// Repository interface for Stack aggregates
#[async_trait]
pub trait StackRepository: Send + Sync {
    /// Find stack by ID
    async fn get_stack_by_id(&self, id: &StackId) -> Result<Option<Stack>, RepositoryError>;

    /// Save stack (create or update)
    async fn save_stack(&self, stack: &Stack) -> Result<(), RepositoryError>;

    /// Write back observed runtime counts
    async fn update_runtime_info(&self, id: &StackId, info: &RuntimeInfo) -> Result<(), RepositoryError>;

    /// Replace the cached compose document and env overlay
    async fn update_content(&self, id: &StackId, compose_document: &str, env_overlay: &str) -> Result<(), RepositoryError>;

    /// Delete stack by ID
    async fn delete_stack(&self, id: &StackId) -> Result<(), RepositoryError>;

    /// Stacks whose cached auto-update flag matches
    async fn list_by_auto_update_flag(&self, enabled: bool) -> Result<Vec<Stack>, RepositoryError>;

    /// List all stacks, ordered by id
    async fn list_all(&self) -> Result<Vec<Stack>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RepositoryError {
    fn from(err: std::io::Error) -> Self {
        RepositoryError::Storage(err.to_string())
    }
}
