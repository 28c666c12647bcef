// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Stack Aggregate
//!
//! A stack is one compose document plus its `.env` overlay, deployed as a
//! unit. The on-disk directory name doubles as the stack id.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Stack identity, runtime status and the engine error taxonomy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::engine::EngineError;
use crate::domain::repository::RepositoryError;

/// Stable stack identifier (slug, also the directory name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(String);

impl StackId {
    /// Accepts an existing slug. Use [`slugify`] to derive one from a display name.
    pub fn new(id: impl Into<String>) -> Result<Self, StackError> {
        let id = id.into();
        if !is_valid_slug(&id) {
            return Err(StackError::InvalidName(format!(
                "'{}' is not a valid stack id (lowercase letters, digits, '-' and '_' only)",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name prefix shared by every container derived for this stack.
    pub fn container_prefix(&self) -> String {
        format!("{}_", self.0)
    }

    /// `{stackId}_{service}` or `{stackId}_{service}_{n}` for replicas.
    pub fn container_name(&self, service: &str, replica: Option<u32>) -> String {
        match replica {
            Some(n) => format!("{}_{}_{}", self.0, service, n),
            None => format!("{}_{}", self.0, service),
        }
    }

    /// `{stackId}_{key}` for an engine-managed network.
    pub fn network_name(&self, key: &str) -> String {
        format!("{}_{}", self.0, key)
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid_slug(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Derive a slug from a human display name.
///
/// Lowercases, maps every run of characters outside `[a-z0-9_]` to a single
/// `-`, and trims separators from both ends. Returns `None` when nothing
/// usable remains.
pub fn slugify(name: &str) -> Option<StackId> {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    let slug = slug.trim_matches(|c| c == '-' || c == '_').to_string();
    StackId::new(slug).ok()
}

/// Aggregate run status. A pure function of the two counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    Running,
    Stopped,
    PartiallyRunning,
    Unknown,
}

impl StackStatus {
    /// `running` iff all expected containers run, `partially running` iff
    /// some do, `stopped` iff none do, `unknown` when nothing is expected.
    /// More running containers than expected still counts as `running`.
    pub fn from_counts(service_count: usize, running_count: usize) -> Self {
        if service_count == 0 {
            StackStatus::Unknown
        } else if running_count == 0 {
            StackStatus::Stopped
        } else if running_count < service_count {
            StackStatus::PartiallyRunning
        } else {
            StackStatus::Running
        }
    }

    /// Running or partially running.
    pub fn is_active(&self) -> bool {
        matches!(self, StackStatus::Running | StackStatus::PartiallyRunning)
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackStatus::Running => "running",
            StackStatus::Stopped => "stopped",
            StackStatus::PartiallyRunning => "partially running",
            StackStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Persisted stack metadata. The compose document on disk remains the
/// source of truth; `compose_document` here is a cached copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    pub id: StackId,
    pub name: String,
    pub compose_document: String,
    #[serde(default)]
    pub env_overlay: String,
    #[serde(default)]
    pub service_count: usize,
    #[serde(default)]
    pub running_count: usize,
    pub status: StackStatus,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub auto_update_enabled: bool,
    #[serde(default)]
    pub last_reconciled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Stack {
    pub fn new(
        id: StackId,
        name: impl Into<String>,
        compose_document: impl Into<String>,
        env_overlay: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            compose_document: compose_document.into(),
            env_overlay: env_overlay.into(),
            service_count: 0,
            running_count: 0,
            status: StackStatus::Unknown,
            is_external: false,
            auto_update_enabled: false,
            last_reconciled_at: None,
            last_polled_at: None,
            created_at: Utc::now(),
        }
    }

    /// Apply freshly observed counts; status is always derived, never set.
    pub fn apply_runtime(&mut self, info: &RuntimeInfo) {
        self.service_count = info.service_count;
        self.running_count = info.running_count;
        self.status = info.status;
        self.last_polled_at = Some(info.last_polled);
        if let Some(at) = info.reconciled_at {
            self.last_reconciled_at = Some(at);
        }
    }
}

/// Runtime snapshot written back through the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub status: StackStatus,
    pub service_count: usize,
    pub running_count: usize,
    pub last_polled: DateTime<Utc>,
    /// Set only by a successful deploy.
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl RuntimeInfo {
    pub fn observed(service_count: usize, running_count: usize) -> Self {
        Self {
            status: StackStatus::from_counts(service_count, running_count),
            service_count,
            running_count,
            last_polled: Utc::now(),
            reconciled_at: None,
        }
    }

    pub fn reconciled(service_count: usize, running_count: usize) -> Self {
        let now = Utc::now();
        Self {
            reconciled_at: Some(now),
            last_polled: now,
            ..Self::observed(service_count, running_count)
        }
    }
}

/// Errors surfaced by the stack engine.
#[derive(Debug, Error)]
pub enum StackError {
    /// Malformed compose document. No engine call was made.
    #[error("Failed to parse compose document: {0}")]
    Parse(String),

    /// Network or container creation failed against the engine.
    #[error("Provisioning failed for stack '{stack}': {reason}")]
    Provisioning { stack: String, reason: String },

    /// Name already in use for an explicit create-new operation.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The original container is gone and its replacement is not running.
    /// Never retried automatically.
    #[error(
        "Container '{original_name}' ({original_id}) was removed but its replacement failed: {reason}. \
         Manual recovery required."
    )]
    PartialFailure {
        original_id: String,
        original_name: String,
        reason: String,
    },

    #[error("Stack '{0}' is running; stop it before retrying")]
    StackRunning(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StackError {
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        StackError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn provisioning(stack: &StackId, reason: impl fmt::Display) -> Self {
        StackError::Provisioning {
            stack: stack.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_status_table() {
        assert_eq!(StackStatus::from_counts(0, 0), StackStatus::Unknown);
        assert_eq!(StackStatus::from_counts(2, 0), StackStatus::Stopped);
        assert_eq!(StackStatus::from_counts(2, 1), StackStatus::PartiallyRunning);
        assert_eq!(StackStatus::from_counts(2, 2), StackStatus::Running);
    }

    proptest! {
        #[test]
        fn prop_status_is_function_of_counts(service in 0usize..10_000, running in 0usize..10_000) {
            let status = StackStatus::from_counts(service, running);
            if service == 0 {
                prop_assert_eq!(status, StackStatus::Unknown);
            } else if running == 0 {
                prop_assert_eq!(status, StackStatus::Stopped);
            } else if running < service {
                prop_assert_eq!(status, StackStatus::PartiallyRunning);
            } else {
                prop_assert_eq!(status, StackStatus::Running);
            }
            prop_assert_eq!(status, StackStatus::from_counts(service, running));
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Media Stack").unwrap().as_str(), "my-media-stack");
        assert_eq!(slugify("  --Plex!!  ").unwrap().as_str(), "plex");
        assert_eq!(slugify("home_assistant 2").unwrap().as_str(), "home_assistant-2");
        assert!(slugify("!!!").is_none());
    }

    #[test]
    fn test_stack_id_validation() {
        assert!(StackId::new("web").is_ok());
        assert!(StackId::new("web-2_x").is_ok());
        assert!(StackId::new("Web").is_err());
        assert!(StackId::new("-web").is_err());
        assert!(StackId::new("").is_err());
        assert!(StackId::new("../etc").is_err());
    }

    #[test]
    fn test_derived_names() {
        let id = StackId::new("media").unwrap();
        assert_eq!(id.container_name("web", None), "media_web");
        assert_eq!(id.container_name("web", Some(2)), "media_web_2");
        assert_eq!(id.network_name("default"), "media_default");
        assert_eq!(id.container_prefix(), "media_");
    }
}
