// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::domain::stack::StackId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StackEvent {
    StackDeployed {
        stack_id: StackId,
        service_count: usize,
        deployed_at: DateTime<Utc>,
    },
    StackDeployFailed {
        stack_id: StackId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    StackStopped {
        stack_id: StackId,
        removed_containers: usize,
        stopped_at: DateTime<Utc>,
    },
    StackRenamed {
        old_id: StackId,
        new_id: StackId,
        renamed_at: DateTime<Utc>,
    },
    StackImported {
        stack_id: StackId,
        reconstructed: bool,
        imported_at: DateTime<Utc>,
    },
    StackDeleted {
        stack_id: StackId,
        deleted_at: DateTime<Utc>,
    },
    ContainerRecreated {
        container_name: String,
        old_container_id: String,
        new_container_id: String,
        recreated_at: DateTime<Utc>,
    },
}

impl StackEvent {
    /// Stack the event belongs to, if any.
    pub fn stack_id(&self) -> Option<&StackId> {
        match self {
            StackEvent::StackDeployed { stack_id, .. }
            | StackEvent::StackDeployFailed { stack_id, .. }
            | StackEvent::StackStopped { stack_id, .. }
            | StackEvent::StackImported { stack_id, .. }
            | StackEvent::StackDeleted { stack_id, .. } => Some(stack_id),
            StackEvent::StackRenamed { new_id, .. } => Some(new_id),
            StackEvent::ContainerRecreated { .. } => None,
        }
    }
}

/// Entity an auto-update acted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateTarget {
    Container { id: String, name: String },
    Stack { id: StackId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AutoUpdateEvent {
    ImageChecked {
        target: UpdateTarget,
        reference: String,
        changed: bool,
        checked_at: DateTime<Utc>,
    },
    ContainerUpdated {
        target: UpdateTarget,
        new_container_id: String,
        updated_at: DateTime<Utc>,
    },
    StackUpdated {
        target: UpdateTarget,
        changed_images: Vec<String>,
        updated_at: DateTime<Utc>,
    },
    UpdateFailed {
        target: UpdateTarget,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}
