// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod network;
pub mod lifecycle;
pub mod reconciler;
pub mod identity;
pub mod auto_update;
pub mod maturity;

// Re-export services for convenience
pub use network::NetworkProvisioner;
pub use lifecycle::{ContainerLifecycleManager, PlannedContainer, StackContext};
pub use reconciler::{StackReconciler, StandardStackReconciler};
pub use identity::{ExternalStack, MigrationReport, StackIdentityManager};
pub use auto_update::{AutoUpdateOrchestrator, InProgressRegistry, TickReport};
pub use maturity::MaturityService;
