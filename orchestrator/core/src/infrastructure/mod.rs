// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod compose_parser;
pub mod docker;
pub mod event_bus;
pub mod filesystem;
pub mod mock_engine;
pub mod repositories;
pub mod runtime_cache;

pub use compose_parser::{ComposeParser, EnvironmentOverlay};
pub use docker::DockerEngine;
pub use event_bus::EventBus;
pub use filesystem::StackFilesystem;
pub use mock_engine::MockContainerEngine;
