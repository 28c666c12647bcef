// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the berth CLI

pub mod config;
pub mod container;
pub mod stack;
pub mod update;

pub use self::config::ConfigCommand;
pub use self::container::ContainerCommand;
pub use self::stack::StackCommand;
pub use self::update::UpdateCommand;

use colored::{ColoredString, Colorize};

use berth_core::domain::stack::StackStatus;

pub(crate) fn status_colored(status: StackStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        StackStatus::Running => text.green(),
        StackStatus::PartiallyRunning => text.yellow(),
        StackStatus::Stopped => text.red(),
        StackStatus::Unknown => text.dimmed(),
    }
}
