// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0
//! Berth Core
//!
//! Stack orchestration engine: turns compose documents on disk into running
//! containers and networks, keeps them reconciled, and replaces containers
//! whose images moved.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, application services and engine adapters

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
