// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Stack aggregate, parsed compose model, and the ports the engine consumes
//! (container engine, persistence, image maturity).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types, traits and errors shared by every other layer

pub mod stack;
pub mod compose;
pub mod engine;
pub mod repository;
pub mod maturity;
pub mod events;
pub mod config;
