// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

//! Image maturity verdicts.
//!
//! Supplied by an external registry collaborator and shown for information
//! only; the auto-update decision compares image ids after a pull instead.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaturityStatus {
    Matured,
    NotMatured,
    Unknown,
}

impl fmt::Display for MaturityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MaturityStatus::Matured => "Matured",
            MaturityStatus::NotMatured => "Not Matured",
            MaturityStatus::Unknown => "Unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaturityRecord {
    pub current_version: Option<String>,
    pub latest_version: Option<String>,
    pub updates_available: bool,
    pub status: MaturityStatus,
    pub last_checked: DateTime<Utc>,
}

impl MaturityRecord {
    pub fn unknown() -> Self {
        Self {
            current_version: None,
            latest_version: None,
            updates_available: false,
            status: MaturityStatus::Unknown,
            last_checked: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MaturityError {
    #[error("Registry lookup failed for {image}: {reason}")]
    Lookup { image: String, reason: String },
}

#[async_trait]
pub trait ImageMaturityChecker: Send + Sync {
    async fn check_maturity(&self, image: &str) -> Result<MaturityRecord, MaturityError>;
}

/// Checker used when no registry collaborator is configured.
pub struct UnknownMaturityChecker;

#[async_trait]
impl ImageMaturityChecker for UnknownMaturityChecker {
    async fn check_maturity(&self, _image: &str) -> Result<MaturityRecord, MaturityError> {
        Ok(MaturityRecord::unknown())
    }
}
