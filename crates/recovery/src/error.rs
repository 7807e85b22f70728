/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Error types for disaster detection and recovery

use std::path::PathBuf;
use thiserror::Error;

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;

#[derive(Error, Debug)]
pub enum RecoveryError {
    /// Invalid or missing recovery configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A remediation command failed. Recorded in the report; later
    /// independent actions still run.
    #[error("Recovery action failed: {action}: {reason}")]
    ActionFailed { action: String, reason: String },

    /// A recovery report could not be persisted for audit.
    #[error("Report persistence failed: {path}: {reason}")]
    ReportPersistence { path: PathBuf, reason: String },

    #[error(transparent)]
    Backup(#[from] backup::BackupError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] common::CommonError),
}

impl RecoveryError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
