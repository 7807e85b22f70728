/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Error types for backup, restore and PITR operations
//!
//! Expected business failures (no base backup, broken chain) are ordinary
//! variants the caller can match on; they are never signalled by panicking.

use crate::pitr::PitrStep;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Bad connection string, unsupported engine, mismatched engine tag.
    /// Raised before any external process is spawned.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The source database failed its consistency check before capture.
    /// No partial archive is produced.
    #[error("Source integrity check failed: {0}")]
    SourceIntegrity(String),

    /// An external tool exited non-zero; stderr is surfaced verbatim.
    #[error("External process failed: {command}: {stderr}")]
    ExternalProcess { command: String, stderr: String },

    /// An external invocation exceeded its configured timeout.
    #[error("External process timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    /// The pipeline exited cleanly but produced a missing or zero-byte
    /// output file. Defends against truncated writes.
    #[error("Backup output file is empty or missing: {path}")]
    TruncatedOutput { path: PathBuf },

    /// A produced or stored archive failed verification.
    #[error("Archive integrity error: {0}")]
    ArchiveIntegrity(String),

    /// A differential archive's base is missing or corrupt. The caller
    /// must run a full backup instead; this is never silently substituted.
    #[error("Differential chain broken: {0}")]
    ChainBroken(String),

    /// A differential backup was requested but no full base archive exists.
    #[error("No base backup found for differential")]
    NoBaseBackup,

    /// PITR left the engine in a partial replay state. Requires manual
    /// intervention; never retried automatically.
    #[error("PITR fatal at step {step:?}: {message}")]
    PitrFatal { step: PitrStep, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] common::CommonError),
}

impl BackupError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether the failure denotes a partially-mutated system that an
    /// operator must inspect before anything else runs.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::PitrFatal { .. })
    }
}
