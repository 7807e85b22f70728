/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Append-only backup journal
//!
//! Every orchestration attempt leaves exactly one record here, success or
//! failure. The journal is a JSON-lines file in the catalog directory so
//! the status dashboard can tail it without a database round trip.
//! Entries are never mutated; they age out under the audit retention
//! policy, which is independent of archive retention.

use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Outcome recorded for one orchestration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalStatus {
    Success,
    Failed,
    Partial,
}

/// One persisted orchestration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupLogEntry {
    /// Operation name, e.g. `database_backup`, `files_backup`, `restore`.
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub status: JournalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl BackupLogEntry {
    pub fn success(
        operation: impl Into<String>,
        archive_path: Option<PathBuf>,
        size_bytes: u64,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            operation: operation.into(),
            archive_path,
            size_bytes,
            status: JournalStatus::Success,
            error: None,
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        operation: impl Into<String>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            operation: operation.into(),
            archive_path: None,
            size_bytes: 0,
            status: JournalStatus::Failed,
            error: Some(error.into()),
            started_at,
            completed_at: Utc::now(),
        }
    }
}

/// Journal over one JSON-lines file.
#[derive(Debug, Clone)]
pub struct BackupJournal {
    path: PathBuf,
}

impl BackupJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Records are written whole-line so concurrent
    /// readers never observe a torn entry.
    pub fn append(&self, entry: &BackupLogEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// All entries, oldest first. Unparseable lines are skipped.
    pub fn entries(&self) -> Result<Vec<BackupLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Drop entries older than the audit retention window. Returns the
    /// number of entries removed.
    pub fn prune(&self, audit_retention_days: u32) -> Result<usize> {
        let entries = self.entries()?;
        let cutoff = Utc::now() - Duration::days(audit_retention_days as i64);
        let kept: Vec<&BackupLogEntry> =
            entries.iter().filter(|e| e.completed_at >= cutoff).collect();
        let removed = entries.len() - kept.len();
        if removed > 0 {
            let mut out = String::new();
            for entry in &kept {
                out.push_str(&serde_json::to_string(entry)?);
                out.push('\n');
            }
            std::fs::write(&self.path, out)?;
            info!(removed, "pruned backup journal");
        }
        Ok(removed)
    }
}
