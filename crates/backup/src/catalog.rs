/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! On-disk archive catalog
//!
//! The catalog is a directory tree under the configured backup dir. It is
//! the only shared mutable resource in the subsystem; concurrent writers
//! stay safe because every produced filename embeds a unique timestamp.
//!
//! ```text
//! backups/
//!   passprint_*.gz + *.metadata.json      top-level archives
//!   base_backups/                         full bases for differentials
//!   differential_backups/
//!   snapshots/<slug>/                     snapshot directories
//!   emergency/                            pre-restore side-archives
//!   backup_journal.jsonl
//! ```

use crate::archive::Archive;
use crate::error::Result;
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ArchiveCatalog {
    backup_dir: PathBuf,
}

impl ArchiveCatalog {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.backup_dir
    }

    pub fn base_dir(&self) -> PathBuf {
        self.backup_dir.join("base_backups")
    }

    pub fn differential_dir(&self) -> PathBuf {
        self.backup_dir.join("differential_backups")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.backup_dir.join("snapshots")
    }

    pub fn emergency_dir(&self) -> PathBuf {
        self.backup_dir.join("emergency")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.backup_dir.join("backup_journal.jsonl")
    }

    /// Create the directory layout. Idempotent.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.backup_dir.clone(),
            self.base_dir(),
            self.differential_dir(),
            self.snapshots_dir(),
            self.emergency_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// All archives in one directory, sorted oldest first.
    ///
    /// Files without a readable sidecar are skipped with a warning; the
    /// sidecar invariant means those are either foreign files or damaged
    /// archives, and neither should silently enter the catalog.
    pub fn archives_in(&self, dir: &Path) -> Result<Vec<Archive>> {
        let mut archives = Vec::new();
        if !dir.exists() {
            return Ok(archives);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || is_sidecar(&path) || is_journal(&path) {
                continue;
            }
            match Archive::load(&path) {
                Ok(archive) => archives.push(archive),
                Err(e) => warn!(path = %path.display(), "skipping uncatalogued file: {e}"),
            }
        }
        archives.sort_by_key(|a| a.created_at);
        Ok(archives)
    }

    /// Top-level archives (full database dumps and fileset bundles).
    pub fn list_archives(&self) -> Result<Vec<Archive>> {
        self.archives_in(&self.backup_dir)
    }

    /// Newest full base archive eligible as a differential base.
    pub fn latest_base(&self) -> Result<Option<Archive>> {
        Ok(self.archives_in(&self.base_dir())?.into_iter().last())
    }

    /// Newest archive in the top-level catalog created within `max_age`.
    /// Used by the critical recovery playbook (restore newest < 24h).
    pub fn latest_archive_within(&self, max_age: Duration) -> Result<Option<Archive>> {
        let cutoff = Utc::now() - max_age;
        Ok(self
            .list_archives()?
            .into_iter()
            .filter(|a| a.created_at > cutoff)
            .last())
    }

    /// Snapshot directories with their embedded metadata timestamps.
    pub fn list_snapshots(&self) -> Result<Vec<(PathBuf, DateTime<Utc>)>> {
        let mut snapshots = Vec::new();
        let dir = self.snapshots_dir();
        if !dir.exists() {
            return Ok(snapshots);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match read_snapshot_timestamp(&path) {
                Some(created_at) => snapshots.push((path, created_at)),
                None => warn!(
                    path = %path.display(),
                    "snapshot directory has no readable metadata; leaving it alone"
                ),
            }
        }
        snapshots.sort_by_key(|(_, t)| *t);
        Ok(snapshots)
    }
}

fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().ends_with(".metadata.json"))
        .unwrap_or(false)
}

fn is_journal(path: &Path) -> bool {
    path.extension().map(|e| e == "jsonl").unwrap_or(false)
        || path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with("backup_strategy_report"))
            .unwrap_or(false)
        || path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with("recovery_report"))
            .unwrap_or(false)
}

/// Snapshots may be copied or moved without preserving mtime, so their
/// age comes from the metadata document inside the directory.
fn read_snapshot_timestamp(snapshot_dir: &Path) -> Option<DateTime<Utc>> {
    let raw = std::fs::read(snapshot_dir.join("metadata.json")).ok()?;
    let doc: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    let created_at = doc.get("created_at")?.as_str()?;
    DateTime::parse_from_rfc3339(created_at)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveKind, ArchiveScope, Compression, Engine};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write_archive(dir: &Path, name: &str, created_at: DateTime<Utc>) -> Archive {
        let path = dir.join(name);
        std::fs::write(&path, b"payload").unwrap();
        let archive = Archive {
            kind: ArchiveKind::Database,
            scope: ArchiveScope::Full,
            engine: Some(Engine::Sqlite),
            created_at,
            size_bytes: 7,
            compression: Compression::Gzip,
            path,
            extra: BTreeMap::new(),
        };
        archive.write_sidecar().unwrap();
        archive
    }

    #[test]
    fn layout_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let catalog = ArchiveCatalog::new(dir.path());
        catalog.ensure_layout().unwrap();
        catalog.ensure_layout().unwrap();
        assert!(catalog.base_dir().exists());
        assert!(catalog.emergency_dir().exists());
    }

    #[test]
    fn latest_base_returns_newest() {
        let dir = TempDir::new().unwrap();
        let catalog = ArchiveCatalog::new(dir.path());
        catalog.ensure_layout().unwrap();

        let old = Utc::now() - Duration::days(3);
        let new = Utc::now() - Duration::days(1);
        write_archive(&catalog.base_dir(), "passprint_full_a.db.gz", old);
        write_archive(&catalog.base_dir(), "passprint_full_b.db.gz", new);

        let base = catalog.latest_base().unwrap().unwrap();
        assert!(base.path.ends_with("passprint_full_b.db.gz"));
    }

    #[test]
    fn files_without_sidecars_are_skipped() {
        let dir = TempDir::new().unwrap();
        let catalog = ArchiveCatalog::new(dir.path());
        catalog.ensure_layout().unwrap();
        std::fs::write(dir.path().join("stray.tmp"), b"junk").unwrap();
        assert!(catalog.list_archives().unwrap().is_empty());
    }

    #[test]
    fn latest_within_respects_cutoff() {
        let dir = TempDir::new().unwrap();
        let catalog = ArchiveCatalog::new(dir.path());
        catalog.ensure_layout().unwrap();

        write_archive(dir.path(), "old.db.gz", Utc::now() - Duration::days(2));
        assert!(catalog
            .latest_archive_within(Duration::hours(24))
            .unwrap()
            .is_none());

        write_archive(dir.path(), "fresh.db.gz", Utc::now());
        let found = catalog
            .latest_archive_within(Duration::hours(24))
            .unwrap()
            .unwrap();
        assert!(found.path.ends_with("fresh.db.gz"));
    }
}
