/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Embedded-engine (SQLite) backup driver
//!
//! Full backups stream the database file through gzip in-process; no
//! external dump tool is needed for the data path. Schema-only captures
//! shell out to the sqlite3 CLI. The engine has no restorable change
//! stream, so differential requests are rejected up front.

use crate::archive::{Archive, ArchiveKind, ArchiveScope, Compression, Engine};
use crate::compression::{gunzip_file, gzip_bytes, gzip_file};
use crate::driver::{RestoreTarget, StorageBackupDriver};
use crate::error::{BackupError, Result};
use crate::pipeline::{run_command, Stage};
use crate::verify::sqlite_integrity_report;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SqliteDriver {
    db_path: PathBuf,
    emergency_dir: PathBuf,
    compression_level: u32,
    timeout: Duration,
}

impl SqliteDriver {
    pub fn new(
        db_path: impl Into<PathBuf>,
        emergency_dir: impl Into<PathBuf>,
        compression_level: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            db_path: db_path.into(),
            emergency_dir: emergency_dir.into(),
            compression_level,
            timeout,
        }
    }

    /// Consistency gate before any capture. A database that fails its own
    /// integrity check must never be archived.
    async fn integrity_gate(&self) -> Result<()> {
        if !self.db_path.exists() {
            return Err(BackupError::config(format!(
                "sqlite database not found: {}",
                self.db_path.display()
            )));
        }
        let report = sqlite_integrity_report(&self.db_path, self.timeout).await?;
        if report.trim() != "ok" {
            return Err(BackupError::SourceIntegrity(format!(
                "sqlite integrity_check reported: {}",
                report.trim()
            )));
        }
        Ok(())
    }

    async fn full_backup(&self, dest_dir: &Path) -> Result<Archive> {
        self.integrity_gate().await?;

        let created_at = Utc::now();
        let slug = Archive::timestamp_slug(created_at);
        let out_path = dest_dir.join(format!("passprint_full_{slug}.db.gz"));

        let src = self.db_path.clone();
        let dst = out_path.clone();
        let level = self.compression_level;
        let size_bytes =
            tokio::task::spawn_blocking(move || gzip_file(&src, &dst, level))
                .await
                .map_err(|e| BackupError::ArchiveIntegrity(format!("compression task failed: {e}")))??;

        if size_bytes == 0 {
            let _ = std::fs::remove_file(&out_path);
            return Err(BackupError::TruncatedOutput { path: out_path });
        }

        let mut extra = BTreeMap::new();
        extra.insert(
            "checksum_sha256".to_string(),
            json!(Archive::checksum(&out_path)?),
        );
        extra.insert(
            "source_size_bytes".to_string(),
            json!(std::fs::metadata(&self.db_path)?.len()),
        );

        let archive = Archive {
            kind: ArchiveKind::Database,
            scope: ArchiveScope::Full,
            engine: Some(Engine::Sqlite),
            created_at,
            size_bytes,
            compression: Compression::Gzip,
            path: out_path,
            extra,
        };
        archive.write_sidecar()?;
        info!(path = %archive.path.display(), size_bytes, "sqlite full backup complete");
        Ok(archive)
    }

    async fn schema_backup(&self, dest_dir: &Path) -> Result<Archive> {
        self.integrity_gate().await?;

        let created_at = Utc::now();
        let slug = Archive::timestamp_slug(created_at);
        let out_path = dest_dir.join(format!("passprint_schema_{slug}.sql.gz"));

        let stage = Stage::new("sqlite3")
            .arg(self.db_path.to_string_lossy().into_owned())
            .arg(".schema");
        let output = run_command(&stage, self.timeout).await?;
        if output.stdout.trim().is_empty() {
            return Err(BackupError::TruncatedOutput { path: out_path });
        }

        let size_bytes = gzip_bytes(output.stdout.as_bytes(), &out_path, self.compression_level)?;

        let mut extra = BTreeMap::new();
        extra.insert(
            "checksum_sha256".to_string(),
            json!(Archive::checksum(&out_path)?),
        );

        let archive = Archive {
            kind: ArchiveKind::Database,
            scope: ArchiveScope::SchemaOnly,
            engine: Some(Engine::Sqlite),
            created_at,
            size_bytes,
            compression: Compression::Gzip,
            path: out_path,
            extra,
        };
        archive.write_sidecar()?;
        info!(path = %archive.path.display(), "sqlite schema backup complete");
        Ok(archive)
    }

    /// Archive the live file before it is overwritten. Restore proceeds
    /// even if this side-archive fails, but the failure is logged.
    fn emergency_side_archive(&self) -> Option<PathBuf> {
        if !self.db_path.exists() {
            return None;
        }
        let slug = Archive::timestamp_slug(Utc::now());
        let side = self.emergency_dir.join(format!("pre_restore_{slug}.db.gz"));
        if let Err(e) = std::fs::create_dir_all(&self.emergency_dir) {
            warn!("could not create emergency dir: {e}");
            return None;
        }
        match gzip_file(&self.db_path, &side, self.compression_level) {
            Ok(_) => {
                info!(path = %side.display(), "emergency side-archive written");
                Some(side)
            }
            Err(e) => {
                warn!("emergency side-archive failed: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl StorageBackupDriver for SqliteDriver {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    async fn backup(&self, scope: ArchiveScope, dest_dir: &Path) -> Result<Archive> {
        match scope {
            ArchiveScope::Full => self.full_backup(dest_dir).await,
            ArchiveScope::SchemaOnly => self.schema_backup(dest_dir).await,
            ArchiveScope::Differential => Err(BackupError::config(
                "sqlite has no restorable change stream; run a full backup",
            )),
        }
    }

    async fn differential_backup(&self, _base: &Archive, _dest_dir: &Path) -> Result<Archive> {
        Err(BackupError::config(
            "sqlite has no restorable change stream; run a full backup",
        ))
    }

    async fn restore(&self, archive: &Archive, target: &RestoreTarget) -> Result<()> {
        if archive.engine != Some(Engine::Sqlite) {
            return Err(BackupError::config(format!(
                "archive engine tag {:?} does not match sqlite driver",
                archive.engine
            )));
        }
        let target_path = match target {
            RestoreTarget::File(path) => path.clone(),
            RestoreTarget::LiveDatabase => self.db_path.clone(),
        };

        self.emergency_side_archive();

        // Expand next to the target, then swap in atomically.
        let staging = target_path.with_extension("restore.tmp");
        let result: Result<()> = (|| {
            match archive.compression {
                Compression::Gzip => {
                    gunzip_file(&archive.path, &staging)?;
                }
                Compression::None => {
                    std::fs::copy(&archive.path, &staging)?;
                }
            }
            if std::fs::metadata(&staging)?.len() == 0 {
                return Err(BackupError::TruncatedOutput {
                    path: staging.clone(),
                });
            }
            std::fs::rename(&staging, &target_path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&staging);
        }
        result?;

        // The restored file must itself pass the engine's check.
        let report = sqlite_integrity_report(&target_path, self.timeout).await?;
        if report.trim() != "ok" {
            return Err(BackupError::ArchiveIntegrity(format!(
                "restored database failed integrity check: {}",
                report.trim()
            )));
        }
        info!(path = %target_path.display(), "sqlite restore complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn driver(dir: &Path, db: &Path) -> SqliteDriver {
        SqliteDriver::new(db, dir.join("emergency"), 6, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn missing_database_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let d = driver(dir.path(), &dir.path().join("absent.db"));
        match d.backup(ArchiveScope::Full, dir.path()).await {
            Err(BackupError::Configuration(_)) => {}
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn differential_is_rejected() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("app.db");
        std::fs::write(&db, b"not used").unwrap();
        let d = driver(dir.path(), &db);
        match d.backup(ArchiveScope::Differential, dir.path()).await {
            Err(BackupError::Configuration(_)) => {}
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn restore_rejects_foreign_engine_tag() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("app.db");
        let d = driver(dir.path(), &db);
        let archive = Archive {
            kind: ArchiveKind::Database,
            scope: ArchiveScope::Full,
            engine: Some(Engine::Postgres),
            created_at: Utc::now(),
            size_bytes: 1,
            compression: Compression::Gzip,
            path: dir.path().join("pg.dump.gz"),
            extra: BTreeMap::new(),
        };
        match d.restore(&archive, &RestoreTarget::LiveDatabase).await {
            Err(BackupError::Configuration(_)) => {}
            other => panic!("expected Configuration, got {other:?}"),
        }
    }

    // Full-cycle tests with a real database require the sqlite3 CLI.
    #[tokio::test]
    async fn full_backup_and_restore_round_trip() {
        if !sqlite3_available().await {
            return;
        }
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("app.db");
        seed_database(&db).await;

        let d = driver(dir.path(), &db);
        let archive = d.backup(ArchiveScope::Full, dir.path()).await.unwrap();
        assert!(archive.size_bytes > 0);
        assert!(Archive::sidecar_path(&archive.path).exists());

        let restored = dir.path().join("restored.db");
        d.restore(&archive, &RestoreTarget::File(restored.clone()))
            .await
            .unwrap();
        assert!(std::fs::metadata(&restored).unwrap().len() > 0);
    }

    async fn sqlite3_available() -> bool {
        run_command(&Stage::new("sqlite3").arg("--version"), Duration::from_secs(5))
            .await
            .is_ok()
    }

    async fn seed_database(db: &Path) {
        let stage = Stage::new("sqlite3")
            .arg(db.to_string_lossy().into_owned())
            .arg("CREATE TABLE prints(id INTEGER PRIMARY KEY, label TEXT); INSERT INTO prints(label) VALUES ('a'), ('b');");
        run_command(&stage, Duration::from_secs(5)).await.unwrap();
    }
}
