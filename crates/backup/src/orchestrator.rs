/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Backup orchestration
//!
//! Ties the drivers, catalog, journal, verifier, retention and
//! notification channels together behind the public operations: full
//! backup, differential backup, snapshot, restore and prune. A full
//! backup keeps going when one component fails; the run is recorded as
//! partial, every component leaves its own journal entry, and exactly
//! one notification goes out at the end.

use crate::archive::{Archive, ArchiveKind, ArchiveScope, Engine};
use crate::catalog::ArchiveCatalog;
use crate::driver::{RestoreTarget, StorageBackupDriver};
use crate::error::{BackupError, Result};
use crate::fileset::FilesetArchiver;
use crate::journal::{BackupJournal, BackupLogEntry, JournalStatus};
use crate::retention::{PruneOutcome, RetentionManager};
use crate::verify::IntegrityVerifier;
use chrono::Utc;
use common::{BackupConfig, Notification, NotifierSet, RetentionPolicy};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Result of one full-backup run.
#[derive(Debug)]
pub struct FullBackupOutcome {
    pub database: Option<Archive>,
    pub files: Option<Archive>,
    pub snapshot_dir: Option<PathBuf>,
    pub status: JournalStatus,
    pub errors: Vec<String>,
}

/// What one prune run removed across the catalog and the journal.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupOutcome {
    pub archives_removed: usize,
    pub snapshots_removed: usize,
    pub journal_entries_removed: usize,
}

pub struct BackupOrchestrator {
    config: BackupConfig,
    retention_policy: RetentionPolicy,
    db_driver: Arc<dyn StorageBackupDriver>,
    fileset: FilesetArchiver,
    verifier: IntegrityVerifier,
    retention: RetentionManager,
    journal: BackupJournal,
    notifiers: NotifierSet,
    catalog: ArchiveCatalog,
}

impl BackupOrchestrator {
    pub fn new(
        config: BackupConfig,
        retention_policy: RetentionPolicy,
        db_driver: Arc<dyn StorageBackupDriver>,
        notifiers: NotifierSet,
    ) -> Self {
        let catalog = ArchiveCatalog::new(&config.backup_dir);
        let journal = BackupJournal::new(catalog.journal_path());
        let fileset = FilesetArchiver::new(
            &config.app_root,
            config.fileset_dirs.clone(),
            config.compression_level,
            config.process_timeout,
        );
        let verifier = IntegrityVerifier::new(config.process_timeout);
        let retention = RetentionManager::new(retention_policy);
        Self {
            config,
            retention_policy,
            db_driver,
            fileset,
            verifier,
            retention,
            journal,
            notifiers,
            catalog,
        }
    }

    pub fn catalog(&self) -> &ArchiveCatalog {
        &self.catalog
    }

    pub fn journal(&self) -> &BackupJournal {
        &self.journal
    }

    /// Database backup, fileset backup, then a snapshot bundling both.
    ///
    /// Component failures do not abort the run; each component journals
    /// its own outcome and the overall status degrades to partial (or
    /// failed, when nothing succeeded).
    pub async fn full_backup(&self) -> Result<FullBackupOutcome> {
        self.catalog.ensure_layout()?;
        let mut errors = Vec::new();

        let database = {
            let started = Utc::now();
            // A produced archive that fails verification is a component
            // failure like any other; the run keeps going.
            let produced = match self
                .db_driver
                .backup(ArchiveScope::Full, self.catalog.root())
                .await
            {
                Ok(archive) => self.check_archive(&archive).map(|()| archive),
                Err(e) => Err(e),
            };
            match produced {
                Ok(archive) => {
                    self.journal.append(&BackupLogEntry::success(
                        "database_backup",
                        Some(archive.path.clone()),
                        archive.size_bytes,
                        started,
                    ))?;
                    Some(archive)
                }
                Err(e) => {
                    error!("database backup failed: {e}");
                    self.journal
                        .append(&BackupLogEntry::failed("database_backup", e.to_string(), started))?;
                    errors.push(format!("database: {e}"));
                    None
                }
            }
        };

        let files = {
            let started = Utc::now();
            let produced = match self.fileset.backup(self.catalog.root()).await {
                Ok(archive) => self.check_archive(&archive).map(|()| archive),
                Err(e) => Err(e),
            };
            match produced {
                Ok(archive) => {
                    self.journal.append(&BackupLogEntry::success(
                        "files_backup",
                        Some(archive.path.clone()),
                        archive.size_bytes,
                        started,
                    ))?;
                    Some(archive)
                }
                Err(e) => {
                    error!("fileset backup failed: {e}");
                    self.journal
                        .append(&BackupLogEntry::failed("files_backup", e.to_string(), started))?;
                    errors.push(format!("files: {e}"));
                    None
                }
            }
        };

        let snapshot_dir = {
            let started = Utc::now();
            match (&database, &files) {
                (Some(db), Some(fs)) => match self.write_snapshot(db, fs) {
                    Ok(dir) => {
                        self.journal.append(&BackupLogEntry::success(
                            "snapshot",
                            Some(dir.clone()),
                            0,
                            started,
                        ))?;
                        Some(dir)
                    }
                    Err(e) => {
                        error!("snapshot failed: {e}");
                        self.journal
                            .append(&BackupLogEntry::failed("snapshot", e.to_string(), started))?;
                        errors.push(format!("snapshot: {e}"));
                        None
                    }
                },
                _ => {
                    let reason = "snapshot skipped: missing component archive";
                    self.journal
                        .append(&BackupLogEntry::failed("snapshot", reason, started))?;
                    errors.push(reason.to_string());
                    None
                }
            }
        };

        let status = if errors.is_empty() {
            JournalStatus::Success
        } else if database.is_some() || files.is_some() {
            JournalStatus::Partial
        } else {
            JournalStatus::Failed
        };

        let notification = match status {
            JournalStatus::Success => Notification::info(
                "Full backup complete",
                format!(
                    "database: {}\nfiles: {}",
                    describe(&database),
                    describe(&files)
                ),
            ),
            JournalStatus::Partial => Notification::warning(
                "Full backup completed partially",
                errors.join("\n"),
            ),
            JournalStatus::Failed => {
                Notification::critical("Full backup failed", errors.join("\n"))
            }
        };
        self.notifiers.dispatch(&notification).await;

        info!(status = ?status, "full backup run finished");
        Ok(FullBackupOutcome {
            database,
            files,
            snapshot_dir,
            status,
            errors,
        })
    }

    /// Capture the changes since the newest full base.
    ///
    /// Requires an intact base: no base at all is [`BackupError::NoBaseBackup`],
    /// an unreadable or damaged base is [`BackupError::ChainBroken`].
    /// Neither is ever silently substituted with a full backup.
    pub async fn differential_backup(&self) -> Result<Archive> {
        self.catalog.ensure_layout()?;
        let started = Utc::now();

        let result = async {
            let base = self
                .catalog
                .latest_base()?
                .ok_or(BackupError::NoBaseBackup)?;
            if !self.verifier.verify_archive(&base)? {
                return Err(BackupError::ChainBroken(format!(
                    "base archive failed verification: {}",
                    base.path.display()
                )));
            }
            self.db_driver
                .differential_backup(&base, &self.catalog.differential_dir())
                .await
        }
        .await;

        match result {
            Ok(archive) => {
                self.journal.append(&BackupLogEntry::success(
                    "differential_backup",
                    Some(archive.path.clone()),
                    archive.size_bytes,
                    started,
                ))?;
                self.notifiers
                    .dispatch(&Notification::info(
                        "Differential backup complete",
                        archive.path.display().to_string(),
                    ))
                    .await;
                Ok(archive)
            }
            Err(e) => {
                self.journal.append(&BackupLogEntry::failed(
                    "differential_backup",
                    e.to_string(),
                    started,
                ))?;
                self.notifiers
                    .dispatch(&Notification::critical(
                        "Differential backup failed",
                        e.to_string(),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    /// Standalone snapshot of the newest database and fileset archives.
    pub async fn snapshot(&self) -> Result<PathBuf> {
        self.catalog.ensure_layout()?;
        let started = Utc::now();
        let archives = self.catalog.list_archives()?;
        let newest_db = archives
            .iter()
            .filter(|a| a.kind == ArchiveKind::Database)
            .last()
            .cloned();
        let newest_files = archives
            .iter()
            .filter(|a| a.kind == ArchiveKind::Files)
            .last()
            .cloned();

        let result = match (newest_db, newest_files) {
            (Some(db), Some(fs)) => self.write_snapshot(&db, &fs),
            _ => Err(BackupError::config(
                "snapshot needs at least one database and one fileset archive",
            )),
        };
        match result {
            Ok(dir) => {
                self.journal.append(&BackupLogEntry::success(
                    "snapshot",
                    Some(dir.clone()),
                    0,
                    started,
                ))?;
                self.notifiers
                    .dispatch(&Notification::info(
                        "Snapshot complete",
                        dir.display().to_string(),
                    ))
                    .await;
                Ok(dir)
            }
            Err(e) => {
                self.journal
                    .append(&BackupLogEntry::failed("snapshot", e.to_string(), started))?;
                self.notifiers
                    .dispatch(&Notification::critical("Snapshot failed", e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Copy the two component archives and their sidecars into a new
    /// snapshot directory with a metadata document.
    fn write_snapshot(&self, database: &Archive, files: &Archive) -> Result<PathBuf> {
        let created_at = Utc::now();
        let dir = self
            .catalog
            .snapshots_dir()
            .join(Archive::timestamp_slug(created_at));
        std::fs::create_dir_all(&dir)?;

        let mut components = Vec::new();
        for archive in [database, files] {
            if !archive.path.exists() {
                return Err(BackupError::ArchiveIntegrity(format!(
                    "snapshot component missing: {}",
                    archive.path.display()
                )));
            }
            let name = archive
                .path
                .file_name()
                .ok_or_else(|| BackupError::config("archive path has no file name"))?;
            std::fs::copy(&archive.path, dir.join(name))?;
            let sidecar = Archive::sidecar_path(&archive.path);
            if sidecar.exists() {
                let sidecar_name = sidecar
                    .file_name()
                    .ok_or_else(|| BackupError::config("sidecar path has no file name"))?;
                std::fs::copy(&sidecar, dir.join(sidecar_name))?;
            }
            components.push(name.to_string_lossy().into_owned());
        }

        let metadata = json!({
            "backup_type": "snapshot",
            "created_at": created_at.to_rfc3339(),
            "timestamp": Archive::timestamp_slug(created_at),
            "compression": "gzip",
            "version": crate::archive::METADATA_VERSION,
            "components": components,
        });
        std::fs::write(dir.join("metadata.json"), serde_json::to_vec_pretty(&metadata)?)?;
        info!(dir = %dir.display(), "snapshot written");
        Ok(dir)
    }

    /// Restore one archive, dispatched by its own metadata. Database
    /// archives must carry the engine tag of the configured driver.
    pub async fn restore(&self, archive_path: &Path, target: &RestoreTarget) -> Result<()> {
        let started = Utc::now();
        let result = async {
            let archive = Archive::load(archive_path)?;
            if !self.verifier.verify_archive(&archive)? {
                return Err(BackupError::ArchiveIntegrity(format!(
                    "archive failed verification: {}",
                    archive.path.display()
                )));
            }
            match archive.kind {
                ArchiveKind::Files => self.fileset.restore(&archive).await,
                ArchiveKind::Database => {
                    if archive.engine != Some(self.db_driver.engine()) {
                        return Err(BackupError::config(format!(
                            "archive engine tag {:?} does not match configured driver {}",
                            archive.engine,
                            self.db_driver.engine()
                        )));
                    }
                    self.db_driver.restore(&archive, target).await
                }
                ArchiveKind::Snapshot => Err(BackupError::config(
                    "restore snapshot components individually",
                )),
            }
        }
        .await;

        match result {
            Ok(()) => {
                self.journal.append(&BackupLogEntry::success(
                    "restore",
                    Some(archive_path.to_path_buf()),
                    0,
                    started,
                ))?;
                self.notifiers
                    .dispatch(&Notification::info(
                        "Restore complete",
                        archive_path.display().to_string(),
                    ))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.journal
                    .append(&BackupLogEntry::failed("restore", e.to_string(), started))?;
                self.notifiers
                    .dispatch(&Notification::critical("Restore failed", e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Enforce retention over archives, snapshots and the journal.
    pub fn prune(&self) -> Result<CleanupOutcome> {
        self.catalog.ensure_layout()?;
        let PruneOutcome {
            archives_removed,
            snapshots_removed,
        } = self.retention.prune(&self.catalog)?;
        let journal_entries_removed = self
            .journal
            .prune(self.retention_policy.audit_retention_days)?;
        Ok(CleanupOutcome {
            archives_removed,
            snapshots_removed,
            journal_entries_removed,
        })
    }

    /// Build and persist the backup strategy report.
    pub fn strategy_report(&self, pitr_enabled: bool) -> Result<crate::strategy::StrategyReport> {
        self.catalog.ensure_layout()?;
        let report =
            crate::strategy::StrategyReport::build(&self.catalog, &self.retention_policy, pitr_enabled)?;
        report.persist(&self.catalog)?;
        Ok(report)
    }

    /// Structural verification of one catalogued archive.
    pub fn verify(&self, archive_path: &Path) -> Result<bool> {
        let archive = Archive::load(archive_path)?;
        self.verifier.verify_archive(&archive)
    }

    fn check_archive(&self, archive: &Archive) -> Result<()> {
        if self.verifier.verify_archive(archive)? {
            Ok(())
        } else {
            Err(BackupError::ArchiveIntegrity(format!(
                "produced archive failed verification: {}",
                archive.path.display()
            )))
        }
    }

    /// Engine tag of the configured database driver.
    pub fn engine(&self) -> Engine {
        self.db_driver.engine()
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }
}

fn describe(archive: &Option<Archive>) -> String {
    match archive {
        Some(a) => format!("{} ({} bytes)", a.path.display(), a.size_bytes),
        None => "missing".to_string(),
    }
}

impl std::fmt::Debug for BackupOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupOrchestrator")
            .field("backup_dir", &self.config.backup_dir)
            .field("engine", &self.db_driver.engine())
            .finish_non_exhaustive()
    }
}
