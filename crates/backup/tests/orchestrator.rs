/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! End-to-end orchestration behaviour with scripted database drivers.

use async_trait::async_trait;
use backup::{
    Archive, ArchiveKind, ArchiveScope, BackupError, BackupOrchestrator, Compression, Engine,
    JournalStatus, RestoreTarget, StorageBackupDriver,
};
use chrono::Utc;
use common::{BackupConfig, Notification, Notifier, NotifierSet, RetentionPolicy};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Driver that either produces a real archive file or fails on demand.
struct ScriptedDriver {
    fail: bool,
}

#[async_trait]
impl StorageBackupDriver for ScriptedDriver {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    async fn backup(&self, scope: ArchiveScope, dest_dir: &Path) -> backup::Result<Archive> {
        if self.fail {
            return Err(BackupError::SourceIntegrity("scripted failure".into()));
        }
        let created_at = Utc::now();
        let path = dest_dir.join(format!(
            "passprint_full_{}.db.gz",
            Archive::timestamp_slug(created_at)
        ));
        // A real gzip container so verification passes.
        backup::compression::gzip_bytes(b"database payload", &path, 6)?;
        let archive = Archive {
            kind: ArchiveKind::Database,
            scope,
            engine: Some(Engine::Sqlite),
            created_at,
            size_bytes: std::fs::metadata(&path)?.len(),
            compression: Compression::Gzip,
            path,
            extra: BTreeMap::new(),
        };
        archive.write_sidecar()?;
        Ok(archive)
    }

    async fn differential_backup(
        &self,
        _base: &Archive,
        _dest_dir: &Path,
    ) -> backup::Result<Archive> {
        Err(BackupError::config("not under test"))
    }

    async fn restore(&self, _archive: &Archive, _target: &RestoreTarget) -> backup::Result<()> {
        Ok(())
    }
}

/// Driver whose output looks like an archive but is not a valid gzip
/// stream, so post-production verification rejects it.
struct TamperedDriver;

#[async_trait]
impl StorageBackupDriver for TamperedDriver {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    async fn backup(&self, scope: ArchiveScope, dest_dir: &Path) -> backup::Result<Archive> {
        let created_at = Utc::now();
        let path = dest_dir.join(format!(
            "passprint_full_{}.db.gz",
            Archive::timestamp_slug(created_at)
        ));
        std::fs::write(&path, b"not a gzip stream")?;
        let archive = Archive {
            kind: ArchiveKind::Database,
            scope,
            engine: Some(Engine::Sqlite),
            created_at,
            size_bytes: std::fs::metadata(&path)?.len(),
            compression: Compression::Gzip,
            path,
            extra: BTreeMap::new(),
        };
        archive.write_sidecar()?;
        Ok(archive)
    }

    async fn differential_backup(
        &self,
        _base: &Archive,
        _dest_dir: &Path,
    ) -> backup::Result<Archive> {
        Err(BackupError::config("not under test"))
    }

    async fn restore(&self, _archive: &Archive, _target: &RestoreTarget) -> backup::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: AtomicUsize,
    subjects: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> common::Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.subjects
            .lock()
            .unwrap()
            .push(notification.subject.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

fn seed_app_root(root: &Path) {
    for dir in ["uploads", "static", "logs", "config"] {
        let d = root.join(dir);
        std::fs::create_dir_all(&d).unwrap();
        std::fs::write(d.join("file.txt"), dir).unwrap();
    }
}

fn orchestrator(
    dir: &TempDir,
    fail_db: bool,
) -> (BackupOrchestrator, Arc<RecordingNotifier>, PathBuf) {
    orchestrator_with(dir, Arc::new(ScriptedDriver { fail: fail_db }))
}

fn orchestrator_with(
    dir: &TempDir,
    driver: Arc<dyn StorageBackupDriver>,
) -> (BackupOrchestrator, Arc<RecordingNotifier>, PathBuf) {
    let backup_dir = dir.path().join("backups");
    let app_root = dir.path().join("app");
    seed_app_root(&app_root);

    let config = BackupConfig {
        backup_dir: backup_dir.clone(),
        app_root,
        process_timeout: Duration::from_secs(30),
        ..BackupConfig::default()
    };

    // NotifierSet takes Box<dyn Notifier>; keep an Arc for assertions.
    struct Shared(Arc<RecordingNotifier>);
    #[async_trait]
    impl Notifier for Shared {
        async fn send(&self, n: &Notification) -> common::Result<()> {
            self.0.send(n).await
        }
        fn name(&self) -> &'static str {
            "recording"
        }
    }

    let recorder = Arc::new(RecordingNotifier::default());
    let notifiers = NotifierSet::from_config(&common::NotifyConfig::default())
        .with_notifier(Box::new(Shared(recorder.clone())));

    let orchestrator = BackupOrchestrator::new(config, RetentionPolicy::default(), driver, notifiers);
    (orchestrator, recorder, backup_dir)
}

#[tokio::test]
async fn full_backup_produces_all_components() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, recorder, _backup_dir) = orchestrator(&dir, false);

    let outcome = orchestrator.full_backup().await.unwrap();
    assert_eq!(outcome.status, JournalStatus::Success);
    assert!(outcome.database.is_some());
    assert!(outcome.files.is_some());
    assert!(outcome.snapshot_dir.is_some());

    // One journal entry per component.
    let entries = orchestrator.journal().entries().unwrap();
    let operations: Vec<&str> = entries.iter().map(|e| e.operation.as_str()).collect();
    assert_eq!(operations, ["database_backup", "files_backup", "snapshot"]);

    // Exactly one notification for the whole run.
    assert_eq!(recorder.sent.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.subjects.lock().unwrap().as_slice(),
        ["Full backup complete"]
    );
}

#[tokio::test]
async fn database_failure_degrades_to_partial() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, recorder, _backup_dir) = orchestrator(&dir, true);

    let outcome = orchestrator.full_backup().await.unwrap();
    assert_eq!(outcome.status, JournalStatus::Partial);
    assert!(outcome.database.is_none());
    assert!(outcome.files.is_some());
    // Snapshot cannot bundle a missing component.
    assert!(outcome.snapshot_dir.is_none());

    let entries = orchestrator.journal().entries().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].status, JournalStatus::Failed);
    assert_eq!(entries[1].status, JournalStatus::Success);
    assert_eq!(entries[2].status, JournalStatus::Failed);

    // The failed component's error is preserved verbatim.
    assert!(entries[0].error.as_deref().unwrap().contains("scripted failure"));

    // Still exactly one notification, and it is a warning.
    assert_eq!(recorder.sent.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.subjects.lock().unwrap().as_slice(),
        ["Full backup completed partially"]
    );
}

#[tokio::test]
async fn verification_failure_degrades_to_partial() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, recorder, _backup_dir) = orchestrator_with(&dir, Arc::new(TamperedDriver));

    // The database archive is produced but fails verification; the run
    // must continue to the fileset component and finish as partial.
    let outcome = orchestrator.full_backup().await.unwrap();
    assert_eq!(outcome.status, JournalStatus::Partial);
    assert!(outcome.database.is_none());
    assert!(outcome.files.is_some());
    assert!(outcome.snapshot_dir.is_none());

    let entries = orchestrator.journal().entries().unwrap();
    let operations: Vec<&str> = entries.iter().map(|e| e.operation.as_str()).collect();
    assert_eq!(operations, ["database_backup", "files_backup", "snapshot"]);
    assert_eq!(entries[0].status, JournalStatus::Failed);
    assert!(entries[0].error.as_deref().unwrap().contains("verification"));
    assert_eq!(entries[1].status, JournalStatus::Success);

    // One warning notification for the whole run.
    assert_eq!(recorder.sent.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.subjects.lock().unwrap().as_slice(),
        ["Full backup completed partially"]
    );
}

#[tokio::test]
async fn standalone_snapshot_dispatches_one_notification() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, recorder, _backup_dir) = orchestrator(&dir, false);

    orchestrator.full_backup().await.unwrap();
    assert_eq!(recorder.sent.load(Ordering::SeqCst), 1);

    orchestrator.snapshot().await.unwrap();
    assert_eq!(recorder.sent.load(Ordering::SeqCst), 2);
    assert_eq!(
        recorder.subjects.lock().unwrap().last().map(String::as_str),
        Some("Snapshot complete")
    );

    // A refused snapshot notifies too.
    let empty = TempDir::new().unwrap();
    let (bare, bare_recorder, _backup_dir) = self::orchestrator(&empty, false);
    bare.catalog().ensure_layout().unwrap();
    assert!(bare.snapshot().await.is_err());
    assert_eq!(bare_recorder.sent.load(Ordering::SeqCst), 1);
    assert_eq!(
        bare_recorder.subjects.lock().unwrap().as_slice(),
        ["Snapshot failed"]
    );
}

#[tokio::test]
async fn differential_without_base_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, _recorder, _backup_dir) = orchestrator(&dir, false);

    match orchestrator.differential_backup().await {
        Err(BackupError::NoBaseBackup) => {}
        other => panic!("expected NoBaseBackup, got {other:?}"),
    }

    // The refusal is journalled too.
    let entries = orchestrator.journal().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, "differential_backup");
    assert_eq!(entries[0].status, JournalStatus::Failed);
}

#[tokio::test]
async fn restore_rejects_mismatched_engine_tag() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, _recorder, backup_dir) = orchestrator(&dir, false);
    std::fs::create_dir_all(&backup_dir).unwrap();

    let path = backup_dir.join("foreign.dump.gz");
    backup::compression::gzip_bytes(b"pg dump", &path, 6).unwrap();
    let archive = Archive {
        kind: ArchiveKind::Database,
        scope: ArchiveScope::Full,
        engine: Some(Engine::Postgres),
        created_at: Utc::now(),
        size_bytes: std::fs::metadata(&path).unwrap().len(),
        compression: Compression::Gzip,
        path: path.clone(),
        extra: BTreeMap::new(),
    };
    archive.write_sidecar().unwrap();

    match orchestrator.restore(&path, &RestoreTarget::LiveDatabase).await {
        Err(BackupError::Configuration(_)) => {}
        other => panic!("expected Configuration, got {other:?}"),
    }
}

#[tokio::test]
async fn snapshot_directory_carries_metadata_and_components() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, _recorder, _backup_dir) = orchestrator(&dir, false);

    let outcome = orchestrator.full_backup().await.unwrap();
    let snapshot_dir = outcome.snapshot_dir.unwrap();

    let metadata: serde_json::Value =
        serde_json::from_slice(&std::fs::read(snapshot_dir.join("metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata["backup_type"], "snapshot");
    assert_eq!(metadata["version"], "2.0");
    assert_eq!(metadata["components"].as_array().unwrap().len(), 2);

    // Component archives and their sidecars were copied in.
    let copied: Vec<_> = std::fs::read_dir(&snapshot_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(copied.len(), 5); // 2 archives + 2 sidecars + metadata.json
}
