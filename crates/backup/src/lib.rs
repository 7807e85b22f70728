/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! # PassPrint Backup Engine
//!
//! Backup, verification, retention and point-in-time recovery for the
//! PassPrint application: database archives (SQLite and PostgreSQL),
//! application fileset bundles, consistent snapshots, a differential
//! chain built on WAL archiving, and the append-only journal the status
//! tooling reads.
//!
//! The [`orchestrator::BackupOrchestrator`] is the public entry point;
//! engine specifics live behind [`driver::StorageBackupDriver`].

pub mod archive;
pub mod catalog;
pub mod compression;
pub mod driver;
pub mod error;
pub mod fileset;
pub mod journal;
pub mod orchestrator;
pub mod pipeline;
pub mod pitr;
pub mod postgres;
pub mod retention;
pub mod sqlite;
pub mod strategy;
pub mod verify;

pub use archive::{Archive, ArchiveKind, ArchiveMetadata, ArchiveScope, Compression, Engine};
pub use catalog::ArchiveCatalog;
pub use driver::{RestoreTarget, StorageBackupDriver};
pub use error::{BackupError, Result};
pub use fileset::FilesetArchiver;
pub use journal::{BackupJournal, BackupLogEntry, JournalStatus};
pub use orchestrator::{BackupOrchestrator, CleanupOutcome, FullBackupOutcome};
pub use pitr::{PitrManager, PitrState, PitrStep};
pub use postgres::PostgresDriver;
pub use retention::{PruneOutcome, RetentionManager};
pub use sqlite::SqliteDriver;
pub use strategy::StrategyReport;
pub use verify::{IntegrityVerifier, SourceLocator};
