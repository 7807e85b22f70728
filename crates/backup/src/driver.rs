/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Storage driver capability interface
//!
//! Each supported relational engine implements this trait; the
//! orchestrator holds the active driver as a trait object and dispatches
//! by the archive's engine tag, never by filename guessing.

use crate::archive::{Archive, ArchiveScope, Engine};
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Where a database restore lands.
#[derive(Debug, Clone)]
pub enum RestoreTarget {
    /// Overwrite an embedded database file at this path.
    File(PathBuf),
    /// Restore into the configured client/server database.
    LiveDatabase,
}

/// Engine-specific backup and restore primitives.
#[async_trait]
pub trait StorageBackupDriver: Send + Sync {
    /// Which engine this driver speaks for.
    fn engine(&self) -> Engine;

    /// Capture the database into a new archive under `dest_dir`.
    /// The archive's metadata sidecar is written in the same call.
    async fn backup(&self, scope: ArchiveScope, dest_dir: &Path) -> Result<Archive>;

    /// Capture the changes accumulated since `base`. Engines without a
    /// restorable change stream reject this with a configuration error.
    async fn differential_backup(&self, base: &Archive, dest_dir: &Path) -> Result<Archive>;

    /// Restore `archive` over `target`. The current live state is written
    /// to an emergency side-archive first; a failed restore is reported
    /// and never retried.
    async fn restore(&self, archive: &Archive, target: &RestoreTarget) -> Result<()>;
}
