/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Retention enforcement
//!
//! Two rules run on every pass, in order: the age rule deletes archives
//! older than `retention_days`, then the count rule deletes the oldest
//! survivors beyond `max_backups`. Snapshots age out under their own
//! shorter window, judged by the timestamp embedded in their metadata
//! rather than directory mtime. Pruning is idempotent; an archive's
//! sidecar is always deleted with it.
//!
//! Age and ordering for archives come from the sidecar `created_at`,
//! not from filesystem mtime: the sidecar is mandatory (the catalog
//! refuses files without one) and survives copies and moves, where
//! mtime does not. An archive rsynced onto fresh storage is still
//! pruned on its original schedule.

use crate::archive::{Archive, ArchiveScope};
use crate::catalog::ArchiveCatalog;
use crate::error::Result;
use chrono::{Duration, Utc};
use common::RetentionPolicy;
use std::path::Path;
use tracing::{info, warn};

/// What one pruning pass removed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneOutcome {
    pub archives_removed: usize,
    pub snapshots_removed: usize,
}

#[derive(Debug, Clone)]
pub struct RetentionManager {
    policy: RetentionPolicy,
}

impl RetentionManager {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    /// Enforce the policy over the whole catalog.
    pub fn prune(&self, catalog: &ArchiveCatalog) -> Result<PruneOutcome> {
        let mut outcome = PruneOutcome::default();

        for dir in [
            catalog.root().to_path_buf(),
            catalog.base_dir(),
            catalog.differential_dir(),
        ] {
            outcome.archives_removed += self.prune_directory(catalog, &dir)?;
        }
        outcome.snapshots_removed = self.prune_snapshots(catalog)?;

        info!(
            archives = outcome.archives_removed,
            snapshots = outcome.snapshots_removed,
            "retention pass complete"
        );
        Ok(outcome)
    }

    fn prune_directory(&self, catalog: &ArchiveCatalog, dir: &Path) -> Result<usize> {
        let mut archives = catalog.archives_in(dir)?;
        let mut removed = 0usize;

        // Age rule first.
        let cutoff = Utc::now() - Duration::days(i64::from(self.policy.retention_days));
        let (expired, mut kept): (Vec<_>, Vec<_>) =
            archives.drain(..).partition(|a| a.created_at < cutoff);
        for archive in expired {
            if self.delete_archive(catalog, &archive)? {
                removed += 1;
            }
        }

        // Count rule over the survivors. `archives_in` sorts oldest
        // first, so the head of the list goes.
        let max = self.policy.max_backups;
        if kept.len() > max {
            let excess = kept.len() - max;
            for archive in kept.drain(..excess) {
                if self.delete_archive(catalog, &archive)? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Delete an archive and its sidecar. A full base that a differential
    /// may still depend on is kept, with a warning, until the
    /// differentials referencing it have themselves aged out.
    fn delete_archive(&self, catalog: &ArchiveCatalog, archive: &Archive) -> Result<bool> {
        if archive.scope == ArchiveScope::Full && self.is_referenced_base(catalog, archive)? {
            warn!(
                path = %archive.path.display(),
                "base archive still referenced by a differential; keeping past policy"
            );
            return Ok(false);
        }
        std::fs::remove_file(&archive.path)?;
        let sidecar = Archive::sidecar_path(&archive.path);
        if sidecar.exists() {
            std::fs::remove_file(&sidecar)?;
        }
        info!(path = %archive.path.display(), "archive pruned");
        Ok(true)
    }

    fn is_referenced_base(&self, catalog: &ArchiveCatalog, base: &Archive) -> Result<bool> {
        for diff in catalog.archives_in(&catalog.differential_dir())? {
            let referenced = diff
                .extra
                .get("base_archive_path")
                .and_then(|v| v.as_str())
                .map(|p| Path::new(p) == base.path)
                .unwrap_or(false);
            if referenced {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn prune_snapshots(&self, catalog: &ArchiveCatalog) -> Result<usize> {
        let cutoff =
            Utc::now() - Duration::days(i64::from(self.policy.snapshot_retention_days));
        let mut removed = 0usize;
        for (path, created_at) in catalog.list_snapshots()? {
            if created_at < cutoff {
                std::fs::remove_dir_all(&path)?;
                info!(path = %path.display(), "snapshot pruned");
                removed += 1;
            }
        }
        Ok(removed)
    }
}
