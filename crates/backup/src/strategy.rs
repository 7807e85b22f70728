/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Backup strategy report
//!
//! A point-in-time summary of the catalog plus the recommended schedule,
//! persisted as `backup_strategy_report_<timestamp>.json` in the backup
//! directory so operators can review coverage without shell access to
//! the catalog.

use crate::archive::{Archive, ArchiveKind, ArchiveScope};
use crate::catalog::ArchiveCatalog;
use crate::error::Result;
use chrono::{DateTime, Utc};
use common::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub database_archives: usize,
    pub fileset_archives: usize,
    pub base_archives: usize,
    pub differential_archives: usize,
    pub snapshots: usize,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_archive_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_archive_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRecommendation {
    pub operation: String,
    pub cadence: String,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyReport {
    pub generated_at: DateTime<Utc>,
    pub catalog: CatalogSummary,
    pub retention: RetentionPolicy,
    pub pitr_enabled: bool,
    pub schedule: Vec<ScheduleRecommendation>,
}

impl StrategyReport {
    pub fn build(
        catalog: &ArchiveCatalog,
        retention: &RetentionPolicy,
        pitr_enabled: bool,
    ) -> Result<Self> {
        let top = catalog.list_archives()?;
        let bases = catalog.archives_in(&catalog.base_dir())?;
        let diffs = catalog.archives_in(&catalog.differential_dir())?;
        let snapshots = catalog.list_snapshots()?;

        let all: Vec<&Archive> = top.iter().chain(&bases).chain(&diffs).collect();
        let summary = CatalogSummary {
            database_archives: top
                .iter()
                .filter(|a| a.kind == ArchiveKind::Database)
                .count(),
            fileset_archives: top.iter().filter(|a| a.kind == ArchiveKind::Files).count(),
            base_archives: bases.len(),
            differential_archives: diffs
                .iter()
                .filter(|a| a.scope == ArchiveScope::Differential)
                .count(),
            snapshots: snapshots.len(),
            total_bytes: all.iter().map(|a| a.size_bytes).sum(),
            newest_archive_at: all.iter().map(|a| a.created_at).max(),
            oldest_archive_at: all.iter().map(|a| a.created_at).min(),
        };

        let mut schedule = vec![
            ScheduleRecommendation {
                operation: "full_backup".into(),
                cadence: "daily".into(),
                rationale: "bounds restore time and resets the differential chain".into(),
            },
            ScheduleRecommendation {
                operation: "prune".into(),
                cadence: "daily".into(),
                rationale: format!(
                    "keeps the catalog within {} days / {} archives",
                    retention.retention_days, retention.max_backups
                ),
            },
        ];
        if pitr_enabled {
            schedule.push(ScheduleRecommendation {
                operation: "differential_backup".into(),
                cadence: "hourly".into(),
                rationale: "WAL archiving is active; differentials are cheap".into(),
            });
        }

        Ok(Self {
            generated_at: Utc::now(),
            catalog: summary,
            retention: *retention,
            pitr_enabled,
            schedule,
        })
    }

    /// Persist into the catalog root. Returns the report path.
    pub fn persist(&self, catalog: &ArchiveCatalog) -> Result<PathBuf> {
        let slug = Archive::timestamp_slug(self.generated_at);
        let path = catalog
            .root()
            .join(format!("backup_strategy_report_{slug}.json"));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        info!(path = %path.display(), "strategy report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Compression, Engine};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn report_summarizes_catalog_and_persists() {
        let dir = TempDir::new().unwrap();
        let catalog = ArchiveCatalog::new(dir.path());
        catalog.ensure_layout().unwrap();

        let path = dir.path().join("passprint_full_a.db.gz");
        std::fs::write(&path, b"payload").unwrap();
        let archive = Archive {
            kind: ArchiveKind::Database,
            scope: ArchiveScope::Full,
            engine: Some(Engine::Sqlite),
            created_at: Utc::now(),
            size_bytes: 7,
            compression: Compression::Gzip,
            path,
            extra: BTreeMap::new(),
        };
        archive.write_sidecar().unwrap();

        let policy = RetentionPolicy::default();
        let report = StrategyReport::build(&catalog, &policy, false).unwrap();
        assert_eq!(report.catalog.database_archives, 1);
        assert_eq!(report.catalog.total_bytes, 7);
        assert!(!report.schedule.is_empty());

        let path = report.persist(&catalog).unwrap();
        assert!(path.exists());

        // Report files never register as archives.
        assert_eq!(catalog.list_archives().unwrap().len(), 1);
    }

    #[test]
    fn pitr_adds_differential_cadence() {
        let dir = TempDir::new().unwrap();
        let catalog = ArchiveCatalog::new(dir.path());
        catalog.ensure_layout().unwrap();
        let policy = RetentionPolicy::default();

        let without = StrategyReport::build(&catalog, &policy, false).unwrap();
        let with = StrategyReport::build(&catalog, &policy, true).unwrap();
        assert_eq!(with.schedule.len(), without.schedule.len() + 1);
    }
}
