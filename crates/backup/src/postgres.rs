/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Client/server (PostgreSQL) backup driver
//!
//! Full backups run the `pg_dump | gzip > file` pipeline with both
//! stderr streams captured and a single combined wait point. Differential
//! backups bundle the WAL segments archived since the base; restoring a
//! differential restores its base and then re-seeds the WAL archive so
//! replay can continue from there. Credentials travel in the child
//! process environment, never on the command line.

use crate::archive::{Archive, ArchiveKind, ArchiveScope, Compression, Engine};
use crate::compression::gunzip_file;
use crate::driver::{RestoreTarget, StorageBackupDriver};
use crate::error::{BackupError, Result};
use crate::pipeline::{run_command, run_pipeline_to_file, Stage};
use crate::verify::psql_command;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::PostgresConfig;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PostgresDriver {
    config: PostgresConfig,
    base_dir: PathBuf,
    emergency_dir: PathBuf,
    /// WAL archive destination; differentials need this configured.
    wal_archive_dir: Option<PathBuf>,
    compression_level: u32,
    timeout: Duration,
}

impl PostgresDriver {
    pub fn new(
        config: PostgresConfig,
        base_dir: impl Into<PathBuf>,
        emergency_dir: impl Into<PathBuf>,
        wal_archive_dir: Option<PathBuf>,
        compression_level: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            config,
            base_dir: base_dir.into(),
            emergency_dir: emergency_dir.into(),
            wal_archive_dir,
            compression_level,
            timeout,
        }
    }

    fn pg_dump_stage(&self, scope: ArchiveScope) -> Stage {
        let mut stage = Stage::new("pg_dump")
            .arg(format!("--host={}", self.config.host))
            .arg(format!("--port={}", self.config.port))
            .arg(format!("--username={}", self.config.user))
            .arg("--no-password")
            .arg("--format=custom");
        if scope == ArchiveScope::SchemaOnly {
            stage = stage.arg("--schema-only");
        }
        stage
            .arg(self.config.database.clone())
            .env("PGPASSWORD", self.config.password.clone())
    }

    fn gzip_stage(&self) -> Stage {
        Stage::new("gzip").arg(format!("-{}", self.compression_level))
    }

    /// Server details recorded in the sidecar. Each probe is best-effort;
    /// a metadata failure never fails the backup.
    async fn collect_server_details(&self) -> BTreeMap<String, serde_json::Value> {
        let mut extra = BTreeMap::new();
        match run_command(&Stage::new("pg_dump").arg("--version"), self.timeout).await {
            Ok(out) => {
                extra.insert("pg_dump_version".to_string(), json!(out.stdout.trim()));
            }
            Err(e) => warn!("pg_dump version probe failed: {e}"),
        }
        let size_sql = "SELECT pg_database_size(current_database());";
        match run_command(&psql_command(&self.config, size_sql), self.timeout).await {
            Ok(out) => {
                if let Ok(bytes) = out.stdout.trim().parse::<u64>() {
                    extra.insert("database_size_bytes".to_string(), json!(bytes));
                }
            }
            Err(e) => warn!("database size probe failed: {e}"),
        }
        let count_sql =
            "SELECT count(*) FROM information_schema.tables WHERE table_schema = 'public';";
        match run_command(&psql_command(&self.config, count_sql), self.timeout).await {
            Ok(out) => {
                if let Ok(count) = out.stdout.trim().parse::<u64>() {
                    extra.insert("table_count".to_string(), json!(count));
                }
            }
            Err(e) => warn!("table count probe failed: {e}"),
        }
        extra.insert("parallel_jobs".to_string(), json!(self.config.parallel_jobs));
        extra
    }

    async fn dump_backup(&self, scope: ArchiveScope, dest_dir: &Path) -> Result<Archive> {
        let created_at = Utc::now();
        let slug = Archive::timestamp_slug(created_at);
        let name = match scope {
            ArchiveScope::SchemaOnly => format!("passprint_schema_{slug}.dump.gz"),
            _ => format!("passprint_full_{slug}.dump.gz"),
        };
        let out_path = dest_dir.join(name);

        let pipeline = run_pipeline_to_file(
            &self.pg_dump_stage(scope),
            &self.gzip_stage(),
            &out_path,
            self.timeout,
        )
        .await?;

        let mut extra = self.collect_server_details().await;
        extra.insert(
            "checksum_sha256".to_string(),
            json!(Archive::checksum(&out_path)?),
        );

        let archive = Archive {
            kind: ArchiveKind::Database,
            scope,
            engine: Some(Engine::Postgres),
            created_at,
            size_bytes: pipeline.output_bytes,
            compression: Compression::Gzip,
            path: out_path,
            extra,
        };
        archive.write_sidecar()?;

        // Full dumps also serve as differential bases.
        if scope == ArchiveScope::Full {
            self.register_base(&archive)?;
        }
        info!(
            path = %archive.path.display(),
            size_bytes = archive.size_bytes,
            scope = scope.as_str(),
            "postgres backup complete"
        );
        Ok(archive)
    }

    fn register_base(&self, archive: &Archive) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        let file_name = archive
            .path
            .file_name()
            .ok_or_else(|| BackupError::config("archive path has no file name"))?;
        let base_path = self.base_dir.join(file_name);
        std::fs::copy(&archive.path, &base_path)?;
        let mut base = archive.clone();
        base.path = base_path;
        base.write_sidecar()?;
        Ok(())
    }

    fn wal_dir(&self) -> Result<&Path> {
        self.wal_archive_dir.as_deref().ok_or_else(|| {
            BackupError::config("WAL archiving is not configured; differential backups need it")
        })
    }

    /// WAL segments archived after `since`, by filesystem mtime.
    fn wal_segments_since(&self, since: DateTime<Utc>) -> Result<Vec<PathBuf>> {
        let wal_dir = self.wal_dir()?;
        let mut segments = Vec::new();
        if !wal_dir.exists() {
            return Ok(segments);
        }
        for entry in std::fs::read_dir(wal_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
            if modified > since {
                segments.push(path);
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// Best-effort dump of the live database before a restore overwrites
    /// it. Restore proceeds on failure, with a warning.
    async fn emergency_side_archive(&self) {
        if std::fs::create_dir_all(&self.emergency_dir).is_err() {
            warn!("could not create emergency dir; skipping side-archive");
            return;
        }
        let slug = Archive::timestamp_slug(Utc::now());
        let side = self.emergency_dir.join(format!("pre_restore_{slug}.dump.gz"));
        match run_pipeline_to_file(
            &self.pg_dump_stage(ArchiveScope::Full),
            &self.gzip_stage(),
            &side,
            self.timeout,
        )
        .await
        {
            Ok(_) => info!(path = %side.display(), "emergency side-archive written"),
            Err(e) => warn!("emergency side-archive failed: {e}"),
        }
    }

    async fn restore_dump(&self, archive: &Archive) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let dump_path = staging.path().join("restore.dump");
        match archive.compression {
            Compression::Gzip => {
                gunzip_file(&archive.path, &dump_path)?;
            }
            Compression::None => {
                std::fs::copy(&archive.path, &dump_path)?;
            }
        }
        if std::fs::metadata(&dump_path)?.len() == 0 {
            return Err(BackupError::TruncatedOutput { path: dump_path });
        }

        let stage = Stage::new("pg_restore")
            .arg(format!("--host={}", self.config.host))
            .arg(format!("--port={}", self.config.port))
            .arg(format!("--username={}", self.config.user))
            .arg(format!("--dbname={}", self.config.database))
            .arg("--no-password")
            .arg("--clean")
            .arg("--if-exists")
            .arg(dump_path.to_string_lossy().into_owned())
            .env("PGPASSWORD", self.config.password.clone());
        run_command(&stage, self.timeout).await?;
        Ok(())
    }

    /// Re-seed the WAL archive with the segments bundled in a
    /// differential archive, after its base has been restored.
    fn unpack_wal_bundle(&self, archive: &Archive) -> Result<usize> {
        let wal_dir = self.wal_dir()?;
        std::fs::create_dir_all(wal_dir)?;

        let file = std::fs::File::open(&archive.path)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut tar = tar::Archive::new(decoder);
        let mut unpacked = 0usize;
        for entry in tar.entries()? {
            let mut entry = entry?;
            let name = entry
                .path()?
                .file_name()
                .map(|n| n.to_os_string())
                .ok_or_else(|| {
                    BackupError::ArchiveIntegrity("WAL bundle entry has no file name".into())
                })?;
            if name == "manifest.json" {
                continue;
            }
            entry.unpack(wal_dir.join(name))?;
            unpacked += 1;
        }
        Ok(unpacked)
    }

    fn load_base_of(&self, differential: &Archive) -> Result<Archive> {
        let base_path = differential
            .extra
            .get("base_archive_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BackupError::ChainBroken("differential sidecar does not record its base".into())
            })?;
        let base_path = PathBuf::from(base_path);
        if !base_path.exists() {
            return Err(BackupError::ChainBroken(format!(
                "base archive missing: {}",
                base_path.display()
            )));
        }
        Archive::load(&base_path)
            .map_err(|e| BackupError::ChainBroken(format!("base archive unreadable: {e}")))
    }
}

#[async_trait]
impl StorageBackupDriver for PostgresDriver {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn backup(&self, scope: ArchiveScope, dest_dir: &Path) -> Result<Archive> {
        match scope {
            ArchiveScope::Full | ArchiveScope::SchemaOnly => {
                self.dump_backup(scope, dest_dir).await
            }
            ArchiveScope::Differential => Err(BackupError::config(
                "differential backups go through differential_backup with an explicit base",
            )),
        }
    }

    async fn differential_backup(&self, base: &Archive, dest_dir: &Path) -> Result<Archive> {
        if base.scope != ArchiveScope::Full || base.engine != Some(Engine::Postgres) {
            return Err(BackupError::ChainBroken(format!(
                "base archive is not a postgres full backup: {}",
                base.path.display()
            )));
        }
        if !base.path.exists() {
            return Err(BackupError::ChainBroken(format!(
                "base archive missing: {}",
                base.path.display()
            )));
        }

        let segments = self.wal_segments_since(base.created_at)?;
        let created_at = Utc::now();
        let slug = Archive::timestamp_slug(created_at);
        let out_path = dest_dir.join(format!("passprint_diff_{slug}.tar.gz"));

        let manifest = json!({
            "base_archive_path": base.path,
            "base_created_at": base.created_at.to_rfc3339(),
            "segment_count": segments.len(),
            "segments": segments
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .collect::<Vec<_>>(),
        });

        {
            let file = std::fs::File::create(&out_path)?;
            let encoder = flate2::write::GzEncoder::new(
                file,
                flate2::Compression::new(self.compression_level),
            );
            let mut builder = tar::Builder::new(encoder);

            let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
            let mut header = tar::Header::new_gnu();
            header.set_size(manifest_bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "manifest.json", manifest_bytes.as_slice())?;

            for segment in &segments {
                let name = segment
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| BackupError::config("WAL segment has no file name"))?;
                builder.append_path_with_name(segment, name)?;
            }
            builder.into_inner()?.finish()?;
        }

        let size_bytes = std::fs::metadata(&out_path)?.len();
        let mut extra = BTreeMap::new();
        extra.insert("base_archive_path".to_string(), json!(base.path));
        extra.insert("segment_count".to_string(), json!(segments.len()));
        extra.insert(
            "checksum_sha256".to_string(),
            json!(Archive::checksum(&out_path)?),
        );

        let archive = Archive {
            kind: ArchiveKind::Database,
            scope: ArchiveScope::Differential,
            engine: Some(Engine::Postgres),
            created_at,
            size_bytes,
            compression: Compression::Gzip,
            path: out_path,
            extra,
        };
        archive.write_sidecar()?;
        info!(
            path = %archive.path.display(),
            segments = segments.len(),
            "postgres differential backup complete"
        );
        Ok(archive)
    }

    async fn restore(&self, archive: &Archive, target: &RestoreTarget) -> Result<()> {
        if archive.engine != Some(Engine::Postgres) {
            return Err(BackupError::config(format!(
                "archive engine tag {:?} does not match postgres driver",
                archive.engine
            )));
        }
        match target {
            // File target: just expand the dump for manual inspection.
            RestoreTarget::File(path) => {
                gunzip_file(&archive.path, path)?;
                return Ok(());
            }
            RestoreTarget::LiveDatabase => {}
        }

        self.emergency_side_archive().await;

        match archive.scope {
            ArchiveScope::Full | ArchiveScope::SchemaOnly => self.restore_dump(archive).await,
            ArchiveScope::Differential => {
                let base = self.load_base_of(archive)?;
                self.restore_dump(&base).await?;
                let unpacked = self.unpack_wal_bundle(archive)?;
                info!(unpacked, "WAL archive re-seeded from differential bundle");
                Ok(())
            }
        }
    }
}
