/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Application fileset backup
//!
//! Bundles the configured application directories (uploads, static,
//! logs, config) into one tar.gz with an embedded `manifest.json`
//! describing what was captured. A configured directory that does not
//! exist is skipped with a warning, not an error; deployments routinely
//! lack one or two of them.

use crate::archive::{Archive, ArchiveKind, ArchiveScope, Compression};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct FilesetArchiver {
    app_root: PathBuf,
    fileset_dirs: Vec<String>,
    compression_level: u32,
    timeout: Duration,
}

impl FilesetArchiver {
    pub fn new(
        app_root: impl Into<PathBuf>,
        fileset_dirs: Vec<String>,
        compression_level: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            app_root: app_root.into(),
            fileset_dirs,
            compression_level,
            timeout,
        }
    }

    /// Capture the fileset into `dest_dir`. The manifest rides inside
    /// the bundle and the metadata sidecar is written next to it.
    pub async fn backup(&self, dest_dir: &Path) -> Result<Archive> {
        let created_at = Utc::now();
        let slug = Archive::timestamp_slug(created_at);
        let out_path = dest_dir.join(format!("passprint_files_{slug}.tar.gz"));

        let app_root = self.app_root.clone();
        let dirs = self.fileset_dirs.clone();
        let out = out_path.clone();
        let level = self.compression_level;

        // Archiving walks and compresses on a blocking thread; the
        // timeout bounds the whole capture like any external invocation.
        let build = tokio::task::spawn_blocking(move || build_bundle(&app_root, &dirs, &out, level));
        let (captured_dirs, file_count) = tokio::time::timeout(self.timeout, build)
            .await
            .map_err(|_| BackupError::Timeout {
                command: format!("fileset bundle {}", out_path.display()),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| BackupError::ArchiveIntegrity(format!("bundle task failed: {e}")))??;

        let size_bytes = std::fs::metadata(&out_path)?.len();
        if size_bytes == 0 {
            let _ = std::fs::remove_file(&out_path);
            return Err(BackupError::TruncatedOutput { path: out_path });
        }

        let mut extra = BTreeMap::new();
        extra.insert("directories".to_string(), json!(captured_dirs));
        extra.insert("file_count".to_string(), json!(file_count));
        extra.insert(
            "checksum_sha256".to_string(),
            json!(Archive::checksum(&out_path)?),
        );

        let archive = Archive {
            kind: ArchiveKind::Files,
            scope: ArchiveScope::Full,
            engine: None,
            created_at,
            size_bytes,
            compression: Compression::Gzip,
            path: out_path,
            extra,
        };
        archive.write_sidecar()?;
        info!(
            path = %archive.path.display(),
            file_count,
            "fileset backup complete"
        );
        Ok(archive)
    }

    /// Restore the fileset over the application root. The bundle is
    /// expanded into a staging directory first; directories only move
    /// into place after the whole expansion succeeds, and staging is
    /// removed on both paths.
    pub async fn restore(&self, archive: &Archive) -> Result<()> {
        if archive.kind != ArchiveKind::Files {
            return Err(BackupError::config(format!(
                "archive is not a fileset bundle: {}",
                archive.path.display()
            )));
        }
        let staging = tempfile::tempdir()?;

        let file = std::fs::File::open(&archive.path)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut tar = tar::Archive::new(decoder);
        tar.unpack(staging.path())?;

        for dir in &self.fileset_dirs {
            let staged = staging.path().join(dir);
            if !staged.exists() {
                continue;
            }
            let target = self.app_root.join(dir);
            if target.exists() {
                std::fs::remove_dir_all(&target)?;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            move_dir(&staged, &target)?;
        }
        info!(root = %self.app_root.display(), "fileset restore complete");
        Ok(())
    }
}

fn build_bundle(
    app_root: &Path,
    dirs: &[String],
    out_path: &Path,
    level: u32,
) -> Result<(Vec<String>, u64)> {
    let file = std::fs::File::create(out_path)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::new(level));
    let mut builder = tar::Builder::new(encoder);

    let mut captured = Vec::new();
    let mut file_count = 0u64;
    for dir in dirs {
        let source = app_root.join(dir);
        if !source.is_dir() {
            warn!(dir, "configured fileset directory missing; skipping");
            continue;
        }
        for entry in WalkDir::new(&source).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                file_count += 1;
            }
        }
        builder.append_dir_all(dir, &source)?;
        captured.push(dir.clone());
    }

    let manifest = json!({
        "created_at": Utc::now().to_rfc3339(),
        "directories": captured,
        "file_count": file_count,
    });
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "manifest.json", manifest_bytes.as_slice())?;

    builder.into_inner()?.finish()?;
    Ok((captured, file_count))
}

/// Rename when source and target share a filesystem; fall back to a
/// recursive copy across mount boundaries.
fn move_dir(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir(from, to)?;
            std::fs::remove_dir_all(from)?;
            Ok(())
        }
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_app_root(root: &Path) {
        for (dir, file, content) in [
            ("uploads", "print_1.stl", "solid model"),
            ("static", "style.css", "body {}"),
            ("config", "app.toml", "[app]"),
        ] {
            let d = root.join(dir);
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join(file), content).unwrap();
        }
    }

    fn archiver(root: &Path) -> FilesetArchiver {
        FilesetArchiver::new(
            root,
            vec![
                "uploads".into(),
                "static".into(),
                "logs".into(),
                "config".into(),
            ],
            6,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn backup_skips_missing_directories() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("app");
        seed_app_root(&root);
        // "logs" deliberately absent.

        let archive = archiver(&root).backup(dir.path()).await.unwrap();
        assert_eq!(archive.kind, ArchiveKind::Files);
        let dirs = archive.extra.get("directories").unwrap();
        assert_eq!(dirs, &json!(["uploads", "static", "config"]));
        assert!(Archive::sidecar_path(&archive.path).exists());
    }

    #[tokio::test]
    async fn backup_and_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("app");
        seed_app_root(&root);

        let a = archiver(&root);
        let archive = a.backup(dir.path()).await.unwrap();

        // Mutate and damage the live tree, then restore.
        std::fs::write(root.join("uploads/print_1.stl"), "corrupted").unwrap();
        std::fs::remove_dir_all(root.join("static")).unwrap();

        a.restore(&archive).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(root.join("uploads/print_1.stl")).unwrap(),
            "solid model"
        );
        assert_eq!(
            std::fs::read_to_string(root.join("static/style.css")).unwrap(),
            "body {}"
        );
    }

    #[tokio::test]
    async fn bundle_embeds_a_manifest() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("app");
        seed_app_root(&root);

        let archive = archiver(&root).backup(dir.path()).await.unwrap();

        let file = std::fs::File::open(&archive.path).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut tar = tar::Archive::new(decoder);
        let has_manifest = tar
            .entries()
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.path().unwrap().ends_with("manifest.json"));
        assert!(has_manifest);
    }

    #[tokio::test]
    async fn restore_rejects_non_fileset_archives() {
        let dir = TempDir::new().unwrap();
        let a = archiver(dir.path());
        let archive = Archive {
            kind: ArchiveKind::Database,
            scope: ArchiveScope::Full,
            engine: Some(crate::archive::Engine::Sqlite),
            created_at: Utc::now(),
            size_bytes: 1,
            compression: Compression::Gzip,
            path: dir.path().join("db.gz"),
            extra: BTreeMap::new(),
        };
        match a.restore(&archive).await {
            Err(BackupError::Configuration(_)) => {}
            other => panic!("expected Configuration, got {other:?}"),
        }
    }
}
