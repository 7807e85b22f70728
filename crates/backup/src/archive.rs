/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Archive model and metadata sidecars
//!
//! An [`Archive`] is one immutable backup artifact. Its metadata sidecar
//! (`<archive>.metadata.json`) is written in the same operation that
//! produces the archive and is self-describing: restore never needs
//! out-of-band knowledge of how the archive was made.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Metadata document format version, carried in every sidecar.
pub const METADATA_VERSION: &str = "2.0";

/// What the archive contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Database,
    Files,
    Snapshot,
}

impl ArchiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Files => "files",
            Self::Snapshot => "snapshot",
        }
    }
}

/// How much of the source the archive captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveScope {
    Full,
    Differential,
    SchemaOnly,
}

impl ArchiveScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Differential => "differential",
            Self::SchemaOnly => "schema-only",
        }
    }
}

/// The closed set of supported relational engines.
///
/// Adding an engine means adding a variant and a driver, not threading
/// string comparisons through every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Sqlite,
    Postgres,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgresql",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression applied to the archive payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    None,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::None => "none",
        }
    }
}

/// One immutable unit of backed-up state plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub kind: ArchiveKind,
    pub scope: ArchiveScope,
    /// Engine tag for database archives; None for filesets and snapshots.
    pub engine: Option<Engine>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub compression: Compression,
    pub path: PathBuf,
    /// Free-form engine details: version, inventory, parallelism used.
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl Archive {
    /// Compact timestamp slug embedded in archive filenames.
    pub fn timestamp_slug(at: DateTime<Utc>) -> String {
        at.format("%Y%m%d_%H%M%S").to_string()
    }

    pub fn sidecar_path(archive_path: &Path) -> PathBuf {
        let mut name = archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".metadata.json");
        archive_path.with_file_name(name)
    }

    /// Write the metadata sidecar next to the archive.
    pub fn write_sidecar(&self) -> Result<()> {
        let sidecar = ArchiveMetadata::from_archive(self);
        let path = Self::sidecar_path(&self.path);
        std::fs::write(&path, serde_json::to_vec_pretty(&sidecar)?)?;
        Ok(())
    }

    /// Load an archive description from its sidecar.
    pub fn load(archive_path: &Path) -> Result<Self> {
        let sidecar_path = Self::sidecar_path(archive_path);
        let raw = std::fs::read(&sidecar_path).map_err(|e| {
            BackupError::ArchiveIntegrity(format!(
                "missing metadata sidecar for {}: {e}",
                archive_path.display()
            ))
        })?;
        let sidecar: ArchiveMetadata = serde_json::from_slice(&raw)?;
        sidecar.into_archive(archive_path)
    }

    /// SHA-256 of the archive payload, streamed.
    pub fn checksum(path: &Path) -> Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// The on-disk sidecar document. Field names match what the status
/// dashboards and recovery scripts already expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub backup_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Compact creation stamp, identical to the one in the filename.
    pub timestamp: String,
    /// Precise creation time; retention uses this, not filesystem mtime.
    pub created_at: DateTime<Utc>,
    pub compression: String,
    pub version: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub kind: ArchiveKind,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl ArchiveMetadata {
    pub fn from_archive(archive: &Archive) -> Self {
        let (database_type, file_type) = match archive.kind {
            ArchiveKind::Database => (archive.engine.map(|e| e.as_str().to_string()), None),
            ArchiveKind::Files => (None, Some("fileset".to_string())),
            ArchiveKind::Snapshot => (None, None),
        };
        Self {
            backup_type: match archive.kind {
                ArchiveKind::Database => archive.scope.as_str().to_string(),
                ArchiveKind::Files => "files".to_string(),
                ArchiveKind::Snapshot => "snapshot".to_string(),
            },
            database_type,
            file_type,
            timestamp: Archive::timestamp_slug(archive.created_at),
            created_at: archive.created_at,
            compression: archive.compression.as_str().to_string(),
            version: METADATA_VERSION.to_string(),
            size_bytes: archive.size_bytes,
            checksum_sha256: archive
                .extra
                .get("checksum_sha256")
                .and_then(|v| v.as_str().map(String::from)),
            hostname: Some(gethostname::gethostname().to_string_lossy().into_owned()),
            kind: archive.kind,
            extra: archive.extra.clone(),
        }
    }

    pub fn into_archive(self, path: &Path) -> Result<Archive> {
        let scope = match self.backup_type.as_str() {
            "full" | "files" | "snapshot" => ArchiveScope::Full,
            "differential" => ArchiveScope::Differential,
            "schema-only" => ArchiveScope::SchemaOnly,
            other => {
                return Err(BackupError::ArchiveIntegrity(format!(
                    "unknown backup_type in sidecar: {other}"
                )))
            }
        };
        let engine = match self.database_type.as_deref() {
            Some("sqlite") => Some(Engine::Sqlite),
            Some("postgresql") => Some(Engine::Postgres),
            Some(other) => {
                return Err(BackupError::ArchiveIntegrity(format!(
                    "unknown database_type in sidecar: {other}"
                )))
            }
            None => None,
        };
        let compression = match self.compression.as_str() {
            "gzip" => Compression::Gzip,
            _ => Compression::None,
        };
        Ok(Archive {
            kind: self.kind,
            scope,
            engine,
            created_at: self.created_at,
            size_bytes: self.size_bytes,
            compression,
            path: path.to_path_buf(),
            extra: self.extra,
        })
    }
}
