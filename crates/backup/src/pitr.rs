/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Point-in-time recovery orchestration
//!
//! Setup installs the WAL archiving pieces (archive directory, archive
//! script, configuration snippet) and verifies the server's archive mode.
//! A PITR restore is a strict three-step sequence: restore the base,
//! pause WAL replay at the target, resume replay. Once replay has been
//! paused, any later failure leaves the engine in a partial replay state
//! that no automatic retry can fix; those surface as fatal errors that
//! an operator must clear by hand.

use crate::archive::{Archive, ArchiveScope, Engine};
use crate::driver::{RestoreTarget, StorageBackupDriver};
use crate::error::{BackupError, Result};
use crate::pipeline::run_command;
use crate::verify::psql_command;
use chrono::{DateTime, Duration, Utc};
use common::{PitrConfig, PostgresConfig};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use tracing::{info, warn};

/// WAL archiving lifecycle. Transitions only move forward:
/// `Disabled -> Configuring -> Enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitrState {
    Disabled,
    /// Artifacts are installed but the server has not yet confirmed
    /// `archive_mode = on` (a restart is usually pending).
    Configuring,
    Enabled,
}

/// The three ordered steps of a PITR restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitrStep {
    RestoreBase,
    PauseReplay,
    ResumeReplay,
}

#[derive(Debug)]
pub struct PitrManager {
    config: PitrConfig,
    pg: PostgresConfig,
    state: PitrState,
    timeout: StdDuration,
}

impl PitrManager {
    pub fn new(config: PitrConfig, pg: PostgresConfig, timeout: StdDuration) -> Self {
        Self {
            config,
            pg,
            state: PitrState::Disabled,
            timeout,
        }
    }

    pub fn state(&self) -> PitrState {
        self.state
    }

    pub fn archive_script_path(&self) -> PathBuf {
        self.config.wal_archive_dir.join("archive_wal.sh")
    }

    pub fn conf_snippet_path(&self) -> PathBuf {
        self.config.wal_archive_dir.join("postgresql_pitr.conf")
    }

    /// Install the WAL archiving artifacts and probe the server.
    ///
    /// Returns the resulting state: [`PitrState::Enabled`] if the server
    /// already reports `archive_mode = on`, otherwise
    /// [`PitrState::Configuring`] until the operator applies the snippet
    /// and restarts.
    pub async fn configure(&mut self) -> Result<PitrState> {
        if !self.config.enabled {
            return Err(BackupError::config(
                "PITR is disabled in configuration; enable it before setup",
            ));
        }
        self.state = PitrState::Configuring;

        std::fs::create_dir_all(&self.config.wal_archive_dir)?;
        self.write_archive_script()?;
        self.write_conf_snippet()?;

        let probe = run_command(&psql_command(&self.pg, "SHOW archive_mode;"), self.timeout).await;
        match probe {
            Ok(out) if out.stdout.trim() == "on" => {
                self.state = PitrState::Enabled;
                info!("WAL archiving active; PITR enabled");
            }
            Ok(out) => {
                warn!(
                    archive_mode = %out.stdout.trim(),
                    snippet = %self.conf_snippet_path().display(),
                    "archive_mode is not 'on'; apply the snippet and restart postgresql"
                );
            }
            Err(e) => {
                warn!("could not probe archive_mode: {e}");
            }
        }
        Ok(self.state)
    }

    fn write_archive_script(&self) -> Result<()> {
        let path = self.archive_script_path();
        let script = format!(
            "#!/bin/sh\n\
             # Installed by passprint-dr; referenced from archive_command.\n\
             set -eu\n\
             WAL_ARCHIVE_DIR=\"{}\"\n\
             test -d \"$WAL_ARCHIVE_DIR\"\n\
             cp \"$1\" \"$WAL_ARCHIVE_DIR/$2\"\n",
            self.config.wal_archive_dir.display()
        );
        std::fs::write(&path, script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    fn write_conf_snippet(&self) -> Result<()> {
        let snippet = format!(
            "# PITR settings for postgresql.conf\n\
             wal_level = replica\n\
             archive_mode = on\n\
             archive_command = '{} %p %f'\n\
             archive_timeout = 300\n",
            self.archive_script_path().display()
        );
        std::fs::write(self.conf_snippet_path(), snippet)?;
        Ok(())
    }

    /// Restore the database to `target_time`.
    ///
    /// `base` must be a full archive created before the target time.
    /// The recovery target settings are written next to the WAL archive
    /// for the server to pick up, the base is restored, then replay is
    /// paused and resumed around the target. Failures once replay has
    /// been touched are fatal and never retried.
    pub async fn restore_to_timestamp(
        &self,
        driver: &dyn StorageBackupDriver,
        base: &Archive,
        target_time: DateTime<Utc>,
    ) -> Result<()> {
        if self.state == PitrState::Disabled {
            return Err(BackupError::config(
                "PITR has not been configured; run setup first",
            ));
        }
        if driver.engine() != Engine::Postgres || base.engine != Some(Engine::Postgres) {
            return Err(BackupError::config(
                "point-in-time restore requires a postgres base archive",
            ));
        }
        if base.scope != ArchiveScope::Full {
            return Err(BackupError::config(
                "point-in-time restore requires a full base archive",
            ));
        }
        if base.created_at > target_time {
            return Err(BackupError::config(format!(
                "base archive ({}) is newer than the recovery target ({target_time})",
                base.created_at
            )));
        }

        self.write_recovery_target(target_time)?;

        // Step 1: restore the base. Nothing has replayed yet, so a
        // failure here is an ordinary restore error.
        info!(step = ?PitrStep::RestoreBase, "starting point-in-time restore");
        driver.restore(base, &RestoreTarget::LiveDatabase).await?;

        // Step 2: pause replay at the target. From here on the engine
        // holds partially replayed state.
        info!(step = ?PitrStep::PauseReplay, target = %target_time, "pausing WAL replay");
        if let Err(e) =
            run_command(&psql_command(&self.pg, "SELECT pg_wal_replay_pause();"), self.timeout)
                .await
        {
            return Err(BackupError::PitrFatal {
                step: PitrStep::PauseReplay,
                message: format!("replay pause failed after base restore: {e}"),
            });
        }

        // Step 3: resume replay. A failure here strands the engine
        // mid-replay and requires manual intervention.
        info!(step = ?PitrStep::ResumeReplay, "resuming WAL replay");
        if let Err(e) =
            run_command(&psql_command(&self.pg, "SELECT pg_wal_replay_resume();"), self.timeout)
                .await
        {
            return Err(BackupError::PitrFatal {
                step: PitrStep::ResumeReplay,
                message: format!("replay resume failed; engine is mid-replay: {e}"),
            });
        }

        info!(target = %target_time, "point-in-time restore complete");
        Ok(())
    }

    fn write_recovery_target(&self, target_time: DateTime<Utc>) -> Result<()> {
        let settings = format!(
            "# Recovery target for postgresql.auto.conf\n\
             restore_command = 'cp {}/%f %p'\n\
             recovery_target_time = '{}'\n\
             recovery_target_action = 'pause'\n",
            self.config.wal_archive_dir.display(),
            target_time.format("%Y-%m-%d %H:%M:%S%z"),
        );
        std::fs::create_dir_all(&self.config.wal_archive_dir)?;
        std::fs::write(
            self.config.wal_archive_dir.join("recovery_target.conf"),
            settings,
        )?;
        Ok(())
    }

    /// Delete archived WAL segments older than the retention window.
    /// Installed artifacts (scripts, snippets) are never touched.
    pub fn prune_wal(&self) -> Result<usize> {
        let dir = &self.config.wal_archive_dir;
        if !dir.exists() {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(i64::from(self.config.wal_retention_days));
        let mut removed = 0usize;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || is_installed_artifact(&path) {
                continue;
            }
            let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
            if modified < cutoff {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "pruned archived WAL segments");
        }
        Ok(removed)
    }
}

fn is_installed_artifact(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("sh") | Some("conf")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    fn pg_config() -> PostgresConfig {
        PostgresConfig {
            host: "localhost".into(),
            port: 5432,
            database: "passprint".into(),
            user: "passprint".into(),
            password: "secret".into(),
            parallel_jobs: 2,
        }
    }

    fn manager(dir: &Path, enabled: bool) -> PitrManager {
        PitrManager::new(
            PitrConfig {
                enabled,
                wal_archive_dir: dir.join("wal_archive"),
                wal_retention_days: 7,
            },
            pg_config(),
            StdDuration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn configure_requires_pitr_enabled() {
        let dir = TempDir::new().unwrap();
        let mut m = manager(dir.path(), false);
        match m.configure().await {
            Err(BackupError::Configuration(_)) => {}
            other => panic!("expected Configuration, got {other:?}"),
        }
        assert_eq!(m.state(), PitrState::Disabled);
    }

    #[tokio::test]
    async fn configure_installs_artifacts() {
        let dir = TempDir::new().unwrap();
        let mut m = manager(dir.path(), true);
        // Without a reachable server this lands in Configuring.
        let state = m.configure().await.unwrap();
        assert_eq!(state, PitrState::Configuring);

        assert!(m.archive_script_path().exists());
        let script = std::fs::read_to_string(m.archive_script_path()).unwrap();
        assert!(script.starts_with("#!/bin/sh"));

        let snippet = std::fs::read_to_string(m.conf_snippet_path()).unwrap();
        assert!(snippet.contains("archive_mode = on"));
        assert!(snippet.contains("archive_wal.sh"));
    }

    #[tokio::test]
    async fn configure_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let mut m = manager(dir.path(), true);
        m.configure().await.unwrap();
        let first = std::fs::read_to_string(m.archive_script_path()).unwrap();
        m.configure().await.unwrap();
        let second = std::fs::read_to_string(m.archive_script_path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn prune_wal_spares_installed_artifacts() {
        let dir = TempDir::new().unwrap();
        let m = manager(dir.path(), true);
        let wal = dir.path().join("wal_archive");
        std::fs::create_dir_all(&wal).unwrap();

        std::fs::write(wal.join("archive_wal.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(wal.join("000000010000000000000001"), b"old segment").unwrap();
        std::fs::write(wal.join("000000010000000000000002"), b"new segment").unwrap();

        let old = FileTime::from_unix_time(
            (Utc::now() - Duration::days(30)).timestamp(),
            0,
        );
        set_file_mtime(wal.join("archive_wal.sh"), old).unwrap();
        set_file_mtime(wal.join("000000010000000000000001"), old).unwrap();

        assert_eq!(m.prune_wal().unwrap(), 1);
        assert!(wal.join("archive_wal.sh").exists());
        assert!(!wal.join("000000010000000000000001").exists());
        assert!(wal.join("000000010000000000000002").exists());
    }

    #[tokio::test]
    async fn restore_requires_configuration_first() {
        let dir = TempDir::new().unwrap();
        let m = manager(dir.path(), true);
        let base = Archive {
            kind: crate::archive::ArchiveKind::Database,
            scope: ArchiveScope::Full,
            engine: Some(Engine::Postgres),
            created_at: Utc::now() - Duration::hours(2),
            size_bytes: 1,
            compression: crate::archive::Compression::Gzip,
            path: dir.path().join("base.dump.gz"),
            extra: Default::default(),
        };
        let driver = crate::postgres::PostgresDriver::new(
            pg_config(),
            dir.path().join("base_backups"),
            dir.path().join("emergency"),
            None,
            6,
            StdDuration::from_secs(5),
        );
        match m
            .restore_to_timestamp(&driver, &base, Utc::now() - Duration::hours(1))
            .await
        {
            Err(BackupError::Configuration(_)) => {}
            other => panic!("expected Configuration, got {other:?}"),
        }
    }
}
