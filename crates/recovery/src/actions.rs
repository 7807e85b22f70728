/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Remediation actions
//!
//! Every side-effecting command the playbooks run goes through the
//! [`CommandRunner`] seam so playbook sequencing can be tested without a
//! live system. Actions are designed to be idempotent: restarting an
//! already-running unit, killing zero orphans and flushing an empty
//! cache are all clean successes. Each action reports its real outcome
//! so the playbook ledger reflects what actually happened.

use crate::error::{RecoveryError, Result};
use async_trait::async_trait;
use backup::pipeline::{run_command, Stage};
use backup::Engine;
use common::{PostgresConfig, ServicesConfig, SqliteConfig};
use std::time::Duration;
use tracing::{info, warn};

/// Executes one external command and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, stage: Stage) -> Result<String>;
}

/// Runs commands against the real system.
#[derive(Debug, Clone)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, stage: Stage) -> Result<String> {
        let output = run_command(&stage, self.timeout).await?;
        Ok(output.stdout)
    }
}

/// The storage engine a repair action should target.
#[derive(Debug, Clone)]
pub enum RepairTarget {
    Sqlite(SqliteConfig),
    Postgres(PostgresConfig),
}

impl RepairTarget {
    pub fn engine(&self) -> Engine {
        match self {
            Self::Sqlite(_) => Engine::Sqlite,
            Self::Postgres(_) => Engine::Postgres,
        }
    }
}

/// Named remediation primitives shared by the playbook runner and the
/// generated operator scripts.
pub struct RecoveryActions<'a> {
    runner: &'a dyn CommandRunner,
    services: &'a ServicesConfig,
}

impl<'a> RecoveryActions<'a> {
    pub fn new(runner: &'a dyn CommandRunner, services: &'a ServicesConfig) -> Self {
        Self { runner, services }
    }

    pub async fn restart_service(&self, unit: &str) -> Result<()> {
        info!(unit, "restarting service");
        self.runner
            .run(Stage::new("systemctl").arg("restart").arg(unit))
            .await
            .map_err(|e| RecoveryError::ActionFailed {
                action: format!("restart_service({unit})"),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    pub async fn restart_essential_services(&self) -> Result<()> {
        for unit in &self.services.essential_services {
            self.restart_service(unit).await?;
        }
        Ok(())
    }

    pub async fn restart_application(&self) -> Result<()> {
        self.restart_service(&self.services.app_service).await
    }

    pub async fn restart_workers(&self) -> Result<()> {
        self.restart_service(&self.services.worker_service).await
    }

    /// Terminate orphaned worker processes matching the configured
    /// pattern. Zero matches is a clean success.
    pub async fn kill_orphaned_workers(&self) -> Result<usize> {
        let pattern = &self.services.worker_process_pattern;
        let pids = match self
            .runner
            .run(Stage::new("pgrep").arg("-f").arg(pattern.clone()))
            .await
        {
            Ok(stdout) => stdout
                .lines()
                .filter_map(|l| l.trim().parse::<u32>().ok())
                .collect::<Vec<_>>(),
            // pgrep exits 1 on no matches.
            Err(_) => Vec::new(),
        };

        let mut killed = 0usize;
        for pid in pids {
            match self
                .runner
                .run(Stage::new("kill").arg(pid.to_string()))
                .await
            {
                Ok(_) => killed += 1,
                Err(e) => warn!(pid, "could not terminate orphan: {e}"),
            }
        }
        info!(killed, pattern = %pattern, "orphaned worker cleanup done");
        Ok(killed)
    }

    /// Engine-specific repair: reindex plus the engine's vacuum
    /// equivalent.
    pub async fn repair_database(&self, target: &RepairTarget) -> Result<()> {
        let outcome: Result<()> = async {
            match target {
                RepairTarget::Sqlite(config) => {
                    let db = config.db_path.to_string_lossy().into_owned();
                    self.runner
                        .run(Stage::new("sqlite3").arg(db.clone()).arg("REINDEX;"))
                        .await?;
                    self.runner
                        .run(Stage::new("sqlite3").arg(db).arg("VACUUM;"))
                        .await?;
                }
                RepairTarget::Postgres(config) => {
                    for sql in ["REINDEX DATABASE CONCURRENTLY;", "VACUUM ANALYZE;", "CHECKPOINT;"]
                    {
                        self.runner.run(psql(config, sql)).await?;
                    }
                }
            }
            Ok(())
        }
        .await;
        outcome.map_err(|e| RecoveryError::ActionFailed {
            action: format!("repair_database({})", target.engine()),
            reason: e.to_string(),
        })
    }

    /// Drop transient application caches. Flushing an empty cache is a
    /// clean success; an unreachable cache store is a failure the
    /// playbook records.
    pub async fn flush_caches(&self) -> Result<()> {
        self.runner
            .run(Stage::new("redis-cli").arg("FLUSHDB"))
            .await
            .map_err(|e| RecoveryError::ActionFailed {
                action: "flush_caches".to_string(),
                reason: e.to_string(),
            })?;
        info!("redis cache flushed");
        Ok(())
    }
}

fn psql(config: &PostgresConfig, sql: &str) -> Stage {
    Stage::new("psql")
        .arg(format!("--host={}", config.host))
        .arg(format!("--port={}", config.port))
        .arg(format!("--username={}", config.user))
        .arg(format!("--dbname={}", config.database))
        .arg("--no-password")
        .arg("--command")
        .arg(sql)
        .env("PGPASSWORD", config.password.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every command; fails those whose description contains a
    /// configured marker.
    pub(crate) struct ScriptedRunner {
        pub commands: Mutex<Vec<String>>,
        pub fail_marker: Option<String>,
        pub stdout: String,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                fail_marker: None,
                stdout: String::new(),
            }
        }

        pub fn failing_on(marker: &str) -> Self {
            Self {
                fail_marker: Some(marker.to_string()),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, stage: Stage) -> Result<String> {
            let description = stage.describe();
            self.commands.lock().unwrap().push(description.clone());
            if let Some(marker) = &self.fail_marker {
                if description.contains(marker.as_str()) {
                    return Err(RecoveryError::ActionFailed {
                        action: description,
                        reason: "scripted failure".into(),
                    });
                }
            }
            Ok(self.stdout.clone())
        }
    }

    #[tokio::test]
    async fn essential_services_restart_in_order() {
        let runner = ScriptedRunner::new();
        let services = ServicesConfig::default();
        let actions = RecoveryActions::new(&runner, &services);
        actions.restart_essential_services().await.unwrap();

        let commands = runner.commands.lock().unwrap();
        assert_eq!(
            commands.as_slice(),
            [
                "systemctl restart redis",
                "systemctl restart postgresql",
                "systemctl restart nginx"
            ]
        );
    }

    #[tokio::test]
    async fn no_orphans_is_a_clean_success() {
        let runner = ScriptedRunner::failing_on("pgrep");
        let services = ServicesConfig::default();
        let actions = RecoveryActions::new(&runner, &services);
        assert_eq!(actions.kill_orphaned_workers().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn orphans_are_killed_by_pid() {
        let mut runner = ScriptedRunner::new();
        runner.stdout = "101\n202\n".to_string();
        let services = ServicesConfig::default();
        let actions = RecoveryActions::new(&runner, &services);
        assert_eq!(actions.kill_orphaned_workers().await.unwrap(), 2);

        let commands = runner.commands.lock().unwrap();
        assert!(commands.iter().any(|c| c == "kill 101"));
        assert!(commands.iter().any(|c| c == "kill 202"));
    }

    #[tokio::test]
    async fn sqlite_repair_reindexes_and_vacuums() {
        let runner = ScriptedRunner::new();
        let services = ServicesConfig::default();
        let actions = RecoveryActions::new(&runner, &services);
        let target = RepairTarget::Sqlite(SqliteConfig {
            db_path: "/srv/passprint/app.db".into(),
        });
        actions.repair_database(&target).await.unwrap();

        let commands = runner.commands.lock().unwrap();
        assert!(commands[0].contains("REINDEX"));
        assert!(commands[1].contains("VACUUM"));
    }

    #[tokio::test]
    async fn cache_flush_surfaces_redis_failure() {
        let runner = ScriptedRunner::failing_on("redis-cli");
        let services = ServicesConfig::default();
        let actions = RecoveryActions::new(&runner, &services);
        match actions.flush_caches().await {
            Err(RecoveryError::ActionFailed { action, .. }) => {
                assert_eq!(action, "flush_caches");
            }
            other => panic!("expected ActionFailed, got {other:?}"),
        }
    }
}
