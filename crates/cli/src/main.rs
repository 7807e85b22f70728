/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! `ppdr` — PassPrint backup and disaster-recovery command line.

use backup::{
    ArchiveCatalog, BackupOrchestrator, PitrManager, PostgresDriver, RestoreTarget, SqliteDriver,
    StorageBackupDriver,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use common::{MetricsSnapshot, NotifierSet};
use recovery::{
    evaluate, generate_recovery_scripts, RecoveryPlaybookRunner, RepairTarget, ScriptContext,
    SystemCommandRunner,
};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

mod config;

use config::{AppConfig, EngineChoice};

#[derive(Parser)]
#[command(name = "ppdr", about = "PassPrint backup and disaster recovery", version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "ppdr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backup
    Backup {
        #[command(subcommand)]
        kind: BackupKind,
    },
    /// Restore an archive over the live system
    Restore {
        /// Path to the archive (its metadata sidecar must sit next to it)
        archive: PathBuf,
        /// Restore a database archive into this file instead of the live
        /// database
        #[arg(long)]
        to_file: Option<PathBuf>,
    },
    /// Enforce retention over archives, snapshots and the journal
    Prune,
    /// Verify one archive's structural integrity
    Verify { archive: PathBuf },
    /// Point-in-time recovery management
    Pitr {
        #[command(subcommand)]
        action: PitrAction,
    },
    /// Evaluate a telemetry snapshot and print the diagnosis
    Detect {
        /// JSON metrics snapshot file
        metrics: PathBuf,
    },
    /// Evaluate a telemetry snapshot and run the matching playbook
    Recover {
        /// JSON metrics snapshot file
        metrics: PathBuf,
        /// Run the playbook even when no disaster is detected
        #[arg(long)]
        force: bool,
    },
    /// Write the backup strategy report into the catalog
    Strategy,
    /// Generate the operator recovery scripts
    GenScripts {
        /// Destination directory
        #[arg(long, default_value = "recovery_scripts")]
        dest: PathBuf,
    },
}

#[derive(Subcommand)]
enum BackupKind {
    /// Database + fileset + snapshot
    Full,
    /// Changes since the newest full base (PostgreSQL with WAL archiving)
    Diff,
    /// Snapshot of the newest database and fileset archives
    Snapshot,
}

#[derive(Subcommand)]
enum PitrAction {
    /// Install WAL archiving artifacts and probe the server
    Setup,
    /// Restore the database to a timestamp
    Restore {
        /// Full base archive created before the target time
        #[arg(long)]
        base: PathBuf,
        /// Recovery target, RFC 3339 (e.g. 2026-08-29T12:00:00Z)
        #[arg(long)]
        at: DateTime<Utc>,
    },
    /// Delete archived WAL segments past the retention window
    PruneWal,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;
    let catalog = ArchiveCatalog::new(&config.backup.backup_dir);
    let driver = build_driver(&config, &catalog)?;
    let orchestrator = Arc::new(BackupOrchestrator::new(
        config.backup.clone(),
        config.retention,
        driver.clone(),
        NotifierSet::from_config(&config.notify),
    ));

    match cli.command {
        Commands::Backup { kind } => match kind {
            BackupKind::Full => {
                let outcome = orchestrator.full_backup().await?;
                println!("status: {:?}", outcome.status);
                for error in &outcome.errors {
                    println!("  {error}");
                }
                if outcome.errors.is_empty() {
                    Ok(ExitCode::SUCCESS)
                } else {
                    Ok(ExitCode::FAILURE)
                }
            }
            BackupKind::Diff => {
                let archive = orchestrator.differential_backup().await?;
                println!("{}", archive.path.display());
                Ok(ExitCode::SUCCESS)
            }
            BackupKind::Snapshot => {
                let dir = orchestrator.snapshot().await?;
                println!("{}", dir.display());
                Ok(ExitCode::SUCCESS)
            }
        },
        Commands::Restore { archive, to_file } => {
            let target = match to_file {
                Some(path) => RestoreTarget::File(path),
                None => RestoreTarget::LiveDatabase,
            };
            orchestrator.restore(&archive, &target).await?;
            println!("restored {}", archive.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Prune => {
            let outcome = orchestrator.prune()?;
            println!(
                "removed {} archives, {} snapshots, {} journal entries",
                outcome.archives_removed,
                outcome.snapshots_removed,
                outcome.journal_entries_removed
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify { archive } => {
            if orchestrator.verify(&archive)? {
                println!("ok: {}", archive.display());
                Ok(ExitCode::SUCCESS)
            } else {
                println!("FAILED: {}", archive.display());
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Pitr { action } => pitr(action, &config, driver.as_ref()).await,
        Commands::Detect { metrics } => {
            let diagnosis = evaluate(&load_metrics(&metrics)?, &config.thresholds);
            println!("{}", serde_json::to_string_pretty(&diagnosis)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Recover { metrics, force } => {
            let diagnosis = evaluate(&load_metrics(&metrics)?, &config.thresholds);
            if !diagnosis.detected && !force {
                println!("no disaster detected (score {})", diagnosis.score);
                return Ok(ExitCode::SUCCESS);
            }
            let repair_target = match config.engine {
                EngineChoice::Sqlite => RepairTarget::Sqlite(config.sqlite.clone()),
                EngineChoice::Postgresql => RepairTarget::Postgres(config.postgres()?),
            };
            let playbook = RecoveryPlaybookRunner::new(
                orchestrator.clone(),
                Arc::new(SystemCommandRunner::new(config.backup.process_timeout)),
                config.services.clone(),
                repair_target,
                NotifierSet::from_config(&config.notify),
            );
            let report = playbook.run(&diagnosis, None).await?;
            println!(
                "tier {} — {}",
                report.tier.as_str(),
                if report.success { "recovered" } else { "FAILED" }
            );
            if report.success {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Strategy => {
            let report = orchestrator.strategy_report(config.pitr.enabled)?;
            println!(
                "{} archives, {} snapshots, {} bytes",
                report.catalog.database_archives + report.catalog.fileset_archives,
                report.catalog.snapshots,
                report.catalog.total_bytes
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::GenScripts { dest } => {
            let ctx = ScriptContext {
                backup_dir: config.backup.backup_dir.clone(),
                services: config.services.clone(),
                cli_path: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ppdr")),
            };
            for path in generate_recovery_scripts(&dest, &ctx)? {
                println!("{}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn pitr(
    action: PitrAction,
    config: &AppConfig,
    driver: &dyn StorageBackupDriver,
) -> Result<ExitCode, Box<dyn Error>> {
    if config.engine != EngineChoice::Postgresql {
        return Err("point-in-time recovery requires the postgresql engine".into());
    }
    let mut manager = PitrManager::new(
        config.pitr.clone(),
        config.postgres()?,
        config.backup.process_timeout,
    );
    match action {
        PitrAction::Setup => {
            let state = manager.configure().await?;
            println!("pitr state: {state:?}");
            Ok(ExitCode::SUCCESS)
        }
        PitrAction::Restore { base, at } => {
            manager.configure().await?;
            let archive = backup::Archive::load(&base)?;
            manager.restore_to_timestamp(driver, &archive, at).await?;
            println!("restored to {at}");
            Ok(ExitCode::SUCCESS)
        }
        PitrAction::PruneWal => {
            let removed = manager.prune_wal()?;
            println!("removed {removed} WAL segments");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_metrics(path: &PathBuf) -> Result<MetricsSnapshot, Box<dyn Error>> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

fn build_driver(
    config: &AppConfig,
    catalog: &ArchiveCatalog,
) -> Result<Arc<dyn StorageBackupDriver>, Box<dyn Error>> {
    let driver: Arc<dyn StorageBackupDriver> = match config.engine {
        EngineChoice::Sqlite => Arc::new(SqliteDriver::new(
            &config.sqlite.db_path,
            catalog.emergency_dir(),
            config.backup.compression_level,
            config.backup.process_timeout,
        )),
        EngineChoice::Postgresql => Arc::new(PostgresDriver::new(
            config.postgres()?,
            catalog.base_dir(),
            catalog.emergency_dir(),
            config
                .pitr
                .enabled
                .then(|| config.pitr.wal_archive_dir.clone()),
            config.backup.compression_level,
            config.backup.process_timeout,
        )),
    };
    Ok(driver)
}
