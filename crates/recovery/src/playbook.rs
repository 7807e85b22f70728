/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Tiered recovery playbooks
//!
//! The tier comes from the diagnosis once, before any action runs, and
//! never escalates mid-run. Actions execute strictly in order; a failing
//! action is recorded and later independent actions still run, with no
//! retry inside the run. The report's `success` flag is true only when
//! every attempted action succeeded.

use crate::actions::{CommandRunner, RecoveryActions, RepairTarget};
use crate::detector::{DisasterDiagnosis, SeverityTier};
use crate::error::Result;
use crate::report::{ActionOutcome, RecoveryReport};
use backup::{BackupOrchestrator, RestoreTarget};
use chrono::{Duration, Utc};
use common::{MetricsSnapshot, NotifierSet, ServicesConfig};
use std::sync::Arc;
use tracing::{info, warn};

pub struct RecoveryPlaybookRunner {
    orchestrator: Arc<BackupOrchestrator>,
    runner: Arc<dyn CommandRunner>,
    services: ServicesConfig,
    repair_target: RepairTarget,
    notifiers: NotifierSet,
}

impl RecoveryPlaybookRunner {
    pub fn new(
        orchestrator: Arc<BackupOrchestrator>,
        runner: Arc<dyn CommandRunner>,
        services: ServicesConfig,
        repair_target: RepairTarget,
        notifiers: NotifierSet,
    ) -> Self {
        Self {
            orchestrator,
            runner,
            services,
            repair_target,
            notifiers,
        }
    }

    /// Execute the playbook for the diagnosis' tier, persist the report
    /// into the archive catalog and dispatch it over the notification
    /// channels.
    pub async fn run(
        &self,
        diagnosis: &DisasterDiagnosis,
        post_recovery_status: Option<MetricsSnapshot>,
    ) -> Result<RecoveryReport> {
        let started_at = Utc::now();
        let tier = diagnosis.tier;
        info!(tier = tier.as_str(), score = diagnosis.score, "recovery playbook starting");

        let actions = RecoveryActions::new(self.runner.as_ref(), &self.services);
        let mut outcomes: Vec<ActionOutcome> = Vec::new();

        match tier {
            SeverityTier::Critical => {
                record(&mut outcomes, "snapshot_current_state", {
                    self.orchestrator.snapshot().await.map(|_| ())
                });
                record(
                    &mut outcomes,
                    "restart_essential_services",
                    actions.restart_essential_services().await,
                );
                record(
                    &mut outcomes,
                    "restore_newest_archive",
                    self.restore_newest_archive().await,
                );
            }
            SeverityTier::High => {
                record(
                    &mut outcomes,
                    "kill_orphaned_workers",
                    actions.kill_orphaned_workers().await.map(|_| ()),
                );
                record(
                    &mut outcomes,
                    "repair_database",
                    actions.repair_database(&self.repair_target).await,
                );
                record(
                    &mut outcomes,
                    "restart_application",
                    actions.restart_application().await,
                );
            }
            SeverityTier::Medium | SeverityTier::Low => {
                record(&mut outcomes, "flush_caches", actions.flush_caches().await);
                record(
                    &mut outcomes,
                    "restart_workers",
                    actions.restart_workers().await,
                );
            }
        }

        let success = outcomes.iter().all(|o| o.succeeded);
        let mut recommendations = diagnosis.recommendations.clone();
        if !success {
            recommendations.push(
                "run the generated recovery scripts manually and inspect failed actions".into(),
            );
        }
        recommendations.push("verify application health before resuming traffic".into());

        let report = RecoveryReport {
            started_at,
            completed_at: Utc::now(),
            tier,
            diagnosis: diagnosis.clone(),
            actions_taken: outcomes,
            success,
            post_recovery_status,
            recommendations,
        };

        if let Err(e) = report.persist(self.orchestrator.catalog().root()) {
            warn!("could not persist recovery report: {e}");
        }
        report.notify(&self.notifiers).await;

        info!(success, tier = tier.as_str(), "recovery playbook finished");
        Ok(report)
    }

    async fn restore_newest_archive(&self) -> std::result::Result<(), crate::error::RecoveryError> {
        let archive = self
            .orchestrator
            .catalog()
            .latest_archive_within(Duration::hours(24))?
            .ok_or_else(|| {
                crate::error::RecoveryError::config("no archive younger than 24h to restore")
            })?;
        self.orchestrator
            .restore(&archive.path, &RestoreTarget::LiveDatabase)
            .await?;
        Ok(())
    }
}

fn record<E: std::fmt::Display>(
    outcomes: &mut Vec<ActionOutcome>,
    action: &str,
    result: std::result::Result<(), E>,
) {
    match result {
        Ok(()) => outcomes.push(ActionOutcome {
            action: action.to_string(),
            succeeded: true,
            error: None,
        }),
        Err(e) => {
            warn!(action, "recovery action failed: {e}");
            outcomes.push(ActionOutcome {
                action: action.to_string(),
                succeeded: false,
                error: Some(e.to_string()),
            });
        }
    }
}
