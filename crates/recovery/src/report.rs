/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Recovery reports
//!
//! One report per playbook run, persisted as
//! `recovery_report_<timestamp>.json` in the archive catalog directory
//! for audit, and dispatched over the configured notification channels.
//! Notification delivery failure never fails the run that produced the
//! report.

use crate::detector::{DisasterDiagnosis, SeverityTier};
use crate::error::{RecoveryError, Result};
use chrono::{DateTime, Utc};
use common::{MetricsSnapshot, Notification, NotifierSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Outcome of one attempted remediation action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub tier: SeverityTier,
    /// The diagnosis that selected the tier, embedded for audit.
    pub diagnosis: DisasterDiagnosis,
    /// Every action attempted, in execution order.
    pub actions_taken: Vec<ActionOutcome>,
    /// True only if every attempted action succeeded.
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_recovery_status: Option<MetricsSnapshot>,
    pub recommendations: Vec<String>,
}

impl RecoveryReport {
    pub fn errors(&self) -> Vec<&ActionOutcome> {
        self.actions_taken.iter().filter(|a| !a.succeeded).collect()
    }

    /// Persist into the catalog directory. Returns the report path.
    pub fn persist(&self, catalog_dir: &Path) -> Result<PathBuf> {
        let slug = self.started_at.format("%Y%m%d_%H%M%S");
        let path = catalog_dir.join(format!("recovery_report_{slug}.json"));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?).map_err(|e| {
            RecoveryError::ReportPersistence {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        info!(path = %path.display(), "recovery report written");
        Ok(path)
    }

    /// Fire-and-forget dispatch over the notification channels.
    pub async fn notify(&self, notifiers: &NotifierSet) {
        let subject = if self.success {
            format!("Recovery succeeded ({} tier)", self.tier.as_str())
        } else {
            format!("Recovery FAILED ({} tier)", self.tier.as_str())
        };
        let mut body = String::new();
        for outcome in &self.actions_taken {
            let line = match &outcome.error {
                None => format!("ok   {}\n", outcome.action),
                Some(e) => format!("FAIL {}: {e}\n", outcome.action),
            };
            body.push_str(&line);
        }
        for rec in &self.recommendations {
            body.push_str(&format!("next: {rec}\n"));
        }
        let notification = if self.success {
            Notification::info(subject, body)
        } else {
            Notification::critical(subject, body)
        };
        notifiers.dispatch(&notification).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_report(success: bool) -> RecoveryReport {
        RecoveryReport {
            started_at: Utc::now(),
            completed_at: Utc::now(),
            tier: SeverityTier::High,
            diagnosis: DisasterDiagnosis {
                detected: true,
                tier: SeverityTier::High,
                score: 55,
                indicators: vec!["database_unreachable".into()],
                recommendations: vec![],
            },
            actions_taken: vec![
                ActionOutcome {
                    action: "kill_orphaned_workers".into(),
                    succeeded: true,
                    error: None,
                },
                ActionOutcome {
                    action: "repair_database".into(),
                    succeeded: success,
                    error: if success { None } else { Some("boom".into()) },
                },
            ],
            success,
            post_recovery_status: None,
            recommendations: vec!["verify application health".into()],
        }
    }

    #[test]
    fn report_persists_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let report = sample_report(true);
        let path = report.persist(dir.path()).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("recovery_report_"));

        let loaded: RecoveryReport =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded.actions_taken.len(), 2);
        assert!(loaded.success);
    }

    #[test]
    fn errors_lists_only_failures() {
        let report = sample_report(false);
        let errors = report.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].action, "repair_database");
    }
}
