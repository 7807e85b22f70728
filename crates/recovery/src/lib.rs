/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! # PassPrint Disaster Recovery
//!
//! Threshold-driven disaster detection over externally collected
//! telemetry, plus the tiered remediation playbooks that act on a
//! diagnosis: service restarts, orphan cleanup, engine repair, cache
//! flushes and restore-from-latest, each run producing a persisted
//! [`report::RecoveryReport`].
//!
//! Detection ([`detector::evaluate`]) is a pure function; everything
//! side-effecting goes through the [`actions::CommandRunner`] seam.

pub mod actions;
pub mod detector;
pub mod error;
pub mod playbook;
pub mod report;
pub mod scripts;

pub use actions::{CommandRunner, RecoveryActions, RepairTarget, SystemCommandRunner};
pub use detector::{evaluate, DisasterDiagnosis, SeverityTier};
pub use error::{RecoveryError, Result};
pub use playbook::RecoveryPlaybookRunner;
pub use report::{ActionOutcome, RecoveryReport};
pub use scripts::{generate_recovery_scripts, ScriptContext};
