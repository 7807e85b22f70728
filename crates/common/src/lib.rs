/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! # Shared types for the PassPrint backup and disaster-recovery stack
//!
//! This crate holds everything the backup engine and the recovery runner
//! both need but neither owns:
//!
//! - Configuration structs (injected into components, never read from
//!   ambient globals)
//! - The telemetry snapshot consumed by disaster detection
//! - Notification channels (email, webhook) with fire-and-forget delivery

pub mod config;
pub mod error;
pub mod notify;
pub mod telemetry;

pub use config::{
    BackupConfig, DisasterThresholds, NotifyConfig, PitrConfig, PostgresConfig, RetentionPolicy,
    ServicesConfig, SmtpConfig, SqliteConfig,
};
pub use error::{CommonError, Result};
pub use notify::{EmailNotifier, Notification, Notifier, NotifierSet, WebhookNotifier};
pub use telemetry::MetricsSnapshot;
