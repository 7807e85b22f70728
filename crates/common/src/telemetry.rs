/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Telemetry snapshot consumed by disaster detection
//!
//! The metrics collector that produces this document lives outside this
//! workspace; we only mirror its shape. Every field is optional: a missing
//! reading means "indicator not triggered", never an error.

use serde::{Deserialize, Serialize};

/// One point-in-time system metrics document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<ApplicationMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<ResourceGauge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<ResourceGauge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<ResourceGauge>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceGauge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<DatabaseStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_healthy: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_analysis: Option<LogAnalysis>,
}

/// Error counts over a trailing log window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogAnalysis {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_lines: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<SecurityEvents>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_score: Option<u32>,
}

impl MetricsSnapshot {
    pub fn cpu_percent(&self) -> Option<f64> {
        self.system.as_ref()?.cpu.as_ref()?.percent
    }

    pub fn memory_percent(&self) -> Option<f64> {
        self.system.as_ref()?.memory.as_ref()?.percent
    }

    pub fn disk_percent(&self) -> Option<f64> {
        self.system.as_ref()?.disk.as_ref()?.percent
    }

    pub fn connection_healthy(&self) -> Option<bool> {
        self.database.as_ref()?.stats.as_ref()?.connection_healthy
    }

    /// Error-rate ratio over the trailing log window, in percent.
    /// Returns None when the log analysis is missing or empty.
    pub fn error_rate_percent(&self) -> Option<f64> {
        let analysis = self
            .application
            .as_ref()?
            .performance
            .as_ref()?
            .log_analysis
            .as_ref()?;
        let total = analysis.total_lines?;
        if total == 0 {
            return None;
        }
        Some(analysis.error_count? as f64 / total as f64 * 100.0)
    }

    pub fn security_score(&self) -> Option<u32> {
        self.security.as_ref()?.events.as_ref()?.security_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_read_as_none() {
        let snapshot: MetricsSnapshot = serde_json::from_str("{}").unwrap();
        assert_eq!(snapshot.cpu_percent(), None);
        assert_eq!(snapshot.connection_healthy(), None);
        assert_eq!(snapshot.error_rate_percent(), None);
        assert_eq!(snapshot.security_score(), None);
    }

    #[test]
    fn nested_document_parses() {
        let json = r#"{
            "system": {"cpu": {"percent": 95.5}, "memory": {"percent": 40.0}, "disk": {"percent": 70.0}},
            "database": {"stats": {"connection_healthy": false}},
            "application": {"performance": {"log_analysis": {"error_count": 12, "total_lines": 100}}},
            "security": {"events": {"security_score": 65}}
        }"#;
        let snapshot: MetricsSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.cpu_percent(), Some(95.5));
        assert_eq!(snapshot.connection_healthy(), Some(false));
        assert_eq!(snapshot.error_rate_percent(), Some(12.0));
        assert_eq!(snapshot.security_score(), Some(65));
    }

    #[test]
    fn zero_log_lines_is_not_an_error_rate() {
        let json = r#"{"application": {"performance": {"log_analysis": {"error_count": 0, "total_lines": 0}}}}"#;
        let snapshot: MetricsSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.error_rate_percent(), None);
    }
}
