/*
 * SPDX-FileCopyrightText: 2024 PassPrint <admin@passprint.com>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Disaster detection
//!
//! [`evaluate`] is a pure function from a telemetry snapshot and the
//! configured thresholds to a [`DisasterDiagnosis`]. Each independent
//! indicator contributes a fixed weight when triggered; the weights sum
//! to a 0-100 score mapped onto severity tiers. A missing telemetry
//! field means "indicator not triggered", never an error.

use common::{DisasterThresholds, MetricsSnapshot};
use serde::{Deserialize, Serialize};

/// Fixed indicator weights. Together they cap at a score well past the
/// critical band; the bands, not the sum, define the tiers.
const WEIGHT_DATABASE_UNHEALTHY: u32 = 30;
const WEIGHT_ERROR_RATE: u32 = 25;
const WEIGHT_CPU: u32 = 15;
const WEIGHT_MEMORY: u32 = 15;
const WEIGHT_DISK: u32 = 20;
const WEIGHT_SECURITY: u32 = 25;

/// Severity bands over the summed indicator score.
const TIER_CRITICAL: u32 = 70;
const TIER_HIGH: u32 = 40;
const TIER_MEDIUM: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeverityTier {
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    fn from_score(score: u32) -> Self {
        if score >= TIER_CRITICAL {
            Self::Critical
        } else if score >= TIER_HIGH {
            Self::High
        } else if score >= TIER_MEDIUM {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Point-in-time evaluation result. Ephemeral: consumed immediately by
/// the playbook runner and the notification channels, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisasterDiagnosis {
    pub detected: bool,
    pub tier: SeverityTier,
    pub score: u32,
    /// Names of the indicators that triggered, in evaluation order.
    pub indicators: Vec<String>,
    /// Remediation recommendations, highest-impact first.
    pub recommendations: Vec<String>,
}

/// Evaluate one telemetry snapshot against the configured thresholds.
///
/// Deterministic: identical input always yields an identical diagnosis,
/// and adding a triggered indicator never lowers the score.
pub fn evaluate(snapshot: &MetricsSnapshot, thresholds: &DisasterThresholds) -> DisasterDiagnosis {
    let mut score = 0u32;
    let mut indicators = Vec::new();
    let mut recommendations = Vec::new();

    if snapshot.connection_healthy() == Some(false) {
        score += WEIGHT_DATABASE_UNHEALTHY;
        indicators.push("database_unreachable".to_string());
        recommendations.push("restart the database service and verify connectivity".to_string());
    }

    if let Some(rate) = snapshot.error_rate_percent() {
        if rate > thresholds.error_rate_percent {
            score += WEIGHT_ERROR_RATE;
            indicators.push("elevated_error_rate".to_string());
            recommendations
                .push("inspect application logs for the dominant error class".to_string());
        }
    }

    let saturation = thresholds.resource_exhaustion_percent;
    if snapshot.cpu_percent().map(|p| p > saturation).unwrap_or(false) {
        score += WEIGHT_CPU;
        indicators.push("cpu_exhaustion".to_string());
        recommendations.push("identify and restart runaway processes".to_string());
    }
    if snapshot
        .memory_percent()
        .map(|p| p > saturation)
        .unwrap_or(false)
    {
        score += WEIGHT_MEMORY;
        indicators.push("memory_exhaustion".to_string());
        recommendations.push("restart the worker pool to release memory".to_string());
    }
    if snapshot
        .disk_percent()
        .map(|p| p > saturation)
        .unwrap_or(false)
    {
        score += WEIGHT_DISK;
        indicators.push("disk_exhaustion".to_string());
        recommendations.push("prune old archives and clear transient caches".to_string());
    }

    if let Some(security_score) = snapshot.security_score() {
        if security_score < thresholds.security_score_floor {
            score += WEIGHT_SECURITY;
            indicators.push("security_degradation".to_string());
            recommendations.push("review recent security events before recovery".to_string());
        }
    }

    let tier = SeverityTier::from_score(score);
    DisasterDiagnosis {
        detected: !indicators.is_empty(),
        tier,
        score,
        indicators,
        recommendations,
    }
}
