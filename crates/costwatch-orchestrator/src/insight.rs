//! Agent insights and their ranking.

use chrono::{DateTime, Utc};
use costwatch_core::{RiskLevel, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// How urgently an insight needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsightPriority {
    /// Informational.
    Low,
    /// Worth a look.
    Medium,
    /// Needs attention soon.
    High,
    /// Needs attention now.
    Critical,
}

impl fmt::Display for InsightPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

impl From<Severity> for InsightPriority {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low => Self::Low,
            Severity::Medium => Self::Medium,
            Severity::High => Self::High,
            Severity::Critical => Self::Critical,
        }
    }
}

impl From<RiskLevel> for InsightPriority {
    fn from(risk: RiskLevel) -> Self {
        match risk {
            RiskLevel::Low => Self::Low,
            RiskLevel::Medium => Self::Medium,
            RiskLevel::High => Self::High,
            RiskLevel::Critical => Self::Critical,
        }
    }
}

/// One finding produced by an agent during a cycle.
///
/// Insights are never patched: every cycle recomputes them from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInsight {
    /// Unique id of this insight instance.
    pub id: Uuid,
    /// Agent that produced it.
    pub agent_name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Urgency.
    pub priority: InsightPriority,
    /// Stable reference to what the insight is about; the dedup key together
    /// with `agent_name`.
    pub payload_reference: String,
    /// One-line human readable summary.
    pub summary: String,
    /// Structured detail.
    #[serde(default)]
    pub detail: serde_json::Value,
    /// The agent failed and this insight stands in for its output.
    #[serde(default)]
    pub degraded: bool,
}

impl AgentInsight {
    /// Creates an insight stamped with the current time.
    pub fn new(
        agent_name: impl Into<String>,
        priority: InsightPriority,
        payload_reference: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_name: agent_name.into(),
            created_at: Utc::now(),
            priority,
            payload_reference: payload_reference.into(),
            summary: summary.into(),
            detail: serde_json::Value::Null,
            degraded: false,
        }
    }

    /// Attaches structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Stand-in for an agent that failed during a cycle.
    pub fn degraded(agent_name: &str, reason: impl fmt::Display) -> Self {
        let reason = reason.to_string();
        Self {
            degraded: true,
            ..Self::new(
                agent_name,
                InsightPriority::Low,
                format!("degraded:{}", agent_name),
                format!("Agent '{}' failed: {}", agent_name, reason),
            )
            .with_detail(serde_json::json!({ "error": reason }))
        }
    }
}

/// Deduplicates and orders insights.
///
/// Ordering is priority descending, then `created_at` ascending; equal keys
/// keep their input order. Of several insights sharing `(agent_name,
/// payload_reference)` only the first in that order is kept.
pub fn rank_insights(mut insights: Vec<AgentInsight>) -> Vec<AgentInsight> {
    insights.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.created_at.cmp(&b.created_at)));

    let mut seen = HashSet::new();
    insights.retain(|i| seen.insert((i.agent_name.clone(), i.payload_reference.clone())));
    insights
}
