//! Data types exchanged with collaborators.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single billed job as reported by the ledger.
///
/// Records are immutable once fetched; the ledger is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    /// When the job ran.
    pub timestamp: DateTime<Utc>,
    /// Project the job was billed to.
    pub project: String,
    /// Primary dataset the job read from.
    pub dataset: String,
    /// Principal that submitted the job.
    pub user: String,
    /// Backend job identifier.
    pub query_id: String,
    /// Bytes billed for the job.
    pub bytes_processed: u64,
    /// Cost of the job in USD.
    pub cost_usd: f64,
    /// Statement class (e.g. `select`, `merge`, `create_table_as_select`).
    pub query_class: String,
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Creates a range from `start` (inclusive) to `end` (exclusive).
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `days` days immediately preceding `end`.
    #[must_use]
    pub fn trailing_days(end: DateTime<Utc>, days: i64) -> Self {
        Self { start: end - Duration::days(days), end }
    }

    /// Returns `true` if `ts` lies inside the range.
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Returns `true` if the range covers no time at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Length of the range.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// One column of a query's output schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Output column name.
    pub name: String,
    /// Backend data type (e.g. `STRING`, `INT64`).
    pub data_type: String,
}

impl ColumnSchema {
    /// Creates a column description.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self { name: name.into(), data_type: data_type.into() }
    }
}

/// Result of a non-executing estimation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunResult {
    /// Bytes the query would scan.
    pub bytes_processed: u64,
    /// Estimated on-demand cost in USD.
    pub cost_estimate_usd: f64,
    /// Output schema, when the backend reports it. Empty if unknown.
    #[serde(default)]
    pub schema: Vec<ColumnSchema>,
}

/// What a rewrite should optimize for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationGoal {
    /// Minimize bytes billed.
    Cost,
    /// Minimize latency and slot usage.
    Performance,
    /// Balance both.
    Both,
}

impl fmt::Display for OptimizationGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cost => write!(f, "cost"),
            Self::Performance => write!(f, "performance"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// A pull request to be opened by the source-control collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Repository in `owner/name` form.
    pub repository: String,
    /// Branch the change targets.
    pub base_branch: String,
    /// Pull request title.
    pub title: String,
    /// Unified diff or replacement text.
    pub diff: String,
    /// Requested reviewers.
    #[serde(default)]
    pub reviewers: Vec<String>,
}

/// Severity attached to an outgoing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate attention.
    Critical,
}

/// A chat notification to be delivered by the notifier collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Destination channel.
    pub channel: String,
    /// Message body.
    pub message: String,
    /// Severity of the alert.
    pub severity: AlertSeverity,
    /// Users or groups to mention.
    #[serde(default)]
    pub mentions: Vec<String>,
}

/// Acknowledgement returned after a notification was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    /// Channel the message landed in.
    pub channel: String,
    /// Collaborator-assigned message id.
    pub message_id: String,
    /// Delivery time.
    pub delivered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_range_contains_is_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, start + Duration::days(1));
        assert!(range.contains(start));
        assert!(range.contains(start + Duration::hours(23)));
        assert!(!range.contains(start + Duration::days(1)));
        assert!(!range.is_empty());
    }

    #[test]
    fn test_trailing_days() {
        let end = Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap();
        let range = TimeRange::trailing_days(end, 7);
        assert_eq!(range.duration(), Duration::days(7));
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_goal_serde_lowercase() {
        let json = serde_json::to_string(&OptimizationGoal::Performance).unwrap();
        assert_eq!(json, "\"performance\"");
        let goal: OptimizationGoal = serde_json::from_str("\"both\"").unwrap();
        assert_eq!(goal, OptimizationGoal::Both);
    }

    #[test]
    fn test_dry_run_schema_defaults_to_empty() {
        let json = r#"{"bytes_processed": 1024, "cost_estimate_usd": 0.5}"#;
        let result: DryRunResult = serde_json::from_str(json).unwrap();
        assert!(result.schema.is_empty());
    }
}
