//! Pre-execution query cost estimation.

use crate::config::RiskThresholds;
use crate::error::{CostError, Result};
use crate::ledger::{LedgerClient, query_fingerprint};
use costwatch_abstraction::ColumnSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const BYTES_PER_TB: f64 = 1e12;

/// Risk band of a query estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Cheap.
    Low,
    /// Worth a look.
    Medium,
    /// Expensive.
    High,
    /// Very expensive or scans a huge amount of data.
    Critical,
}

impl fmt::Display for RiskLevel {
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

/// Classifies an estimate against fixed bounds.
#[must_use]
pub fn classify_risk(bytes: u64, cost_usd: f64, thresholds: &RiskThresholds) -> RiskLevel {
    if bytes >= thresholds.critical_bytes || cost_usd >= thresholds.high_cost_usd {
        RiskLevel::Critical
    } else if cost_usd >= thresholds.medium_cost_usd {
        RiskLevel::High
    } else if cost_usd >= thresholds.low_cost_usd {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Cost estimate of a single query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEstimate {
    /// Fingerprint of the normalized query text.
    pub query_text_hash: String,
    /// Bytes the query would scan.
    pub bytes_estimated: u64,
    /// Estimated cost in USD.
    pub cost_estimated_usd: f64,
    /// Risk band.
    pub risk_level: RiskLevel,
}

impl QueryEstimate {
    /// Estimated scan size in (decimal) terabytes.
    #[must_use]
    pub fn terabytes(&self) -> f64 {
        self.bytes_estimated as f64 / BYTES_PER_TB
    }
}

/// Estimate plus the output schema reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailedEstimate {
    /// The estimate.
    pub estimate: QueryEstimate,
    /// Output columns, empty when the backend did not report them.
    pub schema: Vec<ColumnSchema>,
}

/// Turns dry runs into classified estimates.
#[derive(Debug, Clone)]
pub struct QueryEstimator {
    ledger: Arc<LedgerClient>,
    thresholds: RiskThresholds,
}

impl QueryEstimator {
    /// Creates an estimator backed by `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<LedgerClient>, thresholds: RiskThresholds) -> Self {
        Self { ledger, thresholds }
    }

    /// Risk bounds in use.
    #[must_use]
    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    /// Estimates `query_text` without executing it.
    ///
    /// # Errors
    /// Returns `QuerySyntaxError` when the backend rejects the query and
    /// `BackendUnavailable` when it cannot be reached.
    pub async fn estimate(&self, query_text: &str) -> Result<QueryEstimate> {
        Ok(self.estimate_detailed(query_text).await?.estimate)
    }

    /// Like [`QueryEstimator::estimate`] but also returns the output schema.
    ///
    /// # Errors
    /// See [`QueryEstimator::estimate`].
    pub async fn estimate_detailed(&self, query_text: &str) -> Result<DetailedEstimate> {
        if query_text.trim().is_empty() {
            return Err(CostError::QuerySyntaxError { message: "empty query text".to_string() });
        }

        let dry_run = self.ledger.dry_run(query_text).await?;
        let risk_level =
            classify_risk(dry_run.bytes_processed, dry_run.cost_estimate_usd, &self.thresholds);
        let estimate = QueryEstimate {
            query_text_hash: query_fingerprint(query_text),
            bytes_estimated: dry_run.bytes_processed,
            cost_estimated_usd: dry_run.cost_estimate_usd,
            risk_level,
        };
        debug!(
            hash = %estimate.query_text_hash,
            bytes = estimate.bytes_estimated,
            cost_usd = estimate.cost_estimated_usd,
            risk = %risk_level,
            "Query estimated"
        );
        Ok(DetailedEstimate { estimate, schema: dry_run.schema })
    }
}
