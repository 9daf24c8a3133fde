//! Caller-facing query surface.
//!
//! [`CostIntelligence`] wires the ledger client, statistics and query pipeline
//! together and applies the sensitive-data policy: user- and query-level detail
//! only leaves this module when sensitive data access is enabled, otherwise the
//! aggregate-only view is returned instead.

use crate::aggregator::{Aggregator, CostSeries, Dimension, parse_dimensions};
use crate::cache::CacheStats;
use crate::config::CostwatchConfig;
use crate::detector::{AnomalyDetector, AnomalyFinding, AnomalySummary, Sensitivity};
use crate::error::{CostError, Result};
use crate::estimator::{QueryEstimate, QueryEstimator, RiskLevel};
use crate::forecaster::{ForecastResult, Forecaster, MAX_HORIZON_DAYS, MIN_POINTS};
use crate::ledger::LedgerClient;
use crate::optimizer::{OptimizationOutcome, QueryOptimizer};
use crate::permissions::PermissionState;
use chrono::{DateTime, Duration, Utc};
use costwatch_abstraction::{LedgerGateway, OptimizationGoal, RewriteOracle, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The `days` whole UTC days up to and including today.
#[must_use]
pub fn trailing_days_window(now: DateTime<Utc>, days: i64) -> TimeRange {
    let today = now.date_naive().and_hms_opt(0, 0, 0).map_or(now, |t| t.and_utc());
    let end = today + Duration::days(1);
    TimeRange::new(end - Duration::days(days.max(1)), end)
}

/// Aggregated spend for a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Range covered.
    pub range: TimeRange,
    /// Dimensions actually applied.
    pub dimensions: Vec<Dimension>,
    /// One series per dimension key.
    pub series: Vec<CostSeries>,
    /// Spend across all series.
    pub total_cost_usd: f64,
    /// A user-level dimension was requested but dropped.
    pub redacted: bool,
}

/// Findings for a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    /// Range examined.
    pub range: TimeRange,
    /// Sensitivity applied.
    pub sensitivity: Sensitivity,
    /// Effective threshold after sensitivity scaling.
    pub effective_threshold: f64,
    /// Findings, deviation descending.
    pub findings: Vec<AnomalyFinding>,
    /// Roll-up of the findings.
    pub summary: AnomalySummary,
    /// A user-level dimension was requested but dropped.
    pub redacted: bool,
}

/// One expensive job (sensitive view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCostEntry {
    /// Backend job id.
    pub query_id: String,
    /// Submitting principal.
    pub user: String,
    /// Dataset read.
    pub dataset: String,
    /// Statement class.
    pub query_class: String,
    /// When it ran.
    pub timestamp: DateTime<Utc>,
    /// Bytes billed.
    pub bytes_processed: u64,
    /// Cost in USD.
    pub cost_usd: f64,
}

/// Spend of one statement class (aggregate view).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryClassCost {
    /// Statement class.
    pub query_class: String,
    /// Jobs of this class.
    pub query_count: u64,
    /// Bytes billed.
    pub bytes_processed: u64,
    /// Cost in USD.
    pub total_cost_usd: f64,
}

/// Most expensive work in a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum ExpensiveQueries {
    /// Individual jobs, sensitive data access enabled.
    Detailed {
        /// Jobs, cost descending.
        queries: Vec<QueryCostEntry>,
    },
    /// Rolled up by statement class.
    ByClass {
        /// Classes, cost descending.
        classes: Vec<QueryClassCost>,
    },
}

/// Spend of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSpend {
    /// Principal.
    pub user: String,
    /// Jobs submitted.
    pub query_count: u64,
    /// Cost in USD.
    pub total_cost_usd: f64,
}

/// Health and configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Project observed.
    pub project_id: String,
    /// Backend region.
    pub region: String,
    /// Mutating actions allowed.
    pub write_enabled: bool,
    /// User-level detail allowed.
    pub sensitive_data_enabled: bool,
    /// Job-record cache.
    pub jobs_cache: CacheStats,
    /// Dry-run cache.
    pub dry_run_cache: CacheStats,
    /// Backend concurrency limit.
    pub max_concurrent_calls: usize,
    /// Backend calls currently in flight.
    pub in_flight_calls: usize,
}

/// Cost intelligence engine.
#[derive(Debug, Clone)]
pub struct CostIntelligence {
    config: Arc<CostwatchConfig>,
    permissions: PermissionState,
    ledger: Arc<LedgerClient>,
    estimator: QueryEstimator,
    optimizer: QueryOptimizer,
    detector: AnomalyDetector,
    forecaster: Forecaster,
}

impl CostIntelligence {
    /// Builds the engine from configuration and collaborators.
    #[must_use]
    pub fn new(
        config: CostwatchConfig,
        permissions: PermissionState,
        gateway: Arc<dyn LedgerGateway>,
        oracle: Arc<dyn RewriteOracle>,
    ) -> Self {
        let ledger = Arc::new(LedgerClient::new(gateway, &config));
        let estimator = QueryEstimator::new(Arc::clone(&ledger), config.risk);
        let optimizer = QueryOptimizer::new(estimator.clone(), oracle);
        let detector = AnomalyDetector::from_config(&config.thresholds);
        let forecaster = Forecaster::from_config(&config.thresholds);
        Self {
            config: Arc::new(config),
            permissions,
            ledger,
            estimator,
            optimizer,
            detector,
            forecaster,
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &CostwatchConfig {
        &self.config
    }

    /// Permission state in use.
    #[must_use]
    pub fn permissions(&self) -> PermissionState {
        self.permissions
    }

    /// Spend in `range`, grouped by `dimensions` and bucketed by `bucket_size`.
    ///
    /// Without sensitive data access a `user` dimension is dropped and the
    /// result is flagged `redacted`.
    ///
    /// # Errors
    /// `InvalidDimension` for unknown dimensions (before any backend call),
    /// `BackendUnavailable` if the ledger cannot be read.
    pub async fn cost_breakdown<S: AsRef<str>>(
        &self,
        range: &TimeRange,
        dimensions: &[S],
        bucket_size: Duration,
    ) -> Result<CostBreakdown> {
        let (dims, redacted) = self.visible_dimensions(dimensions, "cost_breakdown")?;
        let records = self.ledger.list_jobs(range).await?;
        let series = Aggregator::aggregate_in_range(&records, &dims, bucket_size, range)?;
        let total_cost_usd = series.iter().map(CostSeries::total_cost).sum();
        Ok(CostBreakdown { range: *range, dimensions: dims, series, total_cost_usd, redacted })
    }

    /// Pre-execution estimate of `query_text`.
    ///
    /// # Errors
    /// See [`QueryEstimator::estimate`].
    pub async fn estimate(&self, query_text: &str) -> Result<QueryEstimate> {
        self.estimator.estimate(query_text).await
    }

    /// Verified rewrite candidates for `query_text`.
    ///
    /// `target_savings_pct` defaults to the configured target.
    ///
    /// # Errors
    /// See [`QueryOptimizer::optimize`].
    pub async fn optimize(
        &self,
        query_text: &str,
        goal: OptimizationGoal,
        target_savings_pct: Option<f64>,
    ) -> Result<OptimizationOutcome> {
        let base = self.estimator.estimate(query_text).await?;
        let target = target_savings_pct.unwrap_or(self.config.optimization.target_savings_pct);
        self.optimizer.optimize(query_text, &base, goal, target).await
    }

    /// Estimates `query_text` and, when it is at least `min_risk`, optimizes it.
    ///
    /// # Errors
    /// See [`CostIntelligence::optimize`].
    pub async fn estimate_and_optimize(
        &self,
        query_text: &str,
        goal: OptimizationGoal,
        min_risk: RiskLevel,
    ) -> Result<(QueryEstimate, Option<OptimizationOutcome>)> {
        let base = self.estimator.estimate(query_text).await?;
        if base.risk_level < min_risk {
            return Ok((base, None));
        }
        let outcome = self
            .optimizer
            .optimize(query_text, &base, goal, self.config.optimization.target_savings_pct)
            .await?;
        Ok((base, Some(outcome)))
    }

    /// Anomalous buckets in `range`.
    ///
    /// `sensitivity` defaults to the configured one; `dimensions` (default:
    /// date only) select which series are examined.
    ///
    /// # Errors
    /// `InvalidDimension`, `InsufficientData` when no series is long enough,
    /// `BackendUnavailable`.
    pub async fn anomalies<S: AsRef<str>>(
        &self,
        range: &TimeRange,
        sensitivity: Option<Sensitivity>,
        dimensions: &[S],
    ) -> Result<AnomalyReport> {
        let (dims, redacted) = self.visible_dimensions(dimensions, "anomalies")?;
        let sensitivity = sensitivity.unwrap_or(self.config.thresholds.anomaly_sensitivity);
        let threshold = self.config.thresholds.alert_threshold;

        let records = self.ledger.list_jobs(range).await?;
        let series =
            Aggregator::aggregate_in_range(&records, &dims, Aggregator::default_bucket(), range)?;
        let findings = self.detector.detect_all(&series, sensitivity, threshold)?;
        let summary = AnomalySummary::from_findings(&findings);

        info!(
            range = %range,
            sensitivity = %sensitivity,
            findings = summary.total,
            critical = summary.critical,
            "Anomaly scan complete"
        );
        Ok(AnomalyReport {
            range: *range,
            sensitivity,
            effective_threshold: sensitivity.effective_threshold(threshold),
            findings,
            summary,
            redacted,
        })
    }

    /// Daily spend forecast for `horizon_days` from the history in `lookback`.
    ///
    /// # Errors
    /// `InvalidDimension` or `InvalidParameter` for a horizon outside
    /// `1..=MAX_HORIZON_DAYS` (both before any backend call), `InsufficientData`,
    /// `BackendUnavailable`.
    pub async fn forecast<S: AsRef<str>>(
        &self,
        lookback: &TimeRange,
        horizon_days: u32,
        breakdown_by: &[S],
        scenario_analysis: bool,
    ) -> Result<ForecastResult> {
        if !(1..=MAX_HORIZON_DAYS).contains(&horizon_days) {
            return Err(CostError::invalid_parameter("horizon_days", horizon_days));
        }
        let (dims, _) = self.visible_dimensions(breakdown_by, "forecast")?;
        let records = self.ledger.list_jobs(lookback).await?;
        let bucket = Aggregator::default_bucket();

        let total = Aggregator::aggregate_in_range(&records, &[Dimension::Date.as_str()], bucket, lookback)?;
        let breakdowns = if dims.iter().any(|d| *d != Dimension::Date) {
            Aggregator::aggregate_in_range(&records, &dims, bucket, lookback)?
        } else {
            Vec::new()
        };

        let Some(total) = total.into_iter().next() else {
            return Err(CostError::InsufficientData {
                series: "total".to_string(),
                points: 0,
                required: MIN_POINTS,
            });
        };
        self.forecaster.forecast(&total, horizon_days, &breakdowns, scenario_analysis)
    }

    /// The `limit` most expensive jobs in `range`, or their statement classes
    /// when sensitive data access is disabled.
    ///
    /// # Errors
    /// `InvalidParameter` for a zero limit, `BackendUnavailable`.
    pub async fn expensive_queries(&self, range: &TimeRange, limit: usize) -> Result<ExpensiveQueries> {
        if limit == 0 {
            return Err(CostError::invalid_parameter("limit", limit));
        }
        let records = self.ledger.list_jobs(range).await?;

        if self.permissions.sensitive_data_enabled() {
            let mut queries: Vec<QueryCostEntry> = records
                .iter()
                .map(|r| QueryCostEntry {
                    query_id: r.query_id.clone(),
                    user: r.user.clone(),
                    dataset: r.dataset.clone(),
                    query_class: r.query_class.clone(),
                    timestamp: r.timestamp,
                    bytes_processed: r.bytes_processed,
                    cost_usd: r.cost_usd,
                })
                .collect();
            queries.sort_by(|a, b| b.cost_usd.total_cmp(&a.cost_usd).then_with(|| a.query_id.cmp(&b.query_id)));
            queries.truncate(limit);
            return Ok(ExpensiveQueries::Detailed { queries });
        }

        warn!(operation = "expensive_queries", "Sensitive data disabled, returning class roll-up");
        let mut by_class: HashMap<&str, QueryClassCost> = HashMap::new();
        for record in records.iter() {
            let entry = by_class.entry(record.query_class.as_str()).or_insert_with(|| QueryClassCost {
                query_class: record.query_class.clone(),
                query_count: 0,
                bytes_processed: 0,
                total_cost_usd: 0.0,
            });
            entry.query_count += 1;
            entry.bytes_processed += record.bytes_processed;
            entry.total_cost_usd += record.cost_usd;
        }
        let mut classes: Vec<QueryClassCost> = by_class.into_values().collect();
        classes.sort_by(|a, b| {
            b.total_cost_usd.total_cmp(&a.total_cost_usd).then_with(|| a.query_class.cmp(&b.query_class))
        });
        classes.truncate(limit);
        Ok(ExpensiveQueries::ByClass { classes })
    }

    /// The `limit` biggest spenders in `range`.
    ///
    /// # Errors
    /// `PermissionDenied` (before any backend call) without sensitive data
    /// access, `InvalidParameter` for a zero limit, `BackendUnavailable`.
    pub async fn top_users(&self, range: &TimeRange, limit: usize) -> Result<Vec<UserSpend>> {
        self.permissions.require_sensitive("top_users")?;
        if limit == 0 {
            return Err(CostError::invalid_parameter("limit", limit));
        }
        let records = self.ledger.list_jobs(range).await?;

        let mut by_user: HashMap<&str, UserSpend> = HashMap::new();
        for record in records.iter() {
            let entry = by_user.entry(record.user.as_str()).or_insert_with(|| UserSpend {
                user: record.user.clone(),
                query_count: 0,
                total_cost_usd: 0.0,
            });
            entry.query_count += 1;
            entry.total_cost_usd += record.cost_usd;
        }
        let mut users: Vec<UserSpend> = by_user.into_values().collect();
        users.sort_by(|a, b| b.total_cost_usd.total_cmp(&a.total_cost_usd).then_with(|| a.user.cmp(&b.user)));
        users.truncate(limit);
        Ok(users)
    }

    /// Current configuration and cache/limiter health.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            project_id: self.config.project.id.clone(),
            region: self.config.project.region.clone(),
            write_enabled: self.permissions.write_enabled(),
            sensitive_data_enabled: self.permissions.sensitive_data_enabled(),
            jobs_cache: self.ledger.jobs_cache_stats(),
            dry_run_cache: self.ledger.dry_run_cache_stats(),
            max_concurrent_calls: self.ledger.limiter().max_concurrent(),
            in_flight_calls: self.ledger.limiter().in_flight(),
        }
    }

    fn visible_dimensions<S: AsRef<str>>(
        &self,
        requested: &[S],
        operation: &str,
    ) -> Result<(Vec<Dimension>, bool)> {
        let mut dims = parse_dimensions(requested)?;
        let before = dims.len();
        if !self.permissions.sensitive_data_enabled() {
            dims.retain(|d| !d.is_sensitive());
        }
        let redacted = dims.len() != before;
        if redacted {
            warn!(operation = %operation, "Sensitive data disabled, dropping user dimension");
        }
        Ok((dims, redacted))
    }
}
