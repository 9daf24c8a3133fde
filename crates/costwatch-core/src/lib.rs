//! Costwatch Core - cost intelligence for a data-warehouse workload.
//!
//! This crate provides:
//! - Ledger access with a shared single-flight TTL cache, a FIFO concurrency
//!   limit and one bounded retry for transient backend failures
//! - Aggregation of job records into gap-free cost series
//! - Anomaly detection and spend forecasting over those series
//! - Pre-execution query estimation and verified rewrite optimization
//! - The permission state that gates sensitive and mutating operations
//!
//! # Example
//!
//! ```rust,no_run
//! use costwatch_core::{CostIntelligence, CostwatchConfig, PermissionState};
//! use costwatch_abstraction::mock::{InMemoryLedger, ScriptedOracle};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> costwatch_core::Result<()> {
//!     let config = CostwatchConfig::default();
//!     let permissions = PermissionState::from_config(&config);
//!     let engine = CostIntelligence::new(
//!         config,
//!         permissions,
//!         Arc::new(InMemoryLedger::default()),
//!         Arc::new(ScriptedOracle::default()),
//!     );
//!     let estimate = engine.estimate("SELECT 1").await?;
//!     println!("{} -> {}", estimate.cost_estimated_usd, estimate.risk_level);
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod detector;
pub mod equivalence;
pub mod error;
pub mod estimator;
pub mod forecaster;
pub mod ledger;
pub mod limiter;
pub mod optimizer;
pub mod permissions;
pub mod service;
pub mod stats;
pub mod telemetry;

pub use aggregator::{Aggregator, CostBucket, CostSeries, Dimension};
pub use cache::{CacheStats, ResultCache};
pub use config::{ConfigError, CostwatchConfig, WatchedQuery};
pub use detector::{AnomalyDetector, AnomalyFinding, AnomalySummary, Sensitivity, Severity};
pub use equivalence::{EquivalenceViolation, check_equivalence};
pub use error::{BackendCause, CostError, Result};
pub use estimator::{QueryEstimate, QueryEstimator, RiskLevel, classify_risk};
pub use forecaster::{
    ForecastPoint, ForecastResult, Forecaster, MAX_HORIZON_DAYS, ScenarioForecast, TrendDirection,
};
pub use ledger::{LedgerClient, query_fingerprint};
pub use limiter::ConcurrencyLimiter;
pub use optimizer::{OptimizationCandidate, OptimizationOutcome, QueryOptimizer};
pub use permissions::PermissionState;
pub use service::{
    AnomalyReport, CostBreakdown, CostIntelligence, ExpensiveQueries, StatusSnapshot, UserSpend,
    trailing_days_window,
};
