//! Configuration for the cost engine.
//!
//! The configuration is read once at startup (TOML file plus a handful of
//! environment overrides) and is immutable afterwards.

use crate::detector::Sensitivity;
use crate::forecaster::MAX_HORIZON_DAYS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Environment variable overriding `project.id`.
pub const ENV_PROJECT_ID: &str = "COSTWATCH_PROJECT_ID";
/// Environment variable overriding `permissions.write_enabled`.
pub const ENV_ALLOW_WRITE: &str = "COSTWATCH_ALLOW_WRITE";
/// Environment variable overriding `permissions.sensitive_data_enabled`.
pub const ENV_ALLOW_SENSITIVE: &str = "COSTWATCH_ALLOW_SENSITIVE_DATA";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostwatchConfig {
    /// Project being observed.
    #[serde(default)]
    pub project: ProjectConfig,
    /// Result cache.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Backend call limits.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Detection and alerting thresholds.
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    /// Query risk classification bounds.
    #[serde(default)]
    pub risk: RiskThresholds,
    /// Optimizer settings.
    #[serde(default)]
    pub optimization: OptimizationConfig,
    /// Write and sensitive-data toggles.
    #[serde(default)]
    pub permissions: PermissionConfig,
    /// Per-agent settings.
    #[serde(default)]
    pub agents: AgentsConfig,
    /// Action collaborator settings.
    #[serde(default)]
    pub integrations: IntegrationsConfig,
}

/// Project identification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    /// Backend project id. Empty means "whatever the gateway defaults to".
    #[serde(default)]
    pub id: String,
    /// Backend region.
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "US".to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self { id: String::new(), region: default_region() }
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Seconds a memoized backend result stays valid (default: 300).
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum number of memoized results (default: 10_000).
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_max_entries() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: default_ttl_secs(), max_entries: default_max_entries() }
    }
}

impl CacheConfig {
    /// TTL as a `Duration`.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Backend call limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Maximum simultaneous in-flight ledger calls (default: 5).
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// Longest a caller waits in line for a free slot (default: 30s).
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// Delay before the single retry of a transient failure (default: 250ms).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_concurrent_calls() -> usize {
    5
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_retry_backoff_ms() -> u64 {
    250
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent_calls(),
            queue_timeout_ms: default_queue_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl BackendConfig {
    /// Queue wait bound as a `Duration`.
    #[must_use]
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// Retry backoff as a `Duration`.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Detection and alerting thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdConfig {
    /// Daily spend that counts as a budget breach, in USD.
    #[serde(default = "default_daily_cost_alert")]
    pub daily_cost_alert: f64,
    /// Per-query cost that deserves a warning, in USD.
    #[serde(default = "default_query_cost_warning")]
    pub query_cost_warning: f64,
    /// Default detection sensitivity.
    #[serde(default)]
    pub anomaly_sensitivity: Sensitivity,
    /// Base deviation ratio before sensitivity scaling.
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
    /// Days of history examined by detection.
    #[serde(default = "default_detection_window_days")]
    pub detection_window_days: i64,
    /// Trailing points used for the rolling baseline.
    #[serde(default = "default_baseline_window")]
    pub baseline_window: usize,
}

fn default_daily_cost_alert() -> f64 {
    1000.0
}

fn default_query_cost_warning() -> f64 {
    50.0
}

fn default_alert_threshold() -> f64 {
    0.25
}

fn default_detection_window_days() -> i64 {
    30
}

fn default_baseline_window() -> usize {
    7
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            daily_cost_alert: default_daily_cost_alert(),
            query_cost_warning: default_query_cost_warning(),
            anomaly_sensitivity: Sensitivity::default(),
            alert_threshold: default_alert_threshold(),
            detection_window_days: default_detection_window_days(),
            baseline_window: default_baseline_window(),
        }
    }
}

/// Cost and byte bounds used to classify query risk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RiskThresholds {
    /// Below this cost a query is LOW risk.
    #[serde(default = "default_low_cost_usd")]
    pub low_cost_usd: f64,
    /// Below this cost a query is MEDIUM risk.
    #[serde(default = "default_medium_cost_usd")]
    pub medium_cost_usd: f64,
    /// At or above this cost a query is CRITICAL.
    #[serde(default = "default_high_cost_usd")]
    pub high_cost_usd: f64,
    /// At or above this many bytes a query is CRITICAL regardless of cost.
    #[serde(default = "default_critical_bytes")]
    pub critical_bytes: u64,
}

fn default_low_cost_usd() -> f64 {
    1.0
}

fn default_medium_cost_usd() -> f64 {
    10.0
}

fn default_high_cost_usd() -> f64 {
    50.0
}

fn default_critical_bytes() -> u64 {
    1 << 40 // 1 TiB
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            low_cost_usd: default_low_cost_usd(),
            medium_cost_usd: default_medium_cost_usd(),
            high_cost_usd: default_high_cost_usd(),
            critical_bytes: default_critical_bytes(),
        }
    }
}

/// Optimizer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizationConfig {
    /// Savings percentage a rewrite should reach.
    #[serde(default = "default_target_savings_pct")]
    pub target_savings_pct: f64,
    /// Minimum savings (USD per run) before automation proposes a pull request.
    #[serde(default = "default_min_savings_for_pr")]
    pub min_savings_for_pr: f64,
}

fn default_target_savings_pct() -> f64 {
    25.0
}

fn default_min_savings_for_pr() -> f64 {
    100.0
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            target_savings_pct: default_target_savings_pct(),
            min_savings_for_pr: default_min_savings_for_pr(),
        }
    }
}

/// Permission toggles. Both default to disabled.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionConfig {
    /// Allow mutating actions (pull requests, alerts).
    #[serde(default)]
    pub write_enabled: bool,
    /// Allow user- and query-level detail in results.
    #[serde(default)]
    pub sensitive_data_enabled: bool,
}

/// A query the optimizer agents keep an eye on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchedQuery {
    /// Stable name, used in insight references and pull request titles.
    pub name: String,
    /// Query text.
    pub sql: String,
    /// Repository path of the file holding the query, if any.
    #[serde(default)]
    pub path: Option<String>,
}

/// Cost guard agent settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostGuardConfig {
    /// Whether the agent is registered.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Dispatch alerts for critical findings.
    #[serde(default = "default_true")]
    pub auto_alert: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CostGuardConfig {
    fn default() -> Self {
        Self { enabled: true, auto_alert: true }
    }
}

/// Query optimizer agent settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryOptimizerConfig {
    /// Whether the agent is registered.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Queries to estimate and optimize each cycle.
    #[serde(default)]
    pub watched_queries: Vec<WatchedQuery>,
}

impl Default for QueryOptimizerConfig {
    fn default() -> Self {
        Self { enabled: true, watched_queries: Vec::new() }
    }
}

/// SLA sentinel agent settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaSentinelConfig {
    /// Whether the agent is registered.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fraction of forecast days that must stay within budget.
    #[serde(default = "default_sla_threshold")]
    pub sla_threshold: f64,
    /// Forecast horizon in days.
    #[serde(default = "default_sla_horizon_days")]
    pub horizon_days: u32,
}

fn default_sla_threshold() -> f64 {
    0.95
}

fn default_sla_horizon_days() -> u32 {
    14
}

impl Default for SlaSentinelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sla_threshold: default_sla_threshold(),
            horizon_days: default_sla_horizon_days(),
        }
    }
}

/// Automation agent settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutomationConfig {
    /// Whether the agent is registered.
    #[serde(default)]
    pub enabled: bool,
    /// Repository pull requests are opened against.
    #[serde(default = "default_repository")]
    pub repository: String,
    /// Target branch.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Reviewers requested on every pull request.
    #[serde(default = "default_reviewers")]
    pub reviewers: Vec<String>,
}

fn default_repository() -> String {
    "data-platform/warehouse".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_reviewers() -> Vec<String> {
    vec!["data-engineering-team".to_string()]
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repository: default_repository(),
            base_branch: default_base_branch(),
            reviewers: default_reviewers(),
        }
    }
}

/// Per-agent settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentsConfig {
    /// Anomaly watcher.
    #[serde(default)]
    pub cost_guard: CostGuardConfig,
    /// Watched query optimizer.
    #[serde(default)]
    pub query_optimizer: QueryOptimizerConfig,
    /// Budget SLA watcher.
    #[serde(default)]
    pub sla_sentinel: SlaSentinelConfig,
    /// Pull request proposer.
    #[serde(default)]
    pub automation: AutomationConfig,
}

/// Notification channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationsConfig {
    /// Channel for ordinary alerts.
    #[serde(default = "default_alert_channel")]
    pub alert_channel: String,
    /// Channel for critical alerts.
    #[serde(default = "default_critical_channel")]
    pub critical_channel: String,
}

fn default_alert_channel() -> String {
    "#data-ops-alerts".to_string()
}

fn default_critical_channel() -> String {
    "#data-ops-critical".to_string()
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self { alert_channel: default_alert_channel(), critical_channel: default_critical_channel() }
    }
}

impl CostwatchConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    /// Returns `ConfigError` if parsing or validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `path` and applies environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup(ENV_PROJECT_ID) {
            self.project.id = id;
        }
        if let Some(flag) = lookup(ENV_ALLOW_WRITE) {
            self.permissions.write_enabled = parse_flag(&flag);
        }
        if let Some(flag) = lookup(ENV_ALLOW_SENSITIVE) {
            self.permissions.sensitive_data_enabled = parse_flag(&flag);
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` describing the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.cache.ttl_secs == 0 {
            return invalid("cache.ttl_secs must be greater than 0");
        }
        if self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be greater than 0");
        }
        if self.backend.max_concurrent_calls == 0 {
            return invalid("backend.max_concurrent_calls must be greater than 0");
        }
        if !(self.thresholds.alert_threshold.is_finite() && self.thresholds.alert_threshold > 0.0) {
            return invalid("thresholds.alert_threshold must be a positive number");
        }
        if self.thresholds.baseline_window < 2 {
            return invalid("thresholds.baseline_window must be at least 2");
        }
        if self.thresholds.detection_window_days <= self.thresholds.baseline_window as i64 {
            return invalid("thresholds.detection_window_days must exceed baseline_window");
        }
        let risk = &self.risk;
        if !(risk.low_cost_usd <= risk.medium_cost_usd && risk.medium_cost_usd <= risk.high_cost_usd)
        {
            return invalid("risk thresholds must satisfy low <= medium <= high");
        }
        let sla = self.agents.sla_sentinel.sla_threshold;
        if !(sla > 0.0 && sla <= 1.0) {
            return invalid("agents.sla_sentinel.sla_threshold must be in (0, 1]");
        }
        if !(1..=MAX_HORIZON_DAYS).contains(&self.agents.sla_sentinel.horizon_days) {
            return invalid("agents.sla_sentinel.horizon_days must be between 1 and 365");
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CostwatchConfig::default();
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.backend.max_concurrent_calls, 5);
        assert_eq!(config.thresholds.alert_threshold, 0.25);
        assert_eq!(config.thresholds.anomaly_sensitivity, Sensitivity::Medium);
        assert!(!config.permissions.write_enabled);
        assert!(!config.permissions.sensitive_data_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CostwatchConfig::from_toml_str(
            r#"
[project]
id = "analytics-prod"

[backend]
max_concurrent_calls = 2

[thresholds]
anomaly_sensitivity = "high"

[[agents.query_optimizer.watched_queries]]
name = "daily_revenue"
sql = "SELECT day, SUM(amount) FROM sales.orders GROUP BY day"
"#,
        )
        .unwrap();

        assert_eq!(config.project.id, "analytics-prod");
        assert_eq!(config.project.region, "US");
        assert_eq!(config.backend.max_concurrent_calls, 2);
        assert_eq!(config.backend.queue_timeout_ms, 30_000);
        assert_eq!(config.thresholds.anomaly_sensitivity, Sensitivity::High);
        assert_eq!(config.agents.query_optimizer.watched_queries.len(), 1);
        assert_eq!(config.integrations.critical_channel, "#data-ops-critical");
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let result = CostwatchConfig::from_toml_str("[backend]\nmax_concurrent_calls = 0\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_unordered_risk_bounds() {
        let mut config = CostwatchConfig::default();
        config.risk.low_cost_usd = 100.0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_sla_horizon_beyond_a_year() {
        let result =
            CostwatchConfig::from_toml_str("[agents.sla_sentinel]\nhorizon_days = 400\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = CostwatchConfig::default();
        config.apply_overrides(|key| match key {
            ENV_ALLOW_WRITE => Some("true".to_string()),
            ENV_ALLOW_SENSITIVE => Some("0".to_string()),
            ENV_PROJECT_ID => Some("override".to_string()),
            _ => None,
        });
        assert!(config.permissions.write_enabled);
        assert!(!config.permissions.sensitive_data_enabled);
        assert_eq!(config.project.id, "override");
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = CostwatchConfig::load(&temp.path().join("costwatch.toml")).unwrap();
        assert_eq!(config.cache.ttl_secs, 300);
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("costwatch.toml");
        std::fs::write(&path, "[cache]\nttl_secs = 60\n").unwrap();

        let config = CostwatchConfig::load(&path).unwrap();
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.max_entries, 10_000);
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("costwatch.toml");
        std::fs::write(&path, "[cache\nttl_secs = ").unwrap();
        assert!(matches!(CostwatchConfig::load(&path), Err(ConfigError::TomlParse(_))));
    }
}
