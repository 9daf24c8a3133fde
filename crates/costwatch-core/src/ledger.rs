//! Cost ledger client.
//!
//! Wraps a [`LedgerGateway`] with the shared result cache, the backend
//! concurrency limit, and a single bounded retry for transient failures. All
//! backend calls made by the engine go through here.

use crate::cache::{CacheStats, ResultCache};
use crate::config::CostwatchConfig;
use crate::error::{Result, from_ledger};
use crate::limiter::ConcurrencyLimiter;
use costwatch_abstraction::{CostRecord, DryRunResult, LedgerError, LedgerGateway, TimeRange};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts made for a transient failure: the original call plus one retry.
const MAX_ATTEMPTS: u32 = 2;

/// Stable fingerprint of a query: SHA-256 over its whitespace-normalized text.
#[must_use]
pub fn query_fingerprint(query_text: &str) -> String {
    let normalized = query_text.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Cached, rate-limited access to the ledger.
pub struct LedgerClient {
    gateway: Arc<dyn LedgerGateway>,
    project: Option<String>,
    jobs: ResultCache<Arc<Vec<CostRecord>>>,
    dry_runs: ResultCache<DryRunResult>,
    limiter: ConcurrencyLimiter,
    ttl: Duration,
    retry_backoff: Duration,
}

impl std::fmt::Debug for LedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerClient")
            .field("project", &self.project)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl LedgerClient {
    /// Creates a client using the cache and backend settings from `config`.
    #[must_use]
    pub fn new(gateway: Arc<dyn LedgerGateway>, config: &CostwatchConfig) -> Self {
        let project = Some(config.project.id.clone()).filter(|id| !id.is_empty());
        Self {
            gateway,
            project,
            jobs: ResultCache::new(config.cache.max_entries),
            dry_runs: ResultCache::new(config.cache.max_entries),
            limiter: ConcurrencyLimiter::new(
                config.backend.max_concurrent_calls,
                config.backend.queue_timeout(),
            ),
            ttl: config.cache.ttl(),
            retry_backoff: config.backend.retry_backoff(),
        }
    }

    /// Fetches the normalized job records inside `range`.
    ///
    /// Records come back sorted by timestamp with duplicate job ids and
    /// non-finite costs removed.
    ///
    /// # Errors
    /// Returns `BackendUnavailable` when the ledger cannot serve the request.
    pub async fn list_jobs(&self, range: &TimeRange) -> Result<Arc<Vec<CostRecord>>> {
        let key = format!(
            "jobs:{}:{}:{}",
            self.project.as_deref().unwrap_or("-"),
            range.start.timestamp(),
            range.end.timestamp()
        );

        self.jobs
            .with_cache(&key, self.ttl, || async {
                let records = self
                    .call_with_retry("list_jobs", || {
                        self.gateway.list_jobs(range, self.project.as_deref())
                    })
                    .await?;
                Ok(Arc::new(normalize_records(records)))
            })
            .await
    }

    /// Estimates `query_text` without running it.
    ///
    /// # Errors
    /// Returns `QuerySyntaxError` if the backend cannot parse the query, or
    /// `BackendUnavailable` if it cannot be reached.
    pub async fn dry_run(&self, query_text: &str) -> Result<DryRunResult> {
        let key = format!("dry_run:{}", query_fingerprint(query_text));

        self.dry_runs
            .with_cache(&key, self.ttl, || {
                self.call_with_retry("dry_run", || {
                    self.gateway.dry_run(query_text, self.project.as_deref())
                })
            })
            .await
    }

    /// Statistics of the job-record cache.
    pub fn jobs_cache_stats(&self) -> CacheStats {
        self.jobs.stats()
    }

    /// Statistics of the dry-run cache.
    pub fn dry_run_cache_stats(&self) -> CacheStats {
        self.dry_runs.stats()
    }

    /// Backend concurrency limiter.
    #[must_use]
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    async fn call_with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, LedgerError>>,
    {
        let mut attempt = 1;
        loop {
            let outcome = self.limiter.with_concurrency_limit(|| async { Ok(call().await) }).await?;

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        operation,
                        attempt,
                        backoff_ms = self.retry_backoff.as_millis() as u64,
                        error = %err,
                        "Transient ledger failure, retrying once"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(operation, attempt, error = %err, "Ledger call failed");
                    return Err(from_ledger(err, attempt));
                }
            }
        }
    }
}

fn normalize_records(mut records: Vec<CostRecord>) -> Vec<CostRecord> {
    let before = records.len();
    let mut seen = HashSet::new();
    records.retain(|r| r.cost_usd.is_finite() && seen.insert(r.query_id.clone()));
    if records.len() != before {
        warn!(dropped = before - records.len(), "Dropped duplicate or malformed ledger records");
    }
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.query_id.cmp(&b.query_id)));
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendCause, CostError};
    use chrono::{TimeZone, Utc};
    use costwatch_abstraction::mock::InMemoryLedger;

    fn record(id: &str, hour: u32, cost: f64) -> CostRecord {
        CostRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 6, 3, hour, 0, 0).unwrap(),
            project: "analytics".to_string(),
            dataset: "sales".to_string(),
            user: "ana@example.com".to_string(),
            query_id: id.to_string(),
            bytes_processed: 1 << 30,
            cost_usd: cost,
            query_class: "select".to_string(),
        }
    }

    fn fast_config() -> CostwatchConfig {
        let mut config = CostwatchConfig::default();
        config.backend.retry_backoff_ms = 1;
        config
    }

    fn day_range() -> TimeRange {
        let start = Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap();
        TimeRange::new(start, start + chrono::Duration::days(1))
    }

    #[test]
    fn test_fingerprint_ignores_whitespace() {
        assert_eq!(query_fingerprint("SELECT  1\nFROM t"), query_fingerprint("SELECT 1 FROM t"));
        assert_ne!(query_fingerprint("SELECT 1"), query_fingerprint("SELECT 2"));
        assert_eq!(query_fingerprint("SELECT 1").len(), 64);
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let records = normalize_records(vec![
            record("b", 9, 1.0),
            record("a", 3, 1.0),
            record("b", 9, 1.0),
            record("c", 5, f64::NAN),
        ]);
        let ids: Vec<_> = records.iter().map(|r| r.query_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_once() {
        let ledger = Arc::new(
            InMemoryLedger::new(vec![record("a", 1, 2.0)])
                .failing_list_with(vec![LedgerError::Network("reset".to_string())]),
        );
        let client = LedgerClient::new(ledger.clone(), &fast_config());

        let records = client.list_jobs(&day_range()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(ledger.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_second_transient_failure_surfaces_backend_unavailable() {
        let ledger = Arc::new(InMemoryLedger::new(vec![]).failing_list_with(vec![
            LedgerError::Timeout("deadline".to_string()),
            LedgerError::Timeout("deadline".to_string()),
            LedgerError::Timeout("deadline".to_string()),
        ]));
        let client = LedgerClient::new(ledger.clone(), &fast_config());

        let err = client.list_jobs(&day_range()).await.unwrap_err();
        assert_eq!(
            err,
            CostError::BackendUnavailable {
                cause: BackendCause::Timeout,
                message: "deadline".to_string(),
                attempts: 2,
            }
        );
        assert_eq!(ledger.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_quota_is_not_retried() {
        let ledger = Arc::new(
            InMemoryLedger::new(vec![])
                .failing_list_with(vec![LedgerError::Quota("daily limit".to_string())]),
        );
        let client = LedgerClient::new(ledger.clone(), &fast_config());

        let err = client.list_jobs(&day_range()).await.unwrap_err();
        assert!(matches!(
            err,
            CostError::BackendUnavailable { cause: BackendCause::Quota, attempts: 1, .. }
        ));
        assert_eq!(ledger.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_syntax_error_is_not_retried() {
        let ledger = Arc::new(InMemoryLedger::default());
        let client = LedgerClient::new(ledger.clone(), &fast_config());

        let err = client.dry_run("SELEC nonsense").await.unwrap_err();
        assert!(matches!(err, CostError::QuerySyntaxError { .. }));
        assert_eq!(ledger.dry_run_calls(), 1);
    }

    #[tokio::test]
    async fn test_list_jobs_is_cached() {
        let ledger = Arc::new(InMemoryLedger::new(vec![record("a", 1, 2.0)]));
        let client = LedgerClient::new(ledger.clone(), &fast_config());

        client.list_jobs(&day_range()).await.unwrap();
        client.list_jobs(&day_range()).await.unwrap();
        assert_eq!(ledger.list_calls(), 1);
        assert_eq!(client.jobs_cache_stats().hits, 1);
    }
}
