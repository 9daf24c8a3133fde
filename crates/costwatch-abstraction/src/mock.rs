//! In-memory collaborator doubles.
//!
//! These are used by the workspace's own tests and are handy for wiring the
//! engine up without a live backend.

use crate::{
    ActionError, CostRecord, DeliveryAck, DryRunResult, LedgerError, LedgerGateway, Notification,
    Notifier, OptimizationGoal, OracleError, PullRequest, PullRequestCreator, RewriteOracle,
    TimeRange,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn normalize(query_text: &str) -> String {
    query_text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ledger backed by a fixed set of records and scripted dry-run answers.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: Vec<CostRecord>,
    dry_runs: Mutex<HashMap<String, Result<DryRunResult, LedgerError>>>,
    list_failures: Mutex<VecDeque<LedgerError>>,
    dry_run_failures: Mutex<VecDeque<LedgerError>>,
    latency: Option<Duration>,
    list_calls: AtomicUsize,
    dry_run_calls: AtomicUsize,
}

impl InMemoryLedger {
    /// Creates a ledger holding `records`.
    #[must_use]
    pub fn new(records: Vec<CostRecord>) -> Self {
        Self { records, ..Self::default() }
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Scripts the dry-run answer for `query_text` (whitespace-insensitive).
    #[must_use]
    pub fn with_dry_run(self, query_text: &str, result: Result<DryRunResult, LedgerError>) -> Self {
        lock(&self.dry_runs).insert(normalize(query_text), result);
        self
    }

    /// Makes the next `list_jobs` calls fail with the given errors, in order.
    #[must_use]
    pub fn failing_list_with(self, errors: Vec<LedgerError>) -> Self {
        lock(&self.list_failures).extend(errors);
        self
    }

    /// Makes the next `dry_run` calls fail with the given errors, in order.
    #[must_use]
    pub fn failing_dry_run_with(self, errors: Vec<LedgerError>) -> Self {
        lock(&self.dry_run_failures).extend(errors);
        self
    }

    /// Number of `list_jobs` calls received.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Number of `dry_run` calls received.
    pub fn dry_run_calls(&self) -> usize {
        self.dry_run_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn list_jobs(
        &self,
        range: &TimeRange,
        project: Option<&str>,
    ) -> Result<Vec<CostRecord>, LedgerError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if let Some(err) = lock(&self.list_failures).pop_front() {
            return Err(err);
        }

        Ok(self
            .records
            .iter()
            .filter(|r| range.contains(r.timestamp))
            .filter(|r| project.is_none_or(|p| r.project == p))
            .cloned()
            .collect())
    }

    async fn dry_run(
        &self,
        query_text: &str,
        _project: Option<&str>,
    ) -> Result<DryRunResult, LedgerError> {
        self.dry_run_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if let Some(err) = lock(&self.dry_run_failures).pop_front() {
            return Err(err);
        }

        lock(&self.dry_runs).get(&normalize(query_text)).cloned().unwrap_or_else(|| {
            Err(LedgerError::InvalidQuery(format!("no scripted dry run for: {}", query_text)))
        })
    }
}

/// Oracle that answers every request with the same scripted rewrites.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    rewrites: Vec<String>,
    failure: Option<OracleError>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    /// Creates an oracle returning `rewrites`.
    #[must_use]
    pub fn new(rewrites: Vec<String>) -> Self {
        Self { rewrites, ..Self::default() }
    }

    /// Creates an oracle that always fails with `error`.
    #[must_use]
    pub fn failing(error: OracleError) -> Self {
        Self { failure: Some(error), ..Self::default() }
    }

    /// Number of suggestion requests received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RewriteOracle for ScriptedOracle {
    async fn suggest_rewrite(
        &self,
        _query_text: &str,
        _goal: OptimizationGoal,
    ) -> Result<Vec<String>, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(self.rewrites.clone()),
        }
    }
}

/// Action collaborator that records every call it receives.
#[derive(Debug, Default)]
pub struct RecordingActions {
    pull_requests: Mutex<Vec<PullRequest>>,
    notifications: Mutex<Vec<Notification>>,
}

impl RecordingActions {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull requests received so far.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        lock(&self.pull_requests).clone()
    }

    /// Notifications received so far.
    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).clone()
    }

    /// Total number of collaborator invocations.
    pub fn total_calls(&self) -> usize {
        lock(&self.pull_requests).len() + lock(&self.notifications).len()
    }
}

#[async_trait]
impl PullRequestCreator for RecordingActions {
    async fn open_pull_request(&self, request: &PullRequest) -> Result<String, ActionError> {
        let mut prs = lock(&self.pull_requests);
        prs.push(request.clone());
        Ok(format!("https://github.com/{}/pull/{}", request.repository, prs.len()))
    }
}

#[async_trait]
impl Notifier for RecordingActions {
    async fn post_notification(
        &self,
        notification: &Notification,
    ) -> Result<DeliveryAck, ActionError> {
        let mut sent = lock(&self.notifications);
        sent.push(notification.clone());
        Ok(DeliveryAck {
            channel: notification.channel.clone(),
            message_id: format!("msg-{}", sent.len()),
            delivered_at: Utc::now(),
        })
    }
}
