//! Collaborator abstraction layer for costwatch.
//!
//! This crate defines the traits and types the cost engine uses to talk to the
//! outside world: the billing ledger, the SQL rewrite oracle, and the action
//! collaborators (pull requests and chat notifications). It contains no
//! business logic.

pub mod mock;
pub mod records;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use records::{
    AlertSeverity, ColumnSchema, CostRecord, DeliveryAck, DryRunResult, Notification,
    OptimizationGoal, PullRequest, TimeRange,
};

/// Represents an error surfaced by the ledger backend.
///
/// Gateways must map their transport failures onto these variants so the core
/// never sees raw transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerError {
    /// The backend quota or rate limit was exhausted.
    #[error("Ledger quota exceeded: {0}")]
    Quota(String),

    /// The caller is not authorized to read the ledger.
    #[error("Ledger authorization failed: {0}")]
    Auth(String),

    /// The backend could not be reached.
    #[error("Ledger network error: {0}")]
    Network(String),

    /// The backend call exceeded its deadline.
    #[error("Ledger call timed out: {0}")]
    Timeout(String),

    /// The backend rejected the query text at parse time.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Other unexpected backend errors.
    #[error("Ledger error: {0}")]
    Other(String),
}

impl LedgerError {
    /// Returns `true` when a single retry of the call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

/// Error returned by the rewrite oracle.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleError {
    /// The oracle could not be reached or refused the request.
    #[error("Rewrite oracle unavailable: {0}")]
    Unavailable(String),

    /// The oracle answered with something that could not be interpreted.
    #[error("Malformed oracle response: {0}")]
    MalformedResponse(String),
}

/// Error returned by an action collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionError {
    /// The collaborator rejected the request.
    #[error("Action rejected: {0}")]
    Rejected(String),

    /// The collaborator could not be reached.
    #[error("Action delivery failed: {0}")]
    Delivery(String),
}

/// Read access to the authoritative cost ledger.
///
/// Implementations are expected to be cheap to clone behind an `Arc` and safe to
/// call concurrently; the core bounds concurrency itself.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Lists the job records whose timestamp falls inside `range`.
    ///
    /// # Errors
    /// Returns a `LedgerError` describing quota, auth, or network failures.
    async fn list_jobs(
        &self,
        range: &TimeRange,
        project: Option<&str>,
    ) -> Result<Vec<CostRecord>, LedgerError>;

    /// Estimates the bytes and cost of `query_text` without executing it.
    ///
    /// # Errors
    /// Returns `LedgerError::InvalidQuery` when the backend cannot parse the query.
    async fn dry_run(
        &self,
        query_text: &str,
        project: Option<&str>,
    ) -> Result<DryRunResult, LedgerError>;
}

/// Text-transformation oracle proposing SQL rewrites.
///
/// Suggestions are advisory only. Nothing the oracle says about equivalence is
/// trusted by the caller.
#[async_trait]
pub trait RewriteOracle: Send + Sync {
    /// Returns zero or more candidate rewrites of `query_text`.
    ///
    /// # Errors
    /// Returns an `OracleError` if the oracle cannot be consulted.
    async fn suggest_rewrite(
        &self,
        query_text: &str,
        goal: OptimizationGoal,
    ) -> Result<Vec<String>, OracleError>;
}

/// Source-control collaborator that opens pull requests.
#[async_trait]
pub trait PullRequestCreator: Send + Sync {
    /// Opens a pull request and returns its URL.
    ///
    /// # Errors
    /// Returns an `ActionError` if the pull request could not be created.
    async fn open_pull_request(&self, request: &PullRequest) -> Result<String, ActionError>;
}

/// Chat collaborator that delivers alert notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Posts a notification and returns the delivery acknowledgement.
    ///
    /// # Errors
    /// Returns an `ActionError` if delivery failed.
    async fn post_notification(
        &self,
        notification: &Notification,
    ) -> Result<DeliveryAck, ActionError>;
}
