//! Error types for the cost engine.

use costwatch_abstraction::{LedgerError, OracleError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for cost engine operations.
pub type Result<T> = std::result::Result<T, CostError>;

/// Why a backend call could not be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendCause {
    /// Quota or rate limit exhausted.
    Quota,
    /// Credentials rejected.
    Auth,
    /// Backend unreachable.
    Network,
    /// Backend call exceeded its deadline.
    Timeout,
    /// Waited too long for a free backend slot.
    QueueTimeout,
    /// Anything else the backend reported.
    Other,
}

impl fmt::Display for BackendCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Quota => "quota",
            Self::Auth => "auth",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::QueueTimeout => "queue_timeout",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Core error type for cost engine operations.
///
/// `Clone` so that every waiter of a single-flight computation can receive the
/// same failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CostError {
    /// A requested aggregation dimension is not in the supported set.
    #[error("Invalid dimension '{dimension}' (allowed: {allowed})")]
    InvalidDimension {
        /// The offending dimension as given by the caller.
        dimension: String,
        /// Comma-separated list of supported dimensions.
        allowed: String,
    },

    /// A series was too short for the requested statistic.
    #[error("Insufficient data for '{series}': {points} points, need at least {required}")]
    InsufficientData {
        /// Dimension key of the series.
        series: String,
        /// Points available.
        points: usize,
        /// Points required.
        required: usize,
    },

    /// The backend rejected the query text at parse time.
    #[error("Query syntax error: {message}")]
    QuerySyntaxError {
        /// Backend parser message.
        message: String,
    },

    /// The backend could not serve the request.
    #[error("Backend unavailable ({cause}) after {attempts} attempt(s): {message}")]
    BackendUnavailable {
        /// Root cause classification.
        cause: BackendCause,
        /// Backend message.
        message: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// The operation requires a permission that is disabled.
    #[error("Permission denied for '{operation}': {requirement} is disabled")]
    PermissionDenied {
        /// Operation that was refused.
        operation: String,
        /// Which flag would have to be enabled.
        requirement: String,
    },

    /// A numeric or enumerated parameter was out of range.
    #[error("Invalid parameter '{name}': {value}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Offending value.
        value: String,
    },

    /// The rewrite oracle failed.
    #[error("Rewrite oracle error: {0}")]
    Oracle(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CostError {
    /// Builds an `InvalidParameter` error.
    pub fn invalid_parameter(name: &str, value: impl fmt::Display) -> Self {
        Self::InvalidParameter { name: name.to_string(), value: value.to_string() }
    }

    /// Returns `true` for `PermissionDenied`.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

impl From<OracleError> for CostError {
    fn from(err: OracleError) -> Self {
        Self::Oracle(err.to_string())
    }
}

/// Maps a ledger failure after `attempts` tries onto the core taxonomy.
pub(crate) fn from_ledger(err: LedgerError, attempts: u32) -> CostError {
    let (cause, message) = match err {
        LedgerError::InvalidQuery(message) => return CostError::QuerySyntaxError { message },
        LedgerError::Quota(m) => (BackendCause::Quota, m),
        LedgerError::Auth(m) => (BackendCause::Auth, m),
        LedgerError::Network(m) => (BackendCause::Network, m),
        LedgerError::Timeout(m) => (BackendCause::Timeout, m),
        LedgerError::Other(m) => (BackendCause::Other, m),
    };
    CostError::BackendUnavailable { cause, message, attempts }
}
