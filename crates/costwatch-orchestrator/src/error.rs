// Error types for orchestration

use costwatch_core::CostError;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A cycle named an agent that is not registered
    #[error("Unknown agent '{0}'")]
    UnknownAgent(String),

    /// An action collaborator failed after the permission check passed
    #[error("Action '{operation}' failed: {message}")]
    ActionFailed {
        /// Operation that was requested
        operation: String,
        /// Collaborator message
        message: String,
    },

    /// An insight was asked to act but carries no proposed action
    #[error("Insight '{0}' proposes no action")]
    NoProposedAction(String),

    /// Cost engine error
    #[error(transparent)]
    Cost(#[from] CostError),
}

impl OrchestrationError {
    /// Returns `true` when the request was refused by the permission gate.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Cost(err) if err.is_permission_denied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_is_detected_through_wrapper() {
        let err: OrchestrationError = CostError::PermissionDenied {
            operation: "send_alert".to_string(),
            requirement: "write_enabled".to_string(),
        }
        .into();
        assert!(err.is_permission_denied());
        assert!(!OrchestrationError::UnknownAgent("x".to_string()).is_permission_denied());
    }
}
