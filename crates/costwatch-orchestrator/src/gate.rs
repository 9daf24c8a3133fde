//! Permission gate in front of the mutating collaborators.
//!
//! Every pull request and notification leaves the process through
//! [`ActionGate::request_action`], which checks `write_enabled` before any
//! collaborator is touched.

use crate::error::{OrchestrationError, Result};
use costwatch_abstraction::{DeliveryAck, Notification, Notifier, PullRequest, PullRequestCreator};
use costwatch_core::PermissionState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

/// A mutating action and its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    /// Open a pull request.
    OpenPullRequest(PullRequest),
    /// Post a chat notification.
    SendAlert(Notification),
}

impl ActionRequest {
    /// Operation name used in permission errors and logs.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            Self::OpenPullRequest(_) => "open_pull_request",
            Self::SendAlert(_) => "send_alert",
        }
    }
}

/// What the collaborator returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "receipt", rename_all = "snake_case")]
pub enum ActionReceipt {
    /// The pull request was opened.
    PullRequestOpened {
        /// Pull request URL.
        url: String,
    },
    /// The notification was delivered.
    AlertDelivered(DeliveryAck),
}

/// Gate holding the permission state and the action collaborators.
#[derive(Clone)]
pub struct ActionGate {
    permissions: PermissionState,
    pull_requests: Arc<dyn PullRequestCreator>,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for ActionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionGate").field("permissions", &self.permissions).finish_non_exhaustive()
    }
}

impl ActionGate {
    /// Creates a gate.
    #[must_use]
    pub fn new(
        permissions: PermissionState,
        pull_requests: Arc<dyn PullRequestCreator>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { permissions, pull_requests, notifier }
    }

    /// Permission state the gate enforces.
    #[must_use]
    pub fn permissions(&self) -> PermissionState {
        self.permissions
    }

    /// Performs `action` if writes are enabled.
    ///
    /// # Errors
    /// `PermissionDenied` (wrapped in [`OrchestrationError::Cost`]) when writes
    /// are disabled, in which case no collaborator is called;
    /// `ActionFailed` when the collaborator rejects the request.
    pub async fn request_action(&self, action: ActionRequest) -> Result<ActionReceipt> {
        let operation = action.operation();
        self.permissions.require_write(operation)?;

        let receipt = match &action {
            ActionRequest::OpenPullRequest(request) => self
                .pull_requests
                .open_pull_request(request)
                .await
                .map(|url| ActionReceipt::PullRequestOpened { url }),
            ActionRequest::SendAlert(notification) => self
                .notifier
                .post_notification(notification)
                .await
                .map(ActionReceipt::AlertDelivered),
        };

        match receipt {
            Ok(receipt) => {
                info!(operation, "Action completed");
                Ok(receipt)
            }
            Err(err) => {
                error!(operation, error = %err, "Action collaborator failed");
                Err(OrchestrationError::ActionFailed {
                    operation: operation.to_string(),
                    message: err.to_string(),
                })
            }
        }
    }
}
