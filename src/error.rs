use thiserror::Error;

use crate::k8s::ApiFailure;

/// Terminal error of a reconciliation fiber. The variant is the error
/// "kind"; mapping a kind to user-facing Domain condition text belongs to
/// whoever submitted the fiber.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("Kubernetes API request failed: {0}")]
    Api(#[from] ApiFailure),

    #[error("timed out waiting for {0}")]
    TimeoutExceeded(String),

    /// The fiber was displaced by a newer submission for the same key.
    /// Never surfaced to the user; the replacement fiber is the recovery.
    #[error("fiber cancelled")]
    Cancelled,

    #[error("invalid domain configuration: {0}")]
    Validation(String),

    #[error("introspection failed: {0}")]
    Introspection(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OperatorError {
    /// True for errors that must not be retried against the same snapshot
    /// generation.
    pub fn is_validation(&self) -> bool {
        matches!(self, OperatorError::Validation(_))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, OperatorError::Cancelled)
    }
}
