//! Workflow error types.

use common::InstanceId;
use thiserror::Error;
use transaction_log::TransactionLogError;

/// Errors returned by the registry, the definition table and the engine.
///
/// Step failures during a run are not errors of the engine: they end the
/// instance `reverted` or `failed` and are reported in the
/// [`crate::WorkflowResult`]. The `StepTimeout`, `StepHandler` and
/// `Compensation` variants describe those failures.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A step with this name is already registered.
    #[error("Duplicate step: {0}")]
    DuplicateStep(String),

    /// No step with this name is registered.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// The registry no longer accepts registrations.
    #[error("Step registry is sealed; cannot register '{0}'")]
    RegistrySealed(String),

    /// A workflow definition failed validation.
    #[error("Invalid workflow '{workflow}': {reason}")]
    InvalidWorkflow { workflow: String, reason: String },

    /// A workflow with this identifier is already defined.
    #[error("Duplicate workflow: {0}")]
    DuplicateWorkflow(String),

    /// No workflow with this identifier is defined.
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// No instance with this ID exists in the log.
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// A step handler did not finish within its timeout.
    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    StepTimeout { step: String, timeout_ms: u64 },

    /// A step handler returned an error.
    #[error("Step '{step}' failed: {reason}")]
    StepHandler { step: String, reason: String },

    /// A compensate handler failed.
    #[error("Compensation of step '{step}' failed: {reason}")]
    Compensation { step: String, reason: String },

    /// Transaction log error.
    #[error("Transaction log error: {0}")]
    TransactionLog(#[from] TransactionLogError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    pub(crate) fn invalid(workflow: &str, reason: impl Into<String>) -> Self {
        WorkflowError::InvalidWorkflow {
            workflow: workflow.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for workflow results.
pub type Result<T> = std::result::Result<T, WorkflowError>;
