use thiserror::Error;

use crate::{InstanceId, Sequence, WorkflowStatus};

/// Errors that can occur when interacting with the transaction log.
#[derive(Debug, Error)]
pub enum TransactionLogError {
    /// No header row exists for the instance.
    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// A header row already exists for the instance.
    #[error("Workflow instance already exists: {0}")]
    InstanceExists(InstanceId),

    /// The record's sequence number does not directly follow the last
    /// record of the instance.
    #[error(
        "Sequence conflict for instance {instance_id}: expected sequence {expected}, got {actual}"
    )]
    SequenceConflict {
        instance_id: InstanceId,
        expected: Sequence,
        actual: Sequence,
    },

    /// The record violates the append discipline (e.g. a second open pending record).
    #[error("Invalid record for instance {instance_id}: {message}")]
    InvalidRecord {
        instance_id: InstanceId,
        message: String,
    },

    /// The operation is only allowed on instances in a terminal state.
    #[error("Workflow instance {instance_id} is not terminal (status {status})")]
    NotTerminal {
        instance_id: InstanceId,
        status: WorkflowStatus,
    },

    /// A persisted value could not be decoded.
    #[error("Corrupt log entry: {0}")]
    Corrupt(String),

    /// The backend refused the write (in-memory fault injection or I/O failure).
    #[error("Log unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for transaction log operations.
pub type Result<T> = std::result::Result<T, TransactionLogError>;
