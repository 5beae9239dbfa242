use thiserror::Error;
use workflow::WorkflowError;

/// Errors that end a runner invocation.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("Workflow task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
