//! Durable, append-only transaction log for workflow instances.
//!
//! Every workflow instance owns one mutable header row (status, step index,
//! cancellation mark) and an append-only list of step execution records keyed
//! by `(instance_id, sequence)`. Together they are enough to reconstruct the
//! full history of an instance and resume it after a crash.

pub mod error;
pub mod instance;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod record;
pub mod store;

pub use common::InstanceId;
pub use error::{Result, TransactionLogError};
pub use instance::{FailureCause, FailureDetail, InstanceHeader, WorkflowInstance, WorkflowStatus};
pub use memory::InMemoryTransactionLog;
pub use postgres::PostgresTransactionLog;
pub use query::InstanceQuery;
pub use record::{RecordPhase, RecordStatus, Sequence, StepExecutionRecord};
pub use store::{TransactionLog, TransactionLogExt, validate_record_for_append};
