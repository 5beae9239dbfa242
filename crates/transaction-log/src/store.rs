use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    InstanceHeader, InstanceId, InstanceQuery, Result, Sequence, StepExecutionRecord,
    TransactionLogError, WorkflowInstance,
};

/// Core trait for transaction log implementations.
///
/// A transaction log owns the source of truth for every workflow instance.
/// All implementations must be thread-safe (Send + Sync), and a successful
/// return from a write means the write is durable.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Persists the header of a new instance.
    ///
    /// Fails with `InstanceExists` if the instance is already known.
    async fn create_instance(&self, header: InstanceHeader) -> Result<()>;

    /// Appends a record to an instance's log.
    ///
    /// The record's sequence must directly follow the last stored record, and
    /// an open pending record may only be followed by the outcome of the same
    /// call (see [`validate_record_for_append`]).
    ///
    /// Returns the sequence of the stored record.
    async fn append_record(
        &self,
        instance_id: InstanceId,
        record: StepExecutionRecord,
    ) -> Result<Sequence>;

    /// Overwrites the mutable part of an instance's header row.
    ///
    /// The cancellation mark is never cleared by this call.
    async fn update_header(&self, header: &InstanceHeader) -> Result<()>;

    /// Returns the header of an instance.
    async fn get_header(&self, instance_id: InstanceId) -> Result<Option<InstanceHeader>>;

    /// Reconstructs an instance with its full record list.
    async fn load_instance(&self, instance_id: InstanceId) -> Result<Option<WorkflowInstance>>;

    /// Lists instance headers matching a query.
    async fn list_instances(&self, query: InstanceQuery) -> Result<Vec<InstanceHeader>>;

    /// Marks an instance for cancellation.
    ///
    /// Returns false if the instance is already terminal (the mark has no effect).
    async fn request_cancellation(&self, instance_id: InstanceId) -> Result<bool>;

    /// Removes a terminal instance and its records.
    ///
    /// Fails with `NotTerminal` for instances that are still running or compensating.
    async fn purge_instance(&self, instance_id: InstanceId) -> Result<()>;
}

#[async_trait]
impl<T: TransactionLog + ?Sized> TransactionLog for Arc<T> {
    async fn create_instance(&self, header: InstanceHeader) -> Result<()> {
        (**self).create_instance(header).await
    }

    async fn append_record(
        &self,
        instance_id: InstanceId,
        record: StepExecutionRecord,
    ) -> Result<Sequence> {
        (**self).append_record(instance_id, record).await
    }

    async fn update_header(&self, header: &InstanceHeader) -> Result<()> {
        (**self).update_header(header).await
    }

    async fn get_header(&self, instance_id: InstanceId) -> Result<Option<InstanceHeader>> {
        (**self).get_header(instance_id).await
    }

    async fn load_instance(&self, instance_id: InstanceId) -> Result<Option<WorkflowInstance>> {
        (**self).load_instance(instance_id).await
    }

    async fn list_instances(&self, query: InstanceQuery) -> Result<Vec<InstanceHeader>> {
        (**self).list_instances(query).await
    }

    async fn request_cancellation(&self, instance_id: InstanceId) -> Result<bool> {
        (**self).request_cancellation(instance_id).await
    }

    async fn purge_instance(&self, instance_id: InstanceId) -> Result<()> {
        (**self).purge_instance(instance_id).await
    }
}

/// Extension trait providing convenience methods for transaction logs.
#[async_trait]
pub trait TransactionLogExt: TransactionLog {
    /// Checks if an instance exists.
    async fn instance_exists(&self, instance_id: InstanceId) -> Result<bool> {
        Ok(self.get_header(instance_id).await?.is_some())
    }

    /// Headers of every instance left `running` or `compensating`.
    async fn unfinished_instances(&self) -> Result<Vec<InstanceHeader>> {
        self.list_instances(InstanceQuery::unfinished()).await
    }

    /// Loads an instance, failing if it does not exist.
    async fn require_instance(&self, instance_id: InstanceId) -> Result<WorkflowInstance> {
        self.load_instance(instance_id)
            .await?
            .ok_or(TransactionLogError::InstanceNotFound(instance_id))
    }
}

// Blanket implementation for all TransactionLog implementations
impl<T: TransactionLog + ?Sized> TransactionLogExt for T {}

/// Validates a record against the last stored record of its instance.
///
/// - sequences are dense: the new record must be `last + 1`;
/// - an open pending record must be closed by a non-pending record for the
///   same idempotency key and phase before anything else is written.
pub fn validate_record_for_append(
    instance_id: InstanceId,
    last: Option<&StepExecutionRecord>,
    record: &StepExecutionRecord,
) -> Result<()> {
    let expected = last
        .map(|r| r.sequence)
        .unwrap_or(Sequence::initial())
        .next();
    if record.sequence != expected {
        return Err(TransactionLogError::SequenceConflict {
            instance_id,
            expected,
            actual: record.sequence,
        });
    }

    if let Some(open) = last.filter(|r| r.is_pending()) {
        if record.is_pending() {
            return Err(TransactionLogError::InvalidRecord {
                instance_id,
                message: format!(
                    "pending record for '{}' is still open; a second pending record is not allowed",
                    open.step_name
                ),
            });
        }
        if record.idempotency_key != open.idempotency_key || record.phase != open.phase {
            return Err(TransactionLogError::InvalidRecord {
                instance_id,
                message: format!(
                    "pending {} record for '{}' must be closed before writing '{}'",
                    open.phase, open.step_name, record.step_name
                ),
            });
        }
    }

    Ok(())
}
