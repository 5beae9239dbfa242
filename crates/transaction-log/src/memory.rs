use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    InstanceHeader, InstanceId, InstanceQuery, Result, Sequence, StepExecutionRecord,
    TransactionLogError, WorkflowInstance,
    store::{TransactionLog, validate_record_for_append},
};

#[derive(Debug, Clone)]
struct InstanceEntry {
    header: InstanceHeader,
    records: Vec<StepExecutionRecord>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    instances: HashMap<InstanceId, InstanceEntry>,
    /// Remaining record appends before writes start failing; `None` = unlimited.
    append_budget: Option<usize>,
    /// Remaining header updates before they start failing; `None` = unlimited.
    header_update_budget: Option<usize>,
}

/// In-memory transaction log for testing and single-process use.
///
/// Provides the same interface and append discipline as the PostgreSQL
/// implementation. Cloning shares the underlying state, so a second engine
/// built over a clone sees everything the first one wrote.
#[derive(Clone, Default)]
pub struct InMemoryTransactionLog {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryTransactionLog {
    /// Creates a new empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of instances stored.
    pub async fn instance_count(&self) -> usize {
        self.state.read().await.instances.len()
    }

    /// Returns the number of records stored for an instance.
    pub async fn record_count(&self, instance_id: InstanceId) -> usize {
        self.state
            .read()
            .await
            .instances
            .get(&instance_id)
            .map(|e| e.records.len())
            .unwrap_or(0)
    }

    /// Allows only `budget` more record appends; further appends fail with
    /// `Unavailable`. `None` removes the limit.
    ///
    /// Used to simulate a process dying between two log writes.
    pub async fn set_append_budget(&self, budget: Option<usize>) {
        self.state.write().await.append_budget = budget;
    }

    /// Allows only `budget` more header updates; further updates fail with
    /// `Unavailable`. `None` removes the limit.
    ///
    /// Used to simulate a process dying after a record append but before the
    /// header that follows it is written.
    pub async fn set_header_update_budget(&self, budget: Option<usize>) {
        self.state.write().await.header_update_budget = budget;
    }

    /// Clears all instances.
    pub async fn clear(&self) {
        self.state.write().await.instances.clear();
    }
}

#[async_trait]
impl TransactionLog for InMemoryTransactionLog {
    async fn create_instance(&self, header: InstanceHeader) -> Result<()> {
        let mut state = self.state.write().await;
        if state.instances.contains_key(&header.instance_id) {
            return Err(TransactionLogError::InstanceExists(header.instance_id));
        }
        state.instances.insert(
            header.instance_id,
            InstanceEntry {
                header,
                records: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append_record(
        &self,
        instance_id: InstanceId,
        record: StepExecutionRecord,
    ) -> Result<Sequence> {
        let mut state = self.state.write().await;

        if let Some(budget) = state.append_budget {
            if budget == 0 {
                return Err(TransactionLogError::Unavailable(
                    "append budget exhausted".to_string(),
                ));
            }
            state.append_budget = Some(budget - 1);
        }

        let entry = state
            .instances
            .get_mut(&instance_id)
            .ok_or(TransactionLogError::InstanceNotFound(instance_id))?;

        validate_record_for_append(instance_id, entry.records.last(), &record)?;

        let sequence = record.sequence;
        entry.records.push(record);
        metrics::counter!("transaction_log_appends_total", "backend" => "memory").increment(1);
        Ok(sequence)
    }

    async fn update_header(&self, header: &InstanceHeader) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(budget) = state.header_update_budget {
            if budget == 0 {
                return Err(TransactionLogError::Unavailable(
                    "header update budget exhausted".to_string(),
                ));
            }
            state.header_update_budget = Some(budget - 1);
        }

        let entry = state
            .instances
            .get_mut(&header.instance_id)
            .ok_or(TransactionLogError::InstanceNotFound(header.instance_id))?;

        let cancel_requested = entry.header.cancel_requested || header.cancel_requested;
        entry.header = header.clone();
        entry.header.cancel_requested = cancel_requested;
        entry.header.updated_at = Utc::now();
        Ok(())
    }

    async fn get_header(&self, instance_id: InstanceId) -> Result<Option<InstanceHeader>> {
        let state = self.state.read().await;
        Ok(state.instances.get(&instance_id).map(|e| e.header.clone()))
    }

    async fn load_instance(&self, instance_id: InstanceId) -> Result<Option<WorkflowInstance>> {
        let state = self.state.read().await;
        Ok(state
            .instances
            .get(&instance_id)
            .map(|e| WorkflowInstance::new(e.header.clone(), e.records.clone())))
    }

    async fn list_instances(&self, query: InstanceQuery) -> Result<Vec<InstanceHeader>> {
        let state = self.state.read().await;
        let mut headers: Vec<_> = state
            .instances
            .values()
            .filter(|e| query.matches(&e.header.definition_id, e.header.status))
            .map(|e| e.header.clone())
            .collect();

        headers.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.instance_id.cmp(&b.instance_id))
        });

        let offset = query.offset.unwrap_or(0);
        let headers = headers.into_iter().skip(offset);
        let headers = match query.limit {
            Some(limit) => headers.take(limit).collect(),
            None => headers.collect(),
        };

        Ok(headers)
    }

    async fn request_cancellation(&self, instance_id: InstanceId) -> Result<bool> {
        let mut state = self.state.write().await;
        let entry = state
            .instances
            .get_mut(&instance_id)
            .ok_or(TransactionLogError::InstanceNotFound(instance_id))?;

        if entry.header.status.is_terminal() {
            return Ok(false);
        }
        entry.header.cancel_requested = true;
        entry.header.updated_at = Utc::now();
        Ok(true)
    }

    async fn purge_instance(&self, instance_id: InstanceId) -> Result<()> {
        let mut state = self.state.write().await;
        let status = state
            .instances
            .get(&instance_id)
            .map(|e| e.header.status)
            .ok_or(TransactionLogError::InstanceNotFound(instance_id))?;

        if !status.is_terminal() {
            return Err(TransactionLogError::NotTerminal {
                instance_id,
                status,
            });
        }
        state.instances.remove(&instance_id);
        Ok(())
    }
}
