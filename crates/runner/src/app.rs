//! Wiring of the transaction log, the reference modules and the engine.

use std::future::Future;
use std::sync::Arc;

use modules::{
    InMemoryFulfillmentService, InMemoryInventoryService, InMemoryNotificationService,
    InMemoryPaymentService,
};
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use transaction_log::{InMemoryTransactionLog, InstanceQuery, PostgresTransactionLog, TransactionLog};
use workflow::commerce::{CommerceModules, commerce_engine};
use workflow::{EngineConfig, ExecutionEngine, InstanceId, WorkflowError, WorkflowResult};

use crate::cli::Command;
use crate::config::Config;
use crate::error::Result;

/// The in-memory reference modules the commerce steps call.
pub type Modules = CommerceModules<
    InMemoryInventoryService,
    InMemoryFulfillmentService,
    InMemoryNotificationService,
    InMemoryPaymentService,
>;

pub type Engine = ExecutionEngine<dyn TransactionLog>;

/// Opens the transaction log named by the configuration.
///
/// PostgreSQL when `DATABASE_URL` is set (migrations are applied),
/// otherwise an in-memory log that lives as long as the process.
pub async fn open_log(config: &Config) -> Result<Arc<dyn TransactionLog>> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(url)
                .await?;
            let log = PostgresTransactionLog::new(pool);
            log.run_migrations().await?;
            tracing::info!("using PostgreSQL transaction log");
            Ok(Arc::new(log))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; instances will not survive a restart");
            Ok(Arc::new(InMemoryTransactionLog::new()))
        }
    }
}

/// An engine over the commerce workflows plus handles to its modules.
pub struct Runner {
    engine: Engine,
    modules: Modules,
}

impl Runner {
    pub fn new(log: Arc<dyn TransactionLog>, config: EngineConfig) -> Result<Self> {
        let modules = CommerceModules {
            inventory: InMemoryInventoryService::new(),
            fulfillment: InMemoryFulfillmentService::new(),
            notification: InMemoryNotificationService::new(),
            payment: InMemoryPaymentService::new(),
        };
        let engine = commerce_engine(log, modules.clone(), config)?;
        Ok(Self { engine, modules })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn modules(&self) -> &Modules {
        &self.modules
    }

    /// Runs `command` and returns the document to print.
    ///
    /// `shutdown` resolving while a workflow runs requests its cancellation;
    /// the command then waits for the compensation to finish.
    pub async fn execute<S>(&self, command: Command, shutdown: S) -> Result<Value>
    where
        S: Future<Output = ()>,
    {
        match command {
            Command::Run {
                workflow,
                input,
                instance_id,
            } => {
                let input: Value = serde_json::from_str(&input)?;
                let instance_id = instance_id.unwrap_or_default();
                let result = self.run(instance_id, &workflow, input, shutdown).await?;
                Ok(serde_json::to_value(result)?)
            }
            Command::Resume { instance_id } => {
                let instance = self
                    .engine
                    .get_instance(instance_id)
                    .await?
                    .ok_or(WorkflowError::InstanceNotFound(instance_id))?;
                let handle = self
                    .engine
                    .spawn_as(instance_id, &instance.header.definition_id, Value::Null)
                    .await?;
                let result = self.wait(instance_id, handle, shutdown).await?;
                Ok(serde_json::to_value(result)?)
            }
            Command::Recover => Ok(serde_json::to_value(self.engine.recover().await?)?),
            Command::Status { instance_id } => {
                let result = self
                    .engine
                    .result_of(instance_id)
                    .await?
                    .ok_or(WorkflowError::InstanceNotFound(instance_id))?;
                Ok(serde_json::to_value(result)?)
            }
            Command::List {
                status,
                workflow,
                limit,
            } => {
                let mut query = InstanceQuery::new().limit(limit);
                if let Some(status) = status {
                    query = query.status(status);
                }
                if let Some(workflow) = workflow {
                    query = query.definition_id(workflow);
                }
                Ok(serde_json::to_value(self.engine.list_instances(query).await?)?)
            }
            Command::Cancel { instance_id } => {
                let accepted = self.engine.request_cancellation(instance_id).await?;
                Ok(json!({"instance_id": instance_id, "accepted": accepted}))
            }
            Command::Purge { instance_id } => {
                self.engine.purge_instance(instance_id).await?;
                Ok(json!({"instance_id": instance_id, "purged": true}))
            }
            Command::Workflows => Ok(json!(self.engine.catalog().ids())),
        }
    }

    /// Runs one instance to a final state, cancelling it if `shutdown`
    /// resolves first.
    pub async fn run<S>(
        &self,
        instance_id: InstanceId,
        workflow_id: &str,
        input: Value,
        shutdown: S,
    ) -> Result<WorkflowResult>
    where
        S: Future<Output = ()>,
    {
        self.seed_fulfillment(&input);
        let handle = self.engine.spawn_as(instance_id, workflow_id, input).await?;
        tracing::info!(%instance_id, workflow = %workflow_id, "workflow started");
        self.wait(instance_id, handle, shutdown).await
    }

    async fn wait<S>(
        &self,
        instance_id: InstanceId,
        mut handle: tokio::task::JoinHandle<workflow::Result<WorkflowResult>>,
        shutdown: S,
    ) -> Result<WorkflowResult>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        tokio::select! {
            joined = &mut handle => Ok(joined??),
            () = &mut shutdown => {
                if self.engine.request_cancellation(instance_id).await? {
                    tracing::info!(%instance_id, "waiting for compensation to finish");
                }
                Ok(handle.await??)
            }
        }
    }

    /// The in-memory fulfillment module only ships fulfillments it knows;
    /// register the one the input refers to.
    fn seed_fulfillment(&self, input: &Value) {
        if let Some(fulfillment_id) = input.get("fulfillment_id").and_then(Value::as_str)
            && self.modules.fulfillment.status(fulfillment_id).is_none()
        {
            tracing::debug!(%fulfillment_id, "registering fulfillment");
            self.modules.fulfillment.add_fulfillment(fulfillment_id);
        }
    }
}
