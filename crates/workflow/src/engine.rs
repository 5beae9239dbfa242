//! Execution engine for workflow instances.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::InstanceId;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use transaction_log::{
    FailureCause, FailureDetail, InstanceHeader, InstanceQuery, RecordPhase, RecordStatus,
    Sequence, StepExecutionRecord, TransactionLog, TransactionLogError, TransactionLogExt,
    WorkflowInstance, WorkflowStatus,
};

use crate::adapter::{AdapterError, StepContext};
use crate::config::{EngineConfig, MissingCompensation};
use crate::definition::{StepSpec, WorkflowCatalog, WorkflowDefinition};
use crate::error::{Result, WorkflowError};
use crate::mapping::MappingError;
use crate::retry::RetryPolicy;

const NO_COMPENSATE_HANDLER: &str = "no compensate handler";

/// Outcome of a workflow run as reported to the trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub instance_id: InstanceId,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// Step outputs keyed by binding name. Present once the instance is `done`.
    pub output: Option<Value>,
    /// The originating error of a `reverted` or `failed` instance.
    pub failure: Option<FailureDetail>,
    /// True if the compensation walk ran.
    pub compensation_attempted: bool,
    /// Steps whose compensation failed and need manual remediation.
    pub remediation: Vec<String>,
}

impl WorkflowResult {
    fn from_instance(instance: &WorkflowInstance, definition: Option<&WorkflowDefinition>) -> Self {
        let header = &instance.header;
        let output = (header.status == WorkflowStatus::Done)
            .then(|| Value::Object(bound_outputs(instance, definition)));

        Self {
            instance_id: header.instance_id,
            workflow_id: header.definition_id.clone(),
            status: header.status,
            output,
            failure: header.failure.clone(),
            compensation_attempted: header.compensation_attempted,
            remediation: header.remediation.clone(),
        }
    }

    /// Returns true if every step succeeded.
    pub fn is_done(&self) -> bool {
        self.status == WorkflowStatus::Done
    }

    /// Returns true if the instance reached a final state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn bound_outputs(
    instance: &WorkflowInstance,
    definition: Option<&WorkflowDefinition>,
) -> Map<String, Value> {
    let mut outputs = Map::new();
    for record in instance.succeeded_records() {
        let binding = definition
            .and_then(|d| d.step_named(&record.step_name))
            .map(StepSpec::binding)
            .unwrap_or(&record.step_name);
        if let Some(payload) = &record.payload {
            outputs.insert(binding.to_string(), payload.clone());
        }
    }
    outputs
}

/// Why a handler call did not produce a result.
#[derive(Debug)]
enum StepFailure {
    Handler(AdapterError),
    Timeout(Duration),
    Mapping(MappingError),
    Unresolvable(String),
}

impl StepFailure {
    fn is_retryable(&self) -> bool {
        match self {
            StepFailure::Handler(e) => e.is_retryable(),
            StepFailure::Timeout(_) => true,
            StepFailure::Mapping(_) | StepFailure::Unresolvable(_) => false,
        }
    }

    fn cause(&self) -> FailureCause {
        match self {
            StepFailure::Handler(_) => FailureCause::Handler,
            StepFailure::Timeout(_) => FailureCause::Timeout,
            StepFailure::Mapping(_) => FailureCause::InputMapping,
            StepFailure::Unresolvable(_) => FailureCause::Definition,
        }
    }

    fn into_error(self, step: &str) -> WorkflowError {
        let step = step.to_string();
        match self {
            StepFailure::Timeout(timeout) => WorkflowError::StepTimeout {
                step,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            StepFailure::Handler(e) => WorkflowError::StepHandler {
                step,
                reason: e.to_string(),
            },
            StepFailure::Mapping(e) => WorkflowError::StepHandler {
                step,
                reason: format!("input mapping: {e}"),
            },
            StepFailure::Unresolvable(reason) => WorkflowError::StepHandler { step, reason },
        }
    }
}

/// Drives workflow instances through their steps.
///
/// Every step runs as: pending record, handler call (with retries and a
/// timeout), outcome record. A failure or a cancellation request switches
/// the instance to `compensating` and walks the succeeded steps backwards
/// through their compensate handlers. All progress lives in the transaction
/// log, so any instance can be resumed by another engine after a crash.
///
/// One engine task drives an instance at a time; different instances run
/// concurrently.
pub struct ExecutionEngine<L: TransactionLog + ?Sized> {
    log: Arc<L>,
    catalog: Arc<WorkflowCatalog>,
    config: EngineConfig,
}

impl<L: TransactionLog + ?Sized> Clone for ExecutionEngine<L> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            catalog: self.catalog.clone(),
            config: self.config.clone(),
        }
    }
}

impl<L> ExecutionEngine<L>
where
    L: TransactionLog + ?Sized + 'static,
{
    pub fn new(log: Arc<L>, catalog: Arc<WorkflowCatalog>, config: EngineConfig) -> Self {
        Self {
            log,
            catalog,
            config,
        }
    }

    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs a new instance of a workflow to a final state.
    pub async fn execute(&self, workflow_id: &str, input: Value) -> Result<WorkflowResult> {
        self.execute_as(InstanceId::new(), workflow_id, input).await
    }

    /// Runs the instance `instance_id` of a workflow to a final state.
    ///
    /// If the instance already exists it is resumed (or its final result
    /// returned) and `input` is ignored.
    #[tracing::instrument(skip(self, input), fields(workflow = %workflow_id))]
    pub async fn execute_as(
        &self,
        instance_id: InstanceId,
        workflow_id: &str,
        input: Value,
    ) -> Result<WorkflowResult> {
        if let Some(existing) = self.log.load_instance(instance_id).await? {
            if existing.header.definition_id != workflow_id {
                tracing::warn!(
                    %instance_id,
                    existing = %existing.header.definition_id,
                    "instance exists under another workflow; resuming it"
                );
            }
            return self.drive(existing).await;
        }

        let instance = self.create_instance(instance_id, workflow_id, input).await?;
        self.drive(instance).await
    }

    /// Blocking trigger: runs a new instance and returns its final result.
    pub async fn start_workflow(&self, workflow_id: &str, input: Value) -> Result<WorkflowResult> {
        self.execute(workflow_id, input).await
    }

    /// Asynchronous trigger: persists a new instance and drives it on a
    /// background task.
    ///
    /// The instance is visible through [`get_instance`](Self::get_instance)
    /// as soon as this returns.
    pub async fn spawn_workflow(
        &self,
        workflow_id: &str,
        input: Value,
    ) -> Result<(InstanceId, JoinHandle<Result<WorkflowResult>>)> {
        let instance_id = InstanceId::new();
        let handle = self.spawn_as(instance_id, workflow_id, input).await?;
        Ok((instance_id, handle))
    }

    /// [`spawn_workflow`](Self::spawn_workflow) under a caller-chosen id.
    ///
    /// An existing instance is resumed on the background task and `input`
    /// is ignored.
    pub async fn spawn_as(
        &self,
        instance_id: InstanceId,
        workflow_id: &str,
        input: Value,
    ) -> Result<JoinHandle<Result<WorkflowResult>>> {
        let instance = match self.log.load_instance(instance_id).await? {
            Some(existing) => existing,
            None => self.create_instance(instance_id, workflow_id, input).await?,
        };

        let engine = self.clone();
        Ok(tokio::spawn(async move { engine.drive(instance).await }))
    }

    /// Continues an instance from its last recorded state.
    ///
    /// Terminal instances are returned as they are.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, instance_id: InstanceId) -> Result<WorkflowResult> {
        let instance = self
            .log
            .load_instance(instance_id)
            .await?
            .ok_or(WorkflowError::InstanceNotFound(instance_id))?;
        self.drive(instance).await
    }

    /// Resumes every `running` or `compensating` instance in the log.
    ///
    /// Instances are resumed concurrently. An instance that cannot be resumed
    /// is logged and left out of the returned results.
    pub async fn recover(&self) -> Result<Vec<WorkflowResult>> {
        let unfinished = self.log.unfinished_instances().await?;
        if unfinished.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = unfinished.len(), "recovering unfinished instances");

        let outcomes = join_all(
            unfinished
                .iter()
                .map(|header| self.resume(header.instance_id)),
        )
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (header, outcome) in unfinished.iter().zip(outcomes) {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(instance_id = %header.instance_id, error = %e, "recovery failed")
                }
            }
        }
        Ok(results)
    }

    /// Marks an instance for cancellation.
    ///
    /// The engine observes the mark before starting the next step and
    /// compensates instead of continuing. Returns false if the instance is
    /// already terminal.
    pub async fn request_cancellation(&self, instance_id: InstanceId) -> Result<bool> {
        let accepted = self
            .log
            .request_cancellation(instance_id)
            .await
            .map_err(not_found_as_workflow_error)?;
        if accepted {
            tracing::info!(%instance_id, "cancellation requested");
        }
        Ok(accepted)
    }

    /// Loads an instance with its full record list.
    pub async fn get_instance(&self, instance_id: InstanceId) -> Result<Option<WorkflowInstance>> {
        Ok(self.log.load_instance(instance_id).await?)
    }

    /// Current result view of an instance, whether or not it has finished.
    pub async fn result_of(&self, instance_id: InstanceId) -> Result<Option<WorkflowResult>> {
        let Some(instance) = self.log.load_instance(instance_id).await? else {
            return Ok(None);
        };
        let definition = self.catalog.get(&instance.header.definition_id);
        Ok(Some(WorkflowResult::from_instance(
            &instance,
            definition.as_deref(),
        )))
    }

    /// Lists instance headers.
    pub async fn list_instances(&self, query: InstanceQuery) -> Result<Vec<InstanceHeader>> {
        Ok(self.log.list_instances(query).await?)
    }

    /// Removes a terminal instance from the log.
    pub async fn purge_instance(&self, instance_id: InstanceId) -> Result<()> {
        self.log
            .purge_instance(instance_id)
            .await
            .map_err(not_found_as_workflow_error)?;
        tracing::info!(%instance_id, "instance purged");
        Ok(())
    }

    async fn create_instance(
        &self,
        instance_id: InstanceId,
        workflow_id: &str,
        input: Value,
    ) -> Result<WorkflowInstance> {
        let definition = self.catalog.require(workflow_id)?;
        let header = InstanceHeader::new(instance_id, definition.id(), input);

        self.log.create_instance(header.clone()).await?;

        metrics::counter!("workflow_executions_total", "workflow" => definition.id().to_string())
            .increment(1);
        tracing::info!(%instance_id, workflow = %definition.id(), "workflow instance created");

        Ok(WorkflowInstance::new(header, Vec::new()))
    }

    /// Runs an instance from wherever its records leave off to a final state.
    async fn drive(&self, mut instance: WorkflowInstance) -> Result<WorkflowResult> {
        let started = Instant::now();
        let definition = self.catalog.get(&instance.header.definition_id);

        if instance.status().is_terminal() {
            return Ok(WorkflowResult::from_instance(
                &instance,
                definition.as_deref(),
            ));
        }

        let Some(definition) = definition else {
            return self.fail_without_definition(instance, started).await;
        };

        if instance.status() == WorkflowStatus::Running {
            match self.run_forward(&mut instance, &definition).await? {
                None => {
                    return self
                        .finish(&mut instance, &definition, WorkflowStatus::Done, started)
                        .await;
                }
                Some(failure) => {
                    tracing::warn!(
                        instance_id = %instance.id(),
                        step = %failure.step,
                        error = %failure.error,
                        "workflow step failed; compensating"
                    );
                    instance.header.status = WorkflowStatus::Compensating;
                    instance.header.compensation_attempted = true;
                    instance.header.failure = Some(failure);
                    self.log.update_header(&instance.header).await?;
                }
            }
        }

        let remediation = self.run_compensation(&mut instance, &definition).await?;
        instance.header.remediation = remediation;
        let status = if instance.header.remediation.is_empty() {
            WorkflowStatus::Reverted
        } else {
            WorkflowStatus::Failed
        };
        self.finish(&mut instance, &definition, status, started).await
    }

    /// Runs the forward steps. Returns the failure that stopped them, if any.
    async fn run_forward(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<Option<FailureDetail>> {
        let mut bindings = Map::new();

        for (index, step) in definition.steps().iter().enumerate() {
            let key = step.idempotency_key(&instance.header.input);

            if let Some(output) = instance.succeeded_output(&key) {
                tracing::debug!(step = %step.name(), %key, "step already succeeded; reusing output");
                bindings.insert(step.binding().to_string(), output.clone());
                continue;
            }

            if let Some(failure) = recorded_failure(instance, step, &key) {
                return Ok(Some(failure));
            }

            // A step whose pending record exists has started and is finished
            // before the mark is honoured.
            let resuming = reopens(instance, RecordPhase::Invoke, &key);
            if !resuming && self.cancel_requested(instance.id()).await? {
                tracing::info!(instance_id = %instance.id(), step = %step.name(), "cancellation observed");
                return Ok(Some(FailureDetail::new(
                    step.name(),
                    FailureCause::Cancelled,
                    "cancellation requested",
                )));
            }

            instance.header.step_index = index;
            match self.run_step(instance, step, &key, &bindings).await? {
                Ok(output) => {
                    bindings.insert(step.binding().to_string(), output);
                    instance.header.step_index = index + 1;
                    self.log.update_header(&instance.header).await?;
                }
                Err(failure) => return Ok(Some(failure)),
            }
        }

        Ok(None)
    }

    /// Invokes one forward step and records its outcome.
    async fn run_step(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepSpec,
        key: &str,
        bindings: &Map<String, Value>,
    ) -> Result<std::result::Result<Value, FailureDetail>> {
        let registered = match self.catalog.registry().resolve(step.handler_name()) {
            Ok(registered) => registered,
            Err(e) => {
                return self
                    .record_step_failure(instance, step, key, StepFailure::Unresolvable(e.to_string()), 0)
                    .await;
            }
        };

        let input = match step
            .input_mapping()
            .resolve(&instance.header.input, bindings)
        {
            Ok(input) => input,
            Err(e) => {
                return self
                    .record_step_failure(instance, step, key, StepFailure::Mapping(e), 0)
                    .await;
            }
        };

        if !reopens(instance, RecordPhase::Invoke, key) {
            self.append(instance, |seq| {
                StepExecutionRecord::pending(seq, RecordPhase::Invoke, step.name(), key)
            })
            .await?;
        }

        tracing::info!(instance_id = %instance.id(), step = %step.name(), "workflow step started");

        let handler = registered.invoke_handler().clone();
        let base = context(instance, step.name(), key);
        let (outcome, attempts) = self
            .call_with_retry(step.name(), self.retry_for(step), self.timeout_for(step), |attempt| {
                let handler = handler.clone();
                let ctx = StepContext {
                    attempt,
                    ..base.clone()
                };
                let input = input.clone();
                async move { handler.invoke(&ctx, input).await }
            })
            .await;

        match outcome {
            Ok(output) => {
                self.append(instance, |seq| {
                    StepExecutionRecord::succeeded(seq, step.name(), key, output.clone(), attempts)
                })
                .await?;
                tracing::info!(instance_id = %instance.id(), step = %step.name(), attempts, "workflow step succeeded");
                Ok(Ok(output))
            }
            Err(failure) => {
                self.record_step_failure(instance, step, key, failure, attempts)
                    .await
            }
        }
    }

    async fn record_step_failure(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepSpec,
        key: &str,
        failure: StepFailure,
        attempts: u32,
    ) -> Result<std::result::Result<Value, FailureDetail>> {
        let cause = failure.cause();
        let error = failure.into_error(step.name()).to_string();
        let detail = FailureDetail::new(step.name(), cause, error.clone());
        let payload = serde_json::to_value(&detail)?;

        self.append(instance, |seq| StepExecutionRecord {
            payload: Some(payload),
            ..StepExecutionRecord::failed(seq, RecordPhase::Invoke, step.name(), key, error, attempts)
        })
        .await?;

        metrics::counter!("workflow_step_failures_total", "step" => step.name().to_string())
            .increment(1);
        Ok(Err(detail))
    }

    /// Walks the succeeded steps backwards, compensating each once.
    ///
    /// Returns the steps whose compensation failed, in walk order.
    async fn run_compensation(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<Vec<String>> {
        let completed: Vec<(String, String, Value)> = instance
            .succeeded_records()
            .map(|r| {
                (
                    r.step_name.clone(),
                    r.idempotency_key.clone(),
                    r.payload.clone().unwrap_or(Value::Null),
                )
            })
            .collect();

        for (step_name, key, output) in completed.iter().rev() {
            if instance.compensation_outcome(key).is_some() {
                continue;
            }
            self.compensate_step(instance, definition, step_name, key, output.clone())
                .await?;
        }

        Ok(completed
            .iter()
            .rev()
            .filter(|(_, key, _)| instance.compensation_outcome(key) == Some(RecordStatus::Failed))
            .map(|(step_name, _, _)| step_name.clone())
            .collect())
    }

    async fn compensate_step(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step_name: &str,
        key: &str,
        output: Value,
    ) -> Result<()> {
        let registered = definition
            .step_named(step_name)
            .ok_or_else(|| format!("step '{step_name}' is not part of the workflow"))
            .and_then(|step| {
                self.catalog
                    .registry()
                    .resolve(step.handler_name())
                    .map(|registered| (step, registered))
                    .map_err(|e| e.to_string())
            });

        let (step, registered) = match registered {
            Ok(found) => found,
            Err(reason) => {
                let error = WorkflowError::Compensation {
                    step: step_name.to_string(),
                    reason,
                }
                .to_string();
                self.append(instance, |seq| {
                    StepExecutionRecord::failed(seq, RecordPhase::Compensate, step_name, key, error, 0)
                })
                .await?;
                self.count_compensation(step_name, "failed");
                return Ok(());
            }
        };

        let Some(handler) = registered.compensate_handler().cloned() else {
            match self.config.missing_compensation {
                MissingCompensation::Skip => {
                    self.append(instance, |seq| {
                        StepExecutionRecord::skipped(seq, step_name, key, NO_COMPENSATE_HANDLER)
                    })
                    .await?;
                    self.count_compensation(step_name, "skipped");
                }
                MissingCompensation::Fail => {
                    let error = WorkflowError::Compensation {
                        step: step_name.to_string(),
                        reason: NO_COMPENSATE_HANDLER.to_string(),
                    }
                    .to_string();
                    self.append(instance, |seq| {
                        StepExecutionRecord::failed(seq, RecordPhase::Compensate, step_name, key, error, 0)
                    })
                    .await?;
                    self.count_compensation(step_name, "failed");
                }
            }
            return Ok(());
        };

        if !reopens(instance, RecordPhase::Compensate, key) {
            self.append(instance, |seq| {
                StepExecutionRecord::pending(seq, RecordPhase::Compensate, step_name, key)
            })
            .await?;
        }

        let base = context(instance, step_name, key);
        let (outcome, attempts) = self
            .call_with_retry(step_name, self.retry_for(step), self.timeout_for(step), |attempt| {
                let handler = handler.clone();
                let ctx = StepContext {
                    attempt,
                    ..base.clone()
                };
                let output = output.clone();
                async move { handler.compensate(&ctx, output).await }
            })
            .await;

        match outcome {
            Ok(()) => {
                self.append(instance, |seq| {
                    StepExecutionRecord::compensated(seq, step_name, key, attempts)
                })
                .await?;
                self.count_compensation(step_name, "compensated");
                tracing::info!(instance_id = %instance.id(), step = %step_name, "step compensated");
            }
            Err(failure) => {
                let reason = failure.into_error(step_name).to_string();
                let error = WorkflowError::Compensation {
                    step: step_name.to_string(),
                    reason,
                }
                .to_string();
                tracing::warn!(instance_id = %instance.id(), step = %step_name, %error, "compensation failed");
                self.append(instance, |seq| {
                    StepExecutionRecord::failed(
                        seq,
                        RecordPhase::Compensate,
                        step_name,
                        key,
                        error,
                        attempts,
                    )
                })
                .await?;
                self.count_compensation(step_name, "failed");
            }
        }
        Ok(())
    }

    /// Calls a handler until it succeeds, fails permanently or runs out of
    /// attempts. Returns the outcome and the number of attempts made.
    async fn call_with_retry<T, F, Fut>(
        &self,
        step_name: &str,
        policy: RetryPolicy,
        timeout: Duration,
        mut call: F,
    ) -> (std::result::Result<T, StepFailure>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AdapterError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match tokio::time::timeout(timeout, call(attempt)).await {
                Ok(Ok(value)) => return (Ok(value), attempt),
                Ok(Err(e)) => StepFailure::Handler(e),
                Err(_) => StepFailure::Timeout(timeout),
            };

            if !failure.is_retryable() || attempt >= policy.max_attempts() {
                return (Err(failure), attempt);
            }

            let backoff = policy.backoff(attempt);
            metrics::counter!("workflow_step_retries_total", "step" => step_name.to_string())
                .increment(1);
            tracing::warn!(
                step = %step_name,
                attempt,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = ?failure,
                "handler call failed; retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn finish(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        status: WorkflowStatus,
        started: Instant,
    ) -> Result<WorkflowResult> {
        debug_assert!(instance.status().can_transition_to(status));
        instance.header.status = status;
        self.log.update_header(&instance.header).await?;
        self.record_outcome(instance, started);
        Ok(WorkflowResult::from_instance(instance, Some(definition)))
    }

    /// Ends an instance whose definition is no longer available.
    async fn fail_without_definition(
        &self,
        mut instance: WorkflowInstance,
        started: Instant,
    ) -> Result<WorkflowResult> {
        let workflow_id = instance.header.definition_id.clone();
        tracing::error!(instance_id = %instance.id(), workflow = %workflow_id, "workflow definition missing");

        if instance.status() == WorkflowStatus::Compensating {
            let mut pending: Vec<String> = instance
                .succeeded_records()
                .filter(|r| {
                    !matches!(
                        instance.compensation_outcome(&r.idempotency_key),
                        Some(RecordStatus::Compensated | RecordStatus::Skipped)
                    )
                })
                .map(|r| r.step_name.clone())
                .collect();
            pending.reverse();
            instance.header.remediation = pending;
        } else {
            let step = instance
                .records
                .last()
                .map(|r| r.step_name.clone())
                .unwrap_or_default();
            instance.header.failure = Some(FailureDetail::new(
                step,
                FailureCause::Definition,
                WorkflowError::UnknownWorkflow(workflow_id).to_string(),
            ));
        }

        instance.header.status = WorkflowStatus::Failed;
        self.log.update_header(&instance.header).await?;
        self.record_outcome(&instance, started);
        Ok(WorkflowResult::from_instance(&instance, None))
    }

    fn record_outcome(&self, instance: &WorkflowInstance, started: Instant) {
        let workflow = instance.header.definition_id.clone();
        let duration = started.elapsed().as_secs_f64();
        metrics::histogram!("workflow_duration_seconds", "workflow" => workflow.clone())
            .record(duration);

        let instance_id = instance.id();
        match instance.status() {
            WorkflowStatus::Done => {
                metrics::counter!("workflow_completed_total", "workflow" => workflow).increment(1);
                tracing::info!(%instance_id, duration, "workflow completed");
            }
            WorkflowStatus::Reverted => {
                metrics::counter!("workflow_reverted_total", "workflow" => workflow).increment(1);
                tracing::warn!(%instance_id, duration, "workflow reverted");
            }
            WorkflowStatus::Failed => {
                metrics::counter!("workflow_failed_total", "workflow" => workflow).increment(1);
                tracing::error!(
                    %instance_id,
                    duration,
                    remediation = ?instance.header.remediation,
                    "workflow failed; manual remediation required"
                );
            }
            WorkflowStatus::Running | WorkflowStatus::Compensating => {}
        }
    }

    fn count_compensation(&self, step_name: &str, outcome: &'static str) {
        metrics::counter!(
            "workflow_compensations_total",
            "step" => step_name.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    async fn append(
        &self,
        instance: &mut WorkflowInstance,
        make: impl FnOnce(Sequence) -> StepExecutionRecord,
    ) -> Result<()> {
        let record = make(instance.last_sequence().next());
        self.log
            .append_record(instance.id(), record.clone())
            .await?;
        instance.records.push(record);
        Ok(())
    }

    async fn cancel_requested(&self, instance_id: InstanceId) -> Result<bool> {
        Ok(self
            .log
            .get_header(instance_id)
            .await?
            .is_some_and(|header| header.cancel_requested))
    }

    fn retry_for(&self, step: &StepSpec) -> RetryPolicy {
        step.retry_policy().unwrap_or(self.config.retry)
    }

    fn timeout_for(&self, step: &StepSpec) -> Duration {
        step.step_timeout().unwrap_or(self.config.step_timeout)
    }
}

/// Returns true if the open pending record belongs to this call, which the
/// next outcome record then closes.
fn reopens(instance: &WorkflowInstance, phase: RecordPhase, key: &str) -> bool {
    instance
        .open_pending()
        .is_some_and(|p| p.phase == phase && p.idempotency_key == key)
}

/// Failure recorded for a forward step before the header caught up.
fn recorded_failure(
    instance: &WorkflowInstance,
    step: &StepSpec,
    key: &str,
) -> Option<FailureDetail> {
    instance
        .records
        .iter()
        .rev()
        .find(|r| {
            r.phase == RecordPhase::Invoke
                && r.status == RecordStatus::Failed
                && r.idempotency_key == key
        })
        .map(|r| {
            r.payload
                .clone()
                .and_then(|p| serde_json::from_value(p).ok())
                .unwrap_or_else(|| {
                    FailureDetail::new(
                        step.name(),
                        FailureCause::Handler,
                        r.error.clone().unwrap_or_default(),
                    )
                })
        })
}

fn context(instance: &WorkflowInstance, step_name: &str, key: &str) -> StepContext {
    StepContext {
        instance_id: instance.id(),
        workflow_id: instance.header.definition_id.clone(),
        step_name: step_name.to_string(),
        idempotency_key: key.to_string(),
        attempt: 1,
    }
}

fn not_found_as_workflow_error(error: TransactionLogError) -> WorkflowError {
    match error {
        TransactionLogError::InstanceNotFound(id) => WorkflowError::InstanceNotFound(id),
        other => WorkflowError::TransactionLog(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{compensate_fn, invoke_fn};
    use crate::mapping::InputMapping;
    use crate::registry::StepRegistry;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use transaction_log::InMemoryTransactionLog;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    fn test_config() -> EngineConfig {
        EngineConfig::default()
            .with_retry(RetryPolicy::exponential(
                2,
                Duration::from_millis(1),
                Duration::from_millis(5),
            ))
            .with_step_timeout(Duration::from_secs(5))
    }

    /// A step that journals its calls and echoes its input.
    fn register_recording(registry: &StepRegistry, name: &'static str, journal: &Journal) {
        let invoked = journal.clone();
        let compensated = journal.clone();
        registry
            .register(
                name,
                invoke_fn(move |_ctx: StepContext, input: Value| {
                    let journal = invoked.clone();
                    async move {
                        journal.lock().unwrap().push(format!("invoke:{name}"));
                        Ok(json!({"step": name, "input": input}))
                    }
                }),
                Some(compensate_fn(move |_ctx: StepContext, _output: Value| {
                    let journal = compensated.clone();
                    async move {
                        journal.lock().unwrap().push(format!("compensate:{name}"));
                        Ok(())
                    }
                })),
            )
            .unwrap();
    }

    /// A step whose invoke always fails with `error`.
    fn register_failing(
        registry: &StepRegistry,
        name: &'static str,
        error: AdapterError,
        journal: &Journal,
    ) {
        let journal = journal.clone();
        registry
            .register(
                name,
                invoke_fn(move |_ctx: StepContext, _input: Value| {
                    let journal = journal.clone();
                    let error = error.clone();
                    async move {
                        journal.lock().unwrap().push(format!("invoke:{name}"));
                        Err(error)
                    }
                }),
                None,
            )
            .unwrap();
    }

    fn build(
        registry: StepRegistry,
        steps: Vec<StepSpec>,
        config: EngineConfig,
    ) -> (ExecutionEngine<InMemoryTransactionLog>, InMemoryTransactionLog) {
        registry.seal();
        let catalog = Arc::new(WorkflowCatalog::new(Arc::new(registry)));
        catalog.define("wf", steps).unwrap();
        let log = InMemoryTransactionLog::new();
        let engine = ExecutionEngine::new(Arc::new(log.clone()), catalog, config);
        (engine, log)
    }

    fn compensate_records(instance: &WorkflowInstance) -> Vec<(String, RecordStatus)> {
        instance
            .records
            .iter()
            .filter(|r| r.phase == RecordPhase::Compensate && !r.is_pending())
            .map(|r| (r.step_name.clone(), r.status))
            .collect()
    }

    #[tokio::test]
    async fn test_happy_path_binds_outputs() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &journal);
        register_recording(&registry, "b", &journal);
        let (engine, log) = build(
            registry,
            vec![
                StepSpec::new("a").input("input.order"),
                StepSpec::new("b").input("a.step").bind("second"),
            ],
            test_config(),
        );

        let result = engine
            .execute("wf", json!({"order": "ord_1"}))
            .await
            .unwrap();

        assert!(result.is_done());
        let output = result.output.unwrap();
        assert_eq!(output["a"], json!({"step": "a", "input": "ord_1"}));
        assert_eq!(output["second"]["input"], "a");
        assert!(result.failure.is_none());
        assert_eq!(entries(&journal), vec!["invoke:a", "invoke:b"]);

        let instance = engine.get_instance(result.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.records.len(), 4);
        assert_eq!(instance.header.step_index, 2);
        assert_eq!(log.instance_count().await, 1);
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &journal);
        register_recording(&registry, "b", &journal);
        register_failing(&registry, "c", AdapterError::rejected("boom"), &journal);
        let (engine, _log) = build(
            registry,
            vec![StepSpec::new("a"), StepSpec::new("b"), StepSpec::new("c")],
            test_config(),
        );

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Reverted);
        assert!(result.output.is_none());
        assert!(result.compensation_attempted);
        assert!(result.remediation.is_empty());
        let failure = result.failure.unwrap();
        assert_eq!(failure.step, "c");
        assert_eq!(failure.cause, FailureCause::Handler);
        assert!(failure.error.contains("boom"));

        assert_eq!(
            entries(&journal),
            vec!["invoke:a", "invoke:b", "invoke:c", "compensate:b", "compensate:a"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = StepRegistry::new();
        let counter = calls.clone();
        registry
            .register(
                "flaky",
                invoke_fn(move |ctx: StepContext, _input: Value| {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        assert_eq!(ctx.attempt, n);
                        if n < 3 {
                            Err(AdapterError::unavailable("try later"))
                        } else {
                            Ok(json!(n))
                        }
                    }
                }),
                None,
            )
            .unwrap();
        let (engine, _log) = build(registry, vec![StepSpec::new("flaky")], test_config());

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert!(result.is_done());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let instance = engine.get_instance(result.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.records.len(), 2, "one pending and one outcome per call");
        assert_eq!(instance.records[1].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_failing(&registry, "down", AdapterError::unavailable("503"), &journal);
        let (engine, _log) = build(registry, vec![StepSpec::new("down")], test_config());

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Reverted);
        assert_eq!(journal.lock().unwrap().len(), 3);
        let instance = engine.get_instance(result.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.records.last().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_rejected_is_not_retried() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_failing(&registry, "refuse", AdapterError::rejected("no"), &journal);
        let (engine, _log) = build(registry, vec![StepSpec::new("refuse")], test_config());

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Reverted);
        assert_eq!(entries(&journal), vec!["invoke:refuse"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &journal);
        registry
            .register(
                "slow",
                invoke_fn(|_ctx: StepContext, _input: Value| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }),
                None,
            )
            .unwrap();
        let (engine, _log) = build(
            registry,
            vec![
                StepSpec::new("a"),
                StepSpec::new("slow")
                    .timeout(Duration::from_millis(50))
                    .retry(RetryPolicy::none()),
            ],
            test_config(),
        );

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Reverted);
        let failure = result.failure.unwrap();
        assert_eq!(failure.cause, FailureCause::Timeout);
        assert!(failure.error.contains("timed out after 50ms"));
        assert_eq!(entries(&journal), vec!["invoke:a", "compensate:a"]);
    }

    #[tokio::test]
    async fn test_missing_compensation_is_skipped() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        registry
            .register(
                "audit",
                invoke_fn(|_ctx: StepContext, _input: Value| async move { Ok(json!("logged")) }),
                None,
            )
            .unwrap();
        register_failing(&registry, "fail", AdapterError::rejected("no"), &journal);
        let (engine, _log) = build(
            registry,
            vec![StepSpec::new("audit"), StepSpec::new("fail")],
            test_config(),
        );

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Reverted);
        let instance = engine.get_instance(result.instance_id).await.unwrap().unwrap();
        assert_eq!(
            compensate_records(&instance),
            vec![("audit".to_string(), RecordStatus::Skipped)]
        );
    }

    #[tokio::test]
    async fn test_missing_compensation_fails_under_fail_policy() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        registry
            .register(
                "audit",
                invoke_fn(|_ctx: StepContext, _input: Value| async move { Ok(json!("logged")) }),
                None,
            )
            .unwrap();
        register_failing(&registry, "fail", AdapterError::rejected("no"), &journal);
        let (engine, _log) = build(
            registry,
            vec![StepSpec::new("audit"), StepSpec::new("fail")],
            test_config().with_missing_compensation(MissingCompensation::Fail),
        );

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.compensation_attempted);
        assert_eq!(result.remediation, vec!["audit"]);
    }

    #[tokio::test]
    async fn test_compensation_failure_does_not_stop_the_walk() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &journal);
        let compensations = journal.clone();
        registry
            .register(
                "b",
                invoke_fn(|_ctx: StepContext, _input: Value| async move { Ok(json!("b")) }),
                Some(compensate_fn(move |_ctx: StepContext, _output: Value| {
                    let journal = compensations.clone();
                    async move {
                        journal.lock().unwrap().push("compensate:b".to_string());
                        Err(AdapterError::rejected("cannot undo"))
                    }
                })),
            )
            .unwrap();
        register_failing(&registry, "c", AdapterError::rejected("boom"), &journal);
        let (engine, _log) = build(
            registry,
            vec![StepSpec::new("a"), StepSpec::new("b"), StepSpec::new("c")],
            test_config(),
        );

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.compensation_attempted);
        assert_eq!(result.remediation, vec!["b"]);
        assert_eq!(result.failure.unwrap().step, "c");
        assert_eq!(
            entries(&journal),
            vec!["invoke:a", "invoke:c", "compensate:b", "compensate:a"]
        );

        let instance = engine.get_instance(result.instance_id).await.unwrap().unwrap();
        assert_eq!(
            compensate_records(&instance),
            vec![
                ("b".to_string(), RecordStatus::Failed),
                ("a".to_string(), RecordStatus::Compensated),
            ]
        );
    }

    #[tokio::test]
    async fn test_input_mapping_failure() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &journal);
        register_recording(&registry, "b", &journal);
        let (engine, _log) = build(
            registry,
            vec![
                StepSpec::new("a"),
                StepSpec::new("b").input(InputMapping::path("input.customer.email")),
            ],
            test_config(),
        );

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Reverted);
        assert_eq!(result.failure.unwrap().cause, FailureCause::InputMapping);
        assert_eq!(entries(&journal), vec!["invoke:a", "compensate:a"]);
    }

    #[tokio::test]
    async fn test_cancellation_between_steps() {
        let journal = Journal::default();
        let log = InMemoryTransactionLog::new();
        let registry = StepRegistry::new();
        register_recording(&registry, "b", &journal);
        let cancel_log = log.clone();
        let invoked = journal.clone();
        registry
            .register(
                "a",
                invoke_fn(move |ctx: StepContext, _input: Value| {
                    let log = cancel_log.clone();
                    let journal = invoked.clone();
                    async move {
                        journal.lock().unwrap().push("invoke:a".to_string());
                        match log.request_cancellation(ctx.instance_id).await {
                            Ok(_) => Ok(json!("a")),
                            Err(e) => Err(AdapterError::unavailable(e)),
                        }
                    }
                }),
                Some(compensate_fn(|_ctx: StepContext, _output: Value| async move { Ok(()) })),
            )
            .unwrap();
        registry.seal();
        let catalog = Arc::new(WorkflowCatalog::new(Arc::new(registry)));
        catalog
            .define("wf", vec![StepSpec::new("a"), StepSpec::new("b")])
            .unwrap();
        let engine = ExecutionEngine::new(Arc::new(log.clone()), catalog, test_config());

        let result = engine.execute("wf", json!({})).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Reverted);
        let failure = result.failure.unwrap();
        assert_eq!(failure.cause, FailureCause::Cancelled);
        assert_eq!(failure.step, "b");
        assert_eq!(entries(&journal), vec!["invoke:a"]);

        let header = log.get_header(result.instance_id).await.unwrap().unwrap();
        assert!(header.cancel_requested);
        assert!(!engine.request_cancellation(result.instance_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_workflow_creates_nothing() {
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &Journal::default());
        let (engine, log) = build(registry, vec![StepSpec::new("a")], test_config());

        let result = engine.execute("nope", json!({})).await;

        assert!(matches!(result, Err(WorkflowError::UnknownWorkflow(_))));
        assert_eq!(log.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &Journal::default());
        let (engine, _log) = build(registry, vec![StepSpec::new("a")], test_config());
        let id = InstanceId::new();

        assert!(matches!(
            engine.resume(id).await,
            Err(WorkflowError::InstanceNotFound(_))
        ));
        assert!(matches!(
            engine.request_cancellation(id).await,
            Err(WorkflowError::InstanceNotFound(_))
        ));
        assert!(engine.result_of(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execute_as_returns_existing_result() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &journal);
        let (engine, _log) = build(registry, vec![StepSpec::new("a")], test_config());
        let id = InstanceId::new();

        let first = engine.execute_as(id, "wf", json!({"n": 1})).await.unwrap();
        let second = engine.execute_as(id, "wf", json!({"n": 2})).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(entries(&journal), vec!["invoke:a"]);
    }

    #[tokio::test]
    async fn test_missing_definition_fails_without_compensation() {
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &Journal::default());
        let (engine, log) = build(registry, vec![StepSpec::new("a")], test_config());

        let header = InstanceHeader::new(InstanceId::new(), "retiredWorkflow", json!({}));
        let id = header.instance_id;
        log.create_instance(header).await.unwrap();

        let result = engine.resume(id).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(!result.compensation_attempted);
        assert_eq!(result.failure.unwrap().cause, FailureCause::Definition);
    }

    #[tokio::test]
    async fn test_spawn_and_poll() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &journal);
        let (engine, _log) = build(registry, vec![StepSpec::new("a")], test_config());

        let (id, handle) = engine.spawn_workflow("wf", json!({})).await.unwrap();
        assert!(engine.get_instance(id).await.unwrap().is_some());

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.instance_id, id);
        assert!(result.is_done());

        let polled = engine.result_of(id).await.unwrap().unwrap();
        assert_eq!(polled, result);
    }

    #[tokio::test]
    async fn test_list_and_purge() {
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &Journal::default());
        let (engine, log) = build(registry, vec![StepSpec::new("a")], test_config());

        let done = engine.execute("wf", json!({"n": 1})).await.unwrap();
        let stuck = InstanceHeader::new(InstanceId::new(), "wf", json!({"n": 2}));
        let stuck_id = stuck.instance_id;
        log.create_instance(stuck).await.unwrap();

        let unfinished = engine
            .list_instances(InstanceQuery::unfinished())
            .await
            .unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].instance_id, stuck_id);

        assert!(matches!(
            engine.purge_instance(stuck_id).await,
            Err(WorkflowError::TransactionLog(TransactionLogError::NotTerminal { .. }))
        ));
        engine.purge_instance(done.instance_id).await.unwrap();
        assert!(engine.get_instance(done.instance_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_finishes_unfinished_instances() {
        let journal = Journal::default();
        let registry = StepRegistry::new();
        register_recording(&registry, "a", &journal);
        let (engine, log) = build(registry, vec![StepSpec::new("a")], test_config());

        for n in 0..3 {
            log.create_instance(InstanceHeader::new(InstanceId::new(), "wf", json!({"n": n})))
                .await
                .unwrap();
        }

        let results = engine.recover().await.unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(WorkflowResult::is_done));
        assert!(engine.recover().await.unwrap().is_empty());
        assert_eq!(journal.lock().unwrap().len(), 3);
    }
}
