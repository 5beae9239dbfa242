//! Module invocation adapter: the boundary through which the engine calls
//! domain modules.
//!
//! The engine only sees JSON-in/JSON-out handlers ([`InvokeHandler`],
//! [`CompensateHandler`]). Modules are wired in either through a typed
//! [`ModuleAdapter`], which is erased behind those traits, or through plain
//! async closures ([`invoke_fn`], [`compensate_fn`]).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::InstanceId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub instance_id: InstanceId,
    pub workflow_id: String,
    pub step_name: String,
    /// Stable across retries, resumes and the compensation of this step.
    pub idempotency_key: String,
    /// 1-based attempt number within the current call.
    pub attempt: u32,
}

impl StepContext {
    /// The reference a module should record its side effect under.
    ///
    /// Scoped to the instance, so two instances started with the same input
    /// never share an effect while retries and resumes of one instance do.
    pub fn module_reference(&self) -> String {
        format!("{}/{}", self.instance_id, self.idempotency_key)
    }
}

/// Error returned by a step handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// The module refused the request. Retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The module could not be reached or answered with a transient error.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl AdapterError {
    pub fn rejected(reason: impl std::fmt::Display) -> Self {
        AdapterError::Rejected(reason.to_string())
    }

    pub fn unavailable(reason: impl std::fmt::Display) -> Self {
        AdapterError::Unavailable(reason.to_string())
    }

    /// Returns true if the engine may retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Unavailable(_))
    }
}

/// Forward half of a registered step.
#[async_trait]
pub trait InvokeHandler: Send + Sync {
    /// Performs the step. Must be idempotent for a given
    /// [`StepContext::idempotency_key`].
    async fn invoke(&self, ctx: &StepContext, input: Value) -> Result<Value, AdapterError>;
}

/// Backward half of a registered step.
#[async_trait]
pub trait CompensateHandler: Send + Sync {
    /// Undoes the step given the output its invoke produced. Must be
    /// idempotent.
    async fn compensate(&self, ctx: &StepContext, output: Value) -> Result<(), AdapterError>;
}

/// A typed module adapter.
///
/// Input is decoded from the mapped step input; a decode failure is reported
/// as [`AdapterError::Rejected`] without calling the adapter.
#[async_trait]
pub trait ModuleAdapter: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn invoke(
        &self,
        ctx: &StepContext,
        input: Self::Input,
    ) -> Result<Self::Output, AdapterError>;
}

/// A typed module adapter whose effects can be undone.
#[async_trait]
pub trait CompensatingAdapter: ModuleAdapter {
    async fn compensate(&self, ctx: &StepContext, output: Self::Output)
    -> Result<(), AdapterError>;
}

/// Erases a typed adapter into JSON handlers.
pub(crate) struct AdapterWrapper<A> {
    adapter: Arc<A>,
}

impl<A> AdapterWrapper<A> {
    pub(crate) fn new(adapter: Arc<A>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl<A> InvokeHandler for AdapterWrapper<A>
where
    A: ModuleAdapter,
{
    async fn invoke(&self, ctx: &StepContext, input: Value) -> Result<Value, AdapterError> {
        let typed: A::Input = serde_json::from_value(input)
            .map_err(|e| AdapterError::Rejected(format!("invalid input: {e}")))?;
        let output = self.adapter.invoke(ctx, typed).await?;
        serde_json::to_value(output)
            .map_err(|e| AdapterError::Rejected(format!("output not serializable: {e}")))
    }
}

#[async_trait]
impl<A> CompensateHandler for AdapterWrapper<A>
where
    A: CompensatingAdapter,
{
    async fn compensate(&self, ctx: &StepContext, output: Value) -> Result<(), AdapterError> {
        let typed: A::Output = serde_json::from_value(output)
            .map_err(|e| AdapterError::Rejected(format!("recorded output unreadable: {e}")))?;
        self.adapter.compensate(ctx, typed).await
    }
}

struct FnInvoke<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> InvokeHandler for FnInvoke<F>
where
    F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AdapterError>> + Send + 'static,
{
    async fn invoke(&self, ctx: &StepContext, input: Value) -> Result<Value, AdapterError> {
        (self.f)(ctx.clone(), input).await
    }
}

struct FnCompensate<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> CompensateHandler for FnCompensate<F>
where
    F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AdapterError>> + Send + 'static,
{
    async fn compensate(&self, ctx: &StepContext, output: Value) -> Result<(), AdapterError> {
        (self.f)(ctx.clone(), output).await
    }
}

/// Wraps an async closure as an invoke handler.
pub fn invoke_fn<F, Fut>(f: F) -> Arc<dyn InvokeHandler>
where
    F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AdapterError>> + Send + 'static,
{
    Arc::new(FnInvoke { f })
}

/// Wraps an async closure as a compensate handler.
pub fn compensate_fn<F, Fut>(f: F) -> Arc<dyn CompensateHandler>
where
    F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AdapterError>> + Send + 'static,
{
    Arc::new(FnCompensate { f })
}
