//! Durable workflow orchestration.
//!
//! A workflow is an ordered list of steps. Each step names a registered
//! invoke/compensate handler pair, declares how its input is built from the
//! workflow input and earlier outputs, and how its idempotency key is
//! derived. The [`ExecutionEngine`] runs workflow instances step by step,
//! records every outcome in a [`transaction_log::TransactionLog`] and, when a
//! step fails or cancellation is requested, compensates the completed steps
//! in reverse order.
//!
//! ```text
//! running ──┬──► done
//!           └──► compensating ──┬──► reverted
//!                               └──► failed
//! ```

pub mod adapter;
pub mod commerce;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod idempotency;
pub mod mapping;
pub mod registry;
pub mod retry;

pub use adapter::{
    AdapterError, CompensateHandler, CompensatingAdapter, InvokeHandler, ModuleAdapter,
    StepContext, compensate_fn, invoke_fn,
};
pub use config::{EngineConfig, MissingCompensation};
pub use definition::{StepSpec, WorkflowCatalog, WorkflowDefinition};
pub use engine::{ExecutionEngine, WorkflowResult};
pub use error::{Result, WorkflowError};
pub use idempotency::IdempotencyRule;
pub use mapping::{InputMapping, MappingError};
pub use registry::{RegisteredStep, StepRegistry};
pub use retry::RetryPolicy;
pub use transaction_log::{FailureCause, FailureDetail, InstanceId, WorkflowStatus};
