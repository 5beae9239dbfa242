use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{InstanceId, RecordPhase, RecordStatus, Sequence, StepExecutionRecord};

/// The state of a workflow instance in its lifecycle.
///
/// State transitions:
/// ```text
/// Running ──┬──► Done
///           └──► Compensating ──┬──► Reverted
///                               └──► Failed
/// ```
/// `Running` may also go straight to `Failed` when the instance cannot be
/// driven at all (its definition is gone); such instances carry
/// `compensation_attempted = false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Forward steps are being executed.
    #[default]
    Running,

    /// All steps completed successfully (terminal state).
    Done,

    /// A step failed or cancellation was requested; compensations are running.
    Compensating,

    /// Every completed step was compensated (terminal state).
    Reverted,

    /// At least one compensation failed, or the instance could not run (terminal state).
    Failed,
}

impl WorkflowStatus {
    /// Returns true if the transition `self -> next` is allowed.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        matches!(
            (self, next),
            (WorkflowStatus::Running, WorkflowStatus::Done)
                | (WorkflowStatus::Running, WorkflowStatus::Compensating)
                | (WorkflowStatus::Running, WorkflowStatus::Failed)
                | (WorkflowStatus::Compensating, WorkflowStatus::Reverted)
                | (WorkflowStatus::Compensating, WorkflowStatus::Failed)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Done | WorkflowStatus::Reverted | WorkflowStatus::Failed
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Done => "done",
            WorkflowStatus::Compensating => "compensating",
            WorkflowStatus::Reverted => "reverted",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkflowStatus::Running),
            "done" => Ok(WorkflowStatus::Done),
            "compensating" => Ok(WorkflowStatus::Compensating),
            "reverted" => Ok(WorkflowStatus::Reverted),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(format!("unknown workflow status '{other}'")),
        }
    }
}

/// Why an instance left the forward path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The step handler returned an error.
    Handler,
    /// The step handler exceeded its timeout.
    Timeout,
    /// The step's input could not be built from the workflow input and bindings.
    InputMapping,
    /// Cancellation was requested between steps.
    Cancelled,
    /// The workflow definition was not available when the instance was resumed.
    Definition,
}

/// The originating error of a non-successful instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// The step that failed (or the step that would have run next on cancellation).
    pub step: String,
    pub cause: FailureCause,
    pub error: String,
}

impl FailureDetail {
    pub fn new(step: impl Into<String>, cause: FailureCause, error: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            cause,
            error: error.into(),
        }
    }
}

/// The mutable header row of a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHeader {
    pub instance_id: InstanceId,
    pub definition_id: String,
    pub input: serde_json::Value,
    pub status: WorkflowStatus,
    /// Index of the next forward step to run.
    pub step_index: usize,
    /// Set by [`crate::TransactionLog::request_cancellation`]; never cleared.
    pub cancel_requested: bool,
    /// True once the engine entered the compensation walk.
    pub compensation_attempted: bool,
    pub failure: Option<FailureDetail>,
    /// Steps whose compensation failed and need manual remediation.
    pub remediation: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceHeader {
    /// Creates the header of a freshly started instance.
    pub fn new(
        instance_id: InstanceId,
        definition_id: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            definition_id: definition_id.into(),
            input,
            status: WorkflowStatus::Running,
            step_index: 0,
            cancel_requested: false,
            compensation_attempted: false,
            failure: None,
            remediation: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A workflow instance reconstructed from the log: header plus full history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub header: InstanceHeader,
    pub records: Vec<StepExecutionRecord>,
}

impl WorkflowInstance {
    pub fn new(header: InstanceHeader, records: Vec<StepExecutionRecord>) -> Self {
        Self { header, records }
    }

    pub fn id(&self) -> InstanceId {
        self.header.instance_id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.header.status
    }

    pub fn records(&self) -> &[StepExecutionRecord] {
        &self.records
    }

    /// Sequence of the last record, or [`Sequence::initial`] when empty.
    pub fn last_sequence(&self) -> Sequence {
        self.records
            .last()
            .map(|r| r.sequence)
            .unwrap_or(Sequence::initial())
    }

    /// Returns the pending record not yet followed by an outcome, if any.
    ///
    /// Only the last record can be open: every pending record is immediately
    /// followed by the outcome of the same call unless the process died.
    pub fn open_pending(&self) -> Option<&StepExecutionRecord> {
        self.records.last().filter(|r| r.is_pending())
    }

    /// Output recorded by a successful forward call with this idempotency key.
    pub fn succeeded_output(&self, idempotency_key: &str) -> Option<&serde_json::Value> {
        self.records
            .iter()
            .find(|r| r.is_success() && r.idempotency_key == idempotency_key)
            .and_then(|r| r.payload.as_ref())
    }

    /// Successful forward records in the order they were written.
    pub fn succeeded_records(&self) -> impl Iterator<Item = &StepExecutionRecord> {
        self.records.iter().filter(|r| r.is_success())
    }

    /// Outcome of the compensation of the step invocation with this key, if
    /// one was recorded.
    pub fn compensation_outcome(&self, idempotency_key: &str) -> Option<RecordStatus> {
        self.records
            .iter()
            .rev()
            .find(|r| {
                r.phase == RecordPhase::Compensate
                    && r.status.is_terminal()
                    && r.idempotency_key == idempotency_key
            })
            .map(|r| r.status)
    }
}
