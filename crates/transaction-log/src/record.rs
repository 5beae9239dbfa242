use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a record within an instance's log.
///
/// Sequences start at 1 for the first record and increment by 1 for each
/// subsequent record of the same instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    /// Creates a sequence from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the sequence (0) of an instance with no records.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the sequence (1) of the first record.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw sequence value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Sequence {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Sequence> for i64 {
    fn from(sequence: Sequence) -> Self {
        sequence.0
    }
}

/// Whether a record belongs to the forward (invoke) or the backward
/// (compensate) walk of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPhase {
    Invoke,
    Compensate,
}

impl RecordPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordPhase::Invoke => "invoke",
            RecordPhase::Compensate => "compensate",
        }
    }
}

impl std::fmt::Display for RecordPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoke" => Ok(RecordPhase::Invoke),
            "compensate" => Ok(RecordPhase::Compensate),
            other => Err(format!("unknown record phase '{other}'")),
        }
    }
}

/// Outcome carried by a step execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// The handler is about to run. Written before the call.
    Pending,
    /// The invoke handler returned an output.
    Succeeded,
    /// The handler returned an error or timed out (after retries).
    Failed,
    /// The compensate handler completed.
    Compensated,
    /// The step declared no compensate handler; recorded as a no-op compensation.
    Skipped,
}

impl RecordStatus {
    /// Returns true for every status except `Pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Succeeded => "succeeded",
            RecordStatus::Failed => "failed",
            RecordStatus::Compensated => "compensated",
            RecordStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "succeeded" => Ok(RecordStatus::Succeeded),
            "failed" => Ok(RecordStatus::Failed),
            "compensated" => Ok(RecordStatus::Compensated),
            "skipped" => Ok(RecordStatus::Skipped),
            other => Err(format!("unknown record status '{other}'")),
        }
    }
}

/// One immutable entry in an instance's log.
///
/// Records are never updated once written: a step that starts, fails and
/// is later compensated leaves three records behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    /// Position within the instance's log.
    pub sequence: Sequence,

    /// Name of the step within its workflow definition.
    pub step_name: String,

    /// Forward or compensation walk.
    pub phase: RecordPhase,

    /// Outcome of this record.
    pub status: RecordStatus,

    /// Idempotency key of the step invocation this record belongs to.
    pub idempotency_key: String,

    /// Number of handler attempts made (0 for pending and skipped records).
    pub attempts: u32,

    /// Step output on success; failure detail on a failed invoke.
    pub payload: Option<serde_json::Value>,

    /// Error detail on failure.
    pub error: Option<String>,

    /// When the record was written.
    pub timestamp: DateTime<Utc>,
}

impl StepExecutionRecord {
    fn base(
        sequence: Sequence,
        phase: RecordPhase,
        status: RecordStatus,
        step_name: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            step_name: step_name.into(),
            phase,
            status,
            idempotency_key: idempotency_key.into(),
            attempts: 0,
            payload: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A handler is about to be called.
    pub fn pending(
        sequence: Sequence,
        phase: RecordPhase,
        step_name: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self::base(sequence, phase, RecordStatus::Pending, step_name, idempotency_key)
    }

    /// The invoke handler produced `output`.
    pub fn succeeded(
        sequence: Sequence,
        step_name: impl Into<String>,
        idempotency_key: impl Into<String>,
        output: serde_json::Value,
        attempts: u32,
    ) -> Self {
        Self {
            attempts,
            payload: Some(output),
            ..Self::base(
                sequence,
                RecordPhase::Invoke,
                RecordStatus::Succeeded,
                step_name,
                idempotency_key,
            )
        }
    }

    /// A handler failed in the given phase.
    pub fn failed(
        sequence: Sequence,
        phase: RecordPhase,
        step_name: impl Into<String>,
        idempotency_key: impl Into<String>,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            attempts,
            error: Some(error.into()),
            ..Self::base(sequence, phase, RecordStatus::Failed, step_name, idempotency_key)
        }
    }

    /// The compensate handler completed.
    pub fn compensated(
        sequence: Sequence,
        step_name: impl Into<String>,
        idempotency_key: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            attempts,
            ..Self::base(
                sequence,
                RecordPhase::Compensate,
                RecordStatus::Compensated,
                step_name,
                idempotency_key,
            )
        }
    }

    /// No compensate handler exists; `reason` says which policy applied.
    pub fn skipped(
        sequence: Sequence,
        step_name: impl Into<String>,
        idempotency_key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::base(
                sequence,
                RecordPhase::Compensate,
                RecordStatus::Skipped,
                step_name,
                idempotency_key,
            )
        }
    }

    /// Returns true if this is a pending record.
    pub fn is_pending(&self) -> bool {
        self.status == RecordStatus::Pending
    }

    /// Returns true if this is a successful forward record.
    pub fn is_success(&self) -> bool {
        self.phase == RecordPhase::Invoke && self.status == RecordStatus::Succeeded
    }
}
