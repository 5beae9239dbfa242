//! Failure injection for the in-memory services.

use std::time::Duration;

/// What an operation does on its next call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Carry out the operation.
    Proceed,
    /// Refuse with a business error. Retrying does not help.
    Reject,
    /// Fail with a transient error.
    Unavailable,
}

/// Injected failures for one service operation.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    reject: bool,
    unavailable_remaining: u32,
    delay: Option<Duration>,
}

impl FaultPlan {
    /// Refuse every call while set.
    pub fn set_reject(&mut self, reject: bool) {
        self.reject = reject;
    }

    /// Fail the next `times` calls with a transient error.
    pub fn set_unavailable(&mut self, times: u32) {
        self.unavailable_remaining = times;
    }

    /// Sleep before answering each call.
    pub fn set_delay(&mut self, delay: Option<Duration>) {
        self.delay = delay;
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Decides the outcome of the next call, consuming one transient failure.
    pub fn next_outcome(&mut self) -> FaultOutcome {
        if self.reject {
            FaultOutcome::Reject
        } else if self.unavailable_remaining > 0 {
            self.unavailable_remaining -= 1;
            FaultOutcome::Unavailable
        } else {
            FaultOutcome::Proceed
        }
    }
}

/// Sleeps for the configured delay, if any.
pub(crate) async fn apply_delay(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}
