//! Engine configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// What the compensation walk does with a completed step that has no
/// compensate handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingCompensation {
    /// Record a no-op compensation and continue.
    #[default]
    Skip,
    /// Record the step as needing manual remediation; the instance ends `failed`.
    Fail,
}

impl FromStr for MissingCompensation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(MissingCompensation::Skip),
            "fail" => Ok(MissingCompensation::Fail),
            other => Err(format!("unknown missing-compensation policy '{other}'")),
        }
    }
}

/// Engine defaults applied to steps that do not set their own.
///
/// Reads from environment variables:
/// - `WORKFLOW_STEP_TIMEOUT_MS`: per-call timeout (default: `30000`)
/// - `WORKFLOW_MAX_RETRIES`: retries after the first attempt (default: `3`)
/// - `WORKFLOW_RETRY_BACKOFF_MS`: first retry wait, doubled per retry (default: `100`)
/// - `WORKFLOW_MISSING_COMPENSATION`: `skip` or `fail` (default: `skip`)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub step_timeout: Duration,
    pub retry: RetryPolicy,
    pub missing_compensation: MissingCompensation,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let step_timeout = parse_or(&lookup, "WORKFLOW_STEP_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.step_timeout);
        let max_retries =
            parse_or(&lookup, "WORKFLOW_MAX_RETRIES").unwrap_or(defaults.retry.max_retries);
        let initial_backoff = parse_or(&lookup, "WORKFLOW_RETRY_BACKOFF_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.initial_backoff);
        let missing_compensation = parse_or(&lookup, "WORKFLOW_MISSING_COMPENSATION")
            .unwrap_or(defaults.missing_compensation);

        Self {
            step_timeout,
            retry: RetryPolicy::exponential(
                max_retries,
                initial_backoff,
                defaults.retry.max_backoff.max(initial_backoff),
            ),
            missing_compensation,
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_missing_compensation(mut self, policy: MissingCompensation) -> Self {
        self.missing_compensation = policy;
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            missing_compensation: MissingCompensation::Skip,
        }
    }
}
