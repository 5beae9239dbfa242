//! Idempotency key derivation.
//!
//! A step's key is `"{step_name}:{token}"` where the token is derived from
//! the workflow input. The key is stable across retries and resumes, so the
//! engine can detect a step that already succeeded and the module can
//! deduplicate repeated calls.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::mapping::InputMapping;

/// Separates the step name from the token in a key. Step names may not
/// contain it, so distinct steps never share a key.
pub const KEY_SEPARATOR: char = ':';

/// Function deriving a token from the workflow input.
pub type KeyFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// How a step's idempotency token is derived from the workflow input.
#[derive(Clone, Default)]
pub enum IdempotencyRule {
    /// UUID v5 over the canonical JSON of the whole input.
    #[default]
    InputHash,
    /// The value at a path of the input, e.g. `input.fulfillment_id`.
    InputField(String),
    /// A caller supplied function.
    Custom(KeyFn),
}

impl IdempotencyRule {
    pub fn input_field(path: impl Into<String>) -> Self {
        IdempotencyRule::InputField(path.into())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        IdempotencyRule::Custom(Arc::new(f))
    }

    /// Derives the full key of `step_name` for this input.
    ///
    /// An `InputField` whose path does not resolve falls back to the input
    /// hash, so a key always exists.
    pub fn key_for(&self, step_name: &str, input: &Value) -> String {
        let token = match self {
            IdempotencyRule::InputHash => input_hash(input),
            IdempotencyRule::InputField(path) => {
                match InputMapping::path(path).resolve(input, &serde_json::Map::new()) {
                    Ok(Value::String(s)) => s,
                    Ok(other) => canonical_json(&other),
                    Err(_) => input_hash(input),
                }
            }
            IdempotencyRule::Custom(f) => f(input),
        };
        format!("{step_name}{KEY_SEPARATOR}{token}")
    }
}

impl fmt::Debug for IdempotencyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdempotencyRule::InputHash => write!(f, "InputHash"),
            IdempotencyRule::InputField(path) => f.debug_tuple("InputField").field(path).finish(),
            IdempotencyRule::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Serializes with object keys in sorted order.
///
/// `serde_json::Map` is ordered by key unless the `preserve_order` feature
/// is enabled, which this workspace does not do.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

/// UUID v5 of the canonical JSON of `value`.
pub fn input_hash(value: &Value) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical_json(value).as_bytes()).to_string()
}
