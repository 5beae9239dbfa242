//! Input mapping: how a step's input is built from the workflow input and
//! the outputs of earlier steps.
//!
//! Path expressions are dot separated. The first segment is either `input`
//! (the workflow input) or the name of an output binding; the remaining
//! segments select object fields or, when numeric, array elements:
//!
//! ```text
//! input                      the whole workflow input
//! input.customer.email       a field of the workflow input
//! reservation                the whole output bound as `reservation`
//! label.labels.0             first element of a bound array
//! ```

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

/// Root segment that names the workflow input.
pub const INPUT_ROOT: &str = "input";

/// Failure to build a step input at run time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("'{0}' does not resolve to a value")]
    MissingValue(String),

    #[error("binding '{0}' has not been produced")]
    UnboundBinding(String),
}

/// Where a path starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRoot {
    Input,
    Binding(String),
}

/// A step input expression.
#[derive(Debug, Clone, PartialEq)]
pub enum InputMapping {
    /// Follows a path from the workflow input or a binding.
    Path {
        root: PathRoot,
        segments: Vec<String>,
    },
    /// A constant value.
    Literal(Value),
    /// An object whose fields are themselves mappings.
    Object(BTreeMap<String, InputMapping>),
}

impl Default for InputMapping {
    fn default() -> Self {
        InputMapping::input()
    }
}

impl InputMapping {
    /// The whole workflow input.
    pub fn input() -> Self {
        InputMapping::Path {
            root: PathRoot::Input,
            segments: Vec::new(),
        }
    }

    /// Parses a dot separated path expression.
    ///
    /// Parsing never fails; malformed expressions (empty segments) are
    /// reported by [`validate`](Self::validate) when the workflow is defined.
    pub fn path(expression: &str) -> Self {
        let mut parts = expression.split('.').map(str::to_string);
        let head = parts.next().unwrap_or_default();
        let root = if head == INPUT_ROOT {
            PathRoot::Input
        } else {
            PathRoot::Binding(head)
        };
        InputMapping::Path {
            root,
            segments: parts.collect(),
        }
    }

    /// A constant value.
    pub fn literal(value: Value) -> Self {
        InputMapping::Literal(value)
    }

    /// An object template.
    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, InputMapping)>,
    {
        InputMapping::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Binding names this mapping reads, in first-seen order.
    pub fn referenced_bindings(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_bindings(&mut out);
        out
    }

    fn collect_bindings<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            InputMapping::Path {
                root: PathRoot::Binding(name),
                ..
            } => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            InputMapping::Path { .. } | InputMapping::Literal(_) => {}
            InputMapping::Object(fields) => {
                for mapping in fields.values() {
                    mapping.collect_bindings(out);
                }
            }
        }
    }

    /// Checks the expression is well formed and only reads bindings listed
    /// in `available`.
    pub fn validate(&self, available: &[&str]) -> Result<(), String> {
        match self {
            InputMapping::Path { root, segments } => {
                if let PathRoot::Binding(name) = root {
                    if name.is_empty() {
                        return Err("empty path expression".to_string());
                    }
                    if !available.contains(&name.as_str()) {
                        return Err(format!(
                            "'{name}' is neither the workflow input nor an earlier binding"
                        ));
                    }
                }
                if segments.iter().any(String::is_empty) {
                    return Err(format!("'{}' has an empty segment", self.describe()));
                }
                Ok(())
            }
            InputMapping::Literal(_) => Ok(()),
            InputMapping::Object(fields) => fields
                .values()
                .try_for_each(|mapping| mapping.validate(available)),
        }
    }

    /// Builds the step input.
    pub fn resolve(&self, input: &Value, bindings: &Map<String, Value>) -> Result<Value, MappingError> {
        match self {
            InputMapping::Path { root, segments } => {
                let start = match root {
                    PathRoot::Input => input,
                    PathRoot::Binding(name) => bindings
                        .get(name)
                        .ok_or_else(|| MappingError::UnboundBinding(name.clone()))?,
                };
                segments
                    .iter()
                    .try_fold(start, |value, segment| select(value, segment))
                    .cloned()
                    .ok_or_else(|| MappingError::MissingValue(self.describe()))
            }
            InputMapping::Literal(value) => Ok(value.clone()),
            InputMapping::Object(fields) => {
                let mut object = Map::new();
                for (key, mapping) in fields {
                    object.insert(key.clone(), mapping.resolve(input, bindings)?);
                }
                Ok(Value::Object(object))
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            InputMapping::Path { root, segments } => {
                let head = match root {
                    PathRoot::Input => INPUT_ROOT,
                    PathRoot::Binding(name) => name.as_str(),
                };
                std::iter::once(head)
                    .chain(segments.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(".")
            }
            InputMapping::Literal(value) => value.to_string(),
            InputMapping::Object(_) => "{..}".to_string(),
        }
    }
}

fn select<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

impl From<&str> for InputMapping {
    fn from(expression: &str) -> Self {
        InputMapping::path(expression)
    }
}
