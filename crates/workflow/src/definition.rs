//! Workflow definitions and the process-wide definition table.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::error::{Result, WorkflowError};
use crate::idempotency::{IdempotencyRule, KEY_SEPARATOR};
use crate::mapping::{INPUT_ROOT, InputMapping};
use crate::registry::StepRegistry;
use crate::retry::RetryPolicy;

/// One step of a workflow.
///
/// Unset retry policy and timeout fall back to the engine defaults.
#[derive(Debug, Clone)]
pub struct StepSpec {
    name: String,
    handler: String,
    input: InputMapping,
    binding: String,
    retry: Option<RetryPolicy>,
    idempotency: IdempotencyRule,
    timeout: Option<Duration>,
}

impl StepSpec {
    /// A step named `name` calling the registered step of the same name,
    /// fed the whole workflow input and bound under its own name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            handler: name.clone(),
            binding: name.clone(),
            name,
            input: InputMapping::input(),
            retry: None,
            idempotency: IdempotencyRule::default(),
            timeout: None,
        }
    }

    /// Registered step to call.
    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = handler.into();
        self
    }

    pub fn input(mut self, mapping: impl Into<InputMapping>) -> Self {
        self.input = mapping.into();
        self
    }

    /// Name the output is bound under for later steps and the workflow output.
    pub fn bind(mut self, binding: impl Into<String>) -> Self {
        self.binding = binding.into();
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn idempotency(mut self, rule: IdempotencyRule) -> Self {
        self.idempotency = rule;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler_name(&self) -> &str {
        &self.handler
    }

    pub fn input_mapping(&self) -> &InputMapping {
        &self.input
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry
    }

    pub fn idempotency_rule(&self) -> &IdempotencyRule {
        &self.idempotency
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Idempotency key of this step for a workflow input.
    pub fn idempotency_key(&self, workflow_input: &serde_json::Value) -> String {
        self.idempotency.key_for(&self.name, workflow_input)
    }
}

/// A validated, immutable workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    id: String,
    steps: Vec<StepSpec>,
}

impl WorkflowDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepSpec> {
        self.steps.get(index)
    }

    /// Looks up a step by name.
    pub fn step_named(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Table of workflow definitions keyed by identifier.
///
/// Every definition is validated against the step registry when defined.
#[derive(Debug)]
pub struct WorkflowCatalog {
    registry: Arc<StepRegistry>,
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowCatalog {
    pub fn new(registry: Arc<StepRegistry>) -> Self {
        Self {
            registry,
            definitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Validates and stores a definition.
    ///
    /// Fails with [`WorkflowError::InvalidWorkflow`] when:
    /// - there are no steps, or a step or binding name is empty or repeated
    /// - a step name contains `:`, the idempotency key separator
    /// - a step's handler is not registered
    /// - a binding is named `input`
    /// - an input mapping reads a binding not produced by an earlier step
    ///
    /// and with [`WorkflowError::DuplicateWorkflow`] if the identifier is taken.
    pub fn define(
        &self,
        id: impl Into<String>,
        steps: Vec<StepSpec>,
    ) -> Result<Arc<WorkflowDefinition>> {
        let id = id.into();
        validate(&id, &steps, &self.registry)?;

        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if definitions.contains_key(&id) {
            return Err(WorkflowError::DuplicateWorkflow(id));
        }

        let definition = Arc::new(WorkflowDefinition {
            id: id.clone(),
            steps,
        });
        definitions.insert(id.clone(), definition.clone());
        tracing::debug!(workflow = %id, steps = definition.len(), "workflow defined");

        Ok(definition)
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Looks up a definition, failing with [`WorkflowError::UnknownWorkflow`].
    pub fn require(&self, id: &str) -> Result<Arc<WorkflowDefinition>> {
        self.get(id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(id.to_string()))
    }

    /// Defined identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        let definitions = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = definitions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn validate(id: &str, steps: &[StepSpec], registry: &StepRegistry) -> Result<()> {
    if id.trim().is_empty() {
        return Err(WorkflowError::invalid(id, "identifier is empty"));
    }
    if steps.is_empty() {
        return Err(WorkflowError::invalid(id, "workflow has no steps"));
    }

    let mut names = HashSet::new();
    let mut bound: Vec<&str> = Vec::new();

    for step in steps {
        if step.name.is_empty() {
            return Err(WorkflowError::invalid(id, "step name is empty"));
        }
        if step.name.contains(KEY_SEPARATOR) {
            return Err(WorkflowError::invalid(
                id,
                format!("step name '{}' contains '{KEY_SEPARATOR}'", step.name),
            ));
        }
        if !names.insert(step.name.as_str()) {
            return Err(WorkflowError::invalid(
                id,
                format!("step name '{}' is repeated", step.name),
            ));
        }
        if !registry.contains(&step.handler) {
            return Err(WorkflowError::invalid(
                id,
                format!(
                    "step '{}' references unregistered step '{}'",
                    step.name, step.handler
                ),
            ));
        }

        step.input.validate(&bound).map_err(|reason| {
            WorkflowError::invalid(id, format!("input of step '{}': {reason}", step.name))
        })?;

        if let IdempotencyRule::InputField(path) = &step.idempotency
            && !path.split('.').next().is_some_and(|root| root == INPUT_ROOT)
        {
            return Err(WorkflowError::invalid(
                id,
                format!(
                    "idempotency field of step '{}' must be an input path, got '{path}'",
                    step.name
                ),
            ));
        }

        if step.binding.is_empty() || step.binding == INPUT_ROOT || step.binding.contains('.') {
            return Err(WorkflowError::invalid(
                id,
                format!("step '{}' has invalid binding '{}'", step.name, step.binding),
            ));
        }
        if bound.contains(&step.binding.as_str()) {
            return Err(WorkflowError::invalid(
                id,
                format!("binding '{}' is repeated", step.binding),
            ));
        }
        bound.push(&step.binding);
    }

    Ok(())
}
