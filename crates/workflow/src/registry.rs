//! Step registry: named invoke/compensate handler pairs.
//!
//! The registry is filled at process start, sealed, then shared through an
//! `Arc` for concurrent lookups.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::adapter::{
    AdapterWrapper, CompensateHandler, CompensatingAdapter, InvokeHandler, ModuleAdapter,
};
use crate::error::{Result, WorkflowError};

/// A resolved step: its invoke handler and optional compensate handler.
#[derive(Clone)]
pub struct RegisteredStep {
    name: String,
    invoke: Arc<dyn InvokeHandler>,
    compensate: Option<Arc<dyn CompensateHandler>>,
}

impl RegisteredStep {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke_handler(&self) -> &Arc<dyn InvokeHandler> {
        &self.invoke
    }

    pub fn compensate_handler(&self) -> Option<&Arc<dyn CompensateHandler>> {
        self.compensate.as_ref()
    }

    /// Returns true if the step can be undone.
    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }
}

impl fmt::Debug for RegisteredStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredStep")
            .field("name", &self.name)
            .field("has_compensation", &self.has_compensation())
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    steps: HashMap<String, RegisteredStep>,
    sealed: bool,
}

/// Table of named steps.
#[derive(Default)]
pub struct StepRegistry {
    state: RwLock<RegistryState>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step from raw handlers.
    ///
    /// Fails with [`WorkflowError::DuplicateStep`] if the name is taken and
    /// [`WorkflowError::RegistrySealed`] after [`seal`](Self::seal).
    pub fn register(
        &self,
        name: impl Into<String>,
        invoke: Arc<dyn InvokeHandler>,
        compensate: Option<Arc<dyn CompensateHandler>>,
    ) -> Result<()> {
        let name = name.into();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.sealed {
            return Err(WorkflowError::RegistrySealed(name));
        }
        if state.steps.contains_key(&name) {
            return Err(WorkflowError::DuplicateStep(name));
        }

        tracing::debug!(step = %name, compensates = compensate.is_some(), "step registered");
        state.steps.insert(
            name.clone(),
            RegisteredStep {
                name,
                invoke,
                compensate,
            },
        );
        Ok(())
    }

    /// Registers a typed adapter with both invoke and compensate halves.
    pub fn register_adapter<A>(&self, name: impl Into<String>, adapter: A) -> Result<()>
    where
        A: CompensatingAdapter,
    {
        let adapter = Arc::new(adapter);
        self.register(
            name,
            Arc::new(AdapterWrapper::new(adapter.clone())),
            Some(Arc::new(AdapterWrapper::new(adapter))),
        )
    }

    /// Registers a typed adapter that has nothing to undo.
    pub fn register_invoke_only<A>(&self, name: impl Into<String>, adapter: A) -> Result<()>
    where
        A: ModuleAdapter,
    {
        self.register(name, Arc::new(AdapterWrapper::new(Arc::new(adapter))), None)
    }

    /// Looks up a step by name.
    pub fn resolve(&self, name: &str) -> Result<RegisteredStep> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .steps
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownStep(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .steps
            .contains_key(name)
    }

    /// Stops accepting registrations.
    pub fn seal(&self) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).sealed
    }

    /// Registered step names, sorted.
    pub fn names(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = state.steps.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .steps
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, StepContext, compensate_fn, invoke_fn};
    use serde_json::Value;

    fn echo() -> Arc<dyn InvokeHandler> {
        invoke_fn(|_ctx: StepContext, input: Value| async move { Ok(input) })
    }

    fn noop() -> Arc<dyn CompensateHandler> {
        compensate_fn(|_ctx: StepContext, _output: Value| async move {
            Ok::<(), AdapterError>(())
        })
    }

    #[test]
    fn test_register_then_resolve() {
        let registry = StepRegistry::new();
        registry.register("reserve", echo(), Some(noop())).unwrap();
        registry.register("notify", echo(), None).unwrap();

        let reserve = registry.resolve("reserve").unwrap();
        assert_eq!(reserve.name(), "reserve");
        assert!(reserve.has_compensation());
        assert!(!registry.resolve("notify").unwrap().has_compensation());
        assert_eq!(registry.names(), vec!["notify", "reserve"]);
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = StepRegistry::new();
        let result = registry.resolve("missing");
        assert!(matches!(result, Err(WorkflowError::UnknownStep(name)) if name == "missing"));
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let registry = StepRegistry::new();
        registry.register("reserve", echo(), None).unwrap();
        let result = registry.register("reserve", echo(), None);
        assert!(matches!(result, Err(WorkflowError::DuplicateStep(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sealed_registry_rejects_registration() {
        let registry = StepRegistry::new();
        registry.register("reserve", echo(), None).unwrap();
        registry.seal();

        assert!(registry.is_sealed());
        let result = registry.register("notify", echo(), None);
        assert!(matches!(result, Err(WorkflowError::RegistrySealed(_))));
        assert!(registry.resolve("reserve").is_ok());
    }

    #[test]
    fn test_concurrent_lookups() {
        let registry = Arc::new(StepRegistry::new());
        registry.register("reserve", echo(), None).unwrap();
        registry.seal();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.resolve("reserve").is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
