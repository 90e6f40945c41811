use std::sync::Arc;
use std::time::Duration;

use mbflow_observer::Observer;
use serde_json::{Map, Value};

/// Per-execution options.
#[derive(Default, Clone)]
pub struct ExecutionOptions {
  /// Worker pool size for this execution. `Some(0)` means serial; `None`
  /// falls back to the engine config.
  pub max_parallelism: Option<usize>,
  /// Observers to register on the engine's bus before the run starts. The
  /// bus is shared; registration outlives the run.
  pub observers: Vec<Arc<dyn Observer>>,
  /// Unresolved template variables fail the node instead of resolving empty.
  pub strict_mode: bool,
  /// Overall execution timeout; `None` falls back to the engine config.
  pub timeout: Option<Duration>,
  /// Runtime variables overriding workflow-level variables.
  pub variables: Map<String, Value>,
  /// Opaque caller identity token.
  pub caller: Option<String>,
}

impl ExecutionOptions {
  pub fn with_strict_mode(mut self, strict: bool) -> Self {
    self.strict_mode = strict;
    self
  }

  pub fn with_max_parallelism(mut self, n: usize) -> Self {
    self.max_parallelism = Some(n);
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
    self.variables = variables;
    self
  }

  pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
    self.observers.push(observer);
    self
  }

  pub fn with_caller(mut self, caller: &str) -> Self {
    self.caller = Some(caller.to_string());
    self
  }
}
