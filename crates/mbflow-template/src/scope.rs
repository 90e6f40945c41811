use serde_json::{Map, Value};

/// The variable scope templates resolve against.
///
/// Lookup order within the single flattened namespace: workflow variables are
/// overridden by execution variables, node outputs shadow both under their
/// node id, and `input` / `env` are reserved keys that nothing shadows.
#[derive(Debug, Clone, Default)]
pub struct Scope {
  root: Map<String, Value>,
}

impl Scope {
  pub fn new(
    workflow_variables: &Map<String, Value>,
    execution_variables: &Map<String, Value>,
    input: &Map<String, Value>,
  ) -> Self {
    let mut root = workflow_variables.clone();
    for (key, value) in execution_variables {
      root.insert(key.clone(), value.clone());
    }
    let mut scope = Self { root };
    scope.set_reserved(input);
    scope
  }

  fn set_reserved(&mut self, input: &Map<String, Value>) {
    self
      .root
      .insert("input".to_string(), Value::Object(input.clone()));
    let env: Map<String, Value> = std::env::vars()
      .map(|(k, v)| (k, Value::String(v)))
      .collect();
    self.root.insert("env".to_string(), Value::Object(env));
  }

  /// Merge a node's output into the scope under its id, shadowing any
  /// variable of the same name. Reserved keys are never overwritten.
  pub fn set_node_output(&mut self, node_id: &str, output: Value) {
    if node_id == "input" || node_id == "env" {
      return;
    }
    self.root.insert(node_id.to_string(), output);
  }

  /// Set a single variable at the top level.
  pub fn set_variable(&mut self, key: &str, value: Value) {
    if key == "input" || key == "env" {
      return;
    }
    self.root.insert(key.to_string(), value);
  }

  /// The flattened scope as a JSON object, for expression contexts.
  pub fn as_object(&self) -> &Map<String, Value> {
    &self.root
  }
}
