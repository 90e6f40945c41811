use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::ExecContext;
use crate::error::ExecutorError;
use crate::registry::Executor;

/// Pure data-shaping executor.
///
/// The node config carries an `output` map whose values are templates; by
/// the time this executor runs they are fully resolved, so execution is just
/// handing the shaped map back. All the work happens in template resolution.
pub struct TransformExecutor;

#[async_trait]
impl Executor for TransformExecutor {
  fn validate(&self, config: &Map<String, Value>) -> Vec<String> {
    match config.get("output") {
      Some(Value::Object(_)) => vec![],
      Some(_) => vec!["'output' must be an object".to_string()],
      None => vec!["missing 'output' map".to_string()],
    }
  }

  async fn execute(
    &self,
    _ctx: &ExecContext,
    resolved_config: &Map<String, Value>,
    _input: &Value,
  ) -> Result<Value, ExecutorError> {
    match resolved_config.get("output") {
      Some(Value::Object(output)) => Ok(Value::Object(output.clone())),
      Some(other) => Ok(other.clone()),
      None => Err(ExecutorError::permanent("transform config has no 'output'")),
    }
  }
}
