use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What happened, as a dotted wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
  #[serde(rename = "execution.started")]
  ExecutionStarted,
  #[serde(rename = "execution.completed")]
  ExecutionCompleted,
  #[serde(rename = "execution.failed")]
  ExecutionFailed,
  #[serde(rename = "execution.cancelled")]
  ExecutionCancelled,
  #[serde(rename = "execution.paused")]
  ExecutionPaused,
  #[serde(rename = "execution.resumed")]
  ExecutionResumed,
  #[serde(rename = "wave.started")]
  WaveStarted,
  #[serde(rename = "wave.completed")]
  WaveCompleted,
  #[serde(rename = "node.started")]
  NodeStarted,
  #[serde(rename = "node.completed")]
  NodeCompleted,
  #[serde(rename = "node.failed")]
  NodeFailed,
  #[serde(rename = "node.skipped")]
  NodeSkipped,
  #[serde(rename = "node.retrying")]
  NodeRetrying,
  #[serde(rename = "node.cancelled")]
  NodeCancelled,
  #[serde(rename = "condition.evaluated")]
  ConditionEvaluated,
  #[serde(rename = "variable.set")]
  VariableSet,
  #[serde(rename = "state.changed")]
  StateChanged,
}

/// One record in an execution's event stream.
///
/// `sequence` is contiguous and strictly increasing per execution, starting
/// at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
  pub id: String,
  pub execution_id: String,
  pub workflow_id: String,
  pub event_type: EventType,
  pub sequence: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node_type: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub wave_index: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub node_count: Option<usize>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub duration_ms: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  /// Type-specific extras not covered by the flat fields.
  #[serde(default, skip_serializing_if = "Value::is_null")]
  pub payload: Value,
  pub created_at: DateTime<Utc>,
}

impl Event {
  pub fn new(
    execution_id: &str,
    workflow_id: &str,
    event_type: EventType,
    sequence: u64,
  ) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      execution_id: execution_id.to_string(),
      workflow_id: workflow_id.to_string(),
      event_type,
      sequence,
      node_id: None,
      node_name: None,
      node_type: None,
      wave_index: None,
      node_count: None,
      status: None,
      duration_ms: None,
      error: None,
      output: None,
      payload: Value::Null,
      created_at: Utc::now(),
    }
  }

  pub fn with_node(mut self, node_id: &str, node_name: &str, node_type: &str) -> Self {
    self.node_id = Some(node_id.to_string());
    self.node_name = Some(node_name.to_string());
    self.node_type = Some(node_type.to_string());
    self
  }

  pub fn with_wave(mut self, index: usize, node_count: usize) -> Self {
    self.wave_index = Some(index);
    self.node_count = Some(node_count);
    self
  }

  pub fn with_status(mut self, status: &str) -> Self {
    self.status = Some(status.to_string());
    self
  }

  pub fn with_duration(mut self, duration_ms: u64) -> Self {
    self.duration_ms = Some(duration_ms);
    self
  }

  pub fn with_error(mut self, error: &str) -> Self {
    self.error = Some(error.to_string());
    self
  }

  pub fn with_output(mut self, output: Value) -> Self {
    self.output = Some(output);
    self
  }

  pub fn with_payload(mut self, payload: Value) -> Self {
    self.payload = payload;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn event_type_serializes_dotted() {
    let tag = serde_json::to_string(&EventType::NodeRetrying).unwrap();
    assert_eq!(tag, "\"node.retrying\"");
    let back: EventType = serde_json::from_str("\"wave.started\"").unwrap();
    assert_eq!(back, EventType::WaveStarted);
  }
}
