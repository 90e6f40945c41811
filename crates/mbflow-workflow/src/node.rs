use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a node failure does to the rest of the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
  /// The execution fails with this node's error.
  #[default]
  Fatal,
  /// The execution continues; nodes reachable only through this one are skipped.
  Continue,
}

/// Canvas position, carried for UI round-trips only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
  pub x: f64,
  pub y: f64,
}

/// A single computation node in a workflow.
///
/// The `config` map is opaque to the engine: it is resolved against the
/// template scope and handed to the executor registered for `node_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
  pub id: String,
  pub name: String,
  #[serde(rename = "type")]
  pub node_type: String,
  #[serde(default)]
  pub config: Map<String, Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub position: Option<Position>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_retry_attempts: Option<u32>,
  #[serde(default)]
  pub on_failure: OnFailure,
}
