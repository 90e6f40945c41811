use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Pending,
  Running,
  /// Cancel requested; in-flight tasks are draining.
  Cancelling,
  Completed,
  Failed,
  Cancelled,
  Timeout,
}

impl ExecutionStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
    )
  }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
  pub id: String,
  pub workflow_id: String,
  /// Workflow version this execution was planned against.
  pub workflow_version: i64,
  pub status: ExecutionStatus,
  #[serde(default)]
  pub input: Map<String, Value>,
  #[serde(default)]
  pub output: Map<String, Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  /// Opaque caller identity; the engine never interprets it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub triggered_by: Option<String>,
  /// Unresolved template variables fail the execution instead of resolving empty.
  #[serde(default)]
  pub strict_mode: bool,
  /// Runtime variables overriding workflow-level variables.
  #[serde(default)]
  pub variables: Map<String, Value>,
  pub created_at: DateTime<Utc>,
}

impl Execution {
  /// A fresh pending execution for the given workflow.
  pub fn new(workflow_id: &str, workflow_version: i64, input: Map<String, Value>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      workflow_id: workflow_id.to_string(),
      workflow_version,
      status: ExecutionStatus::Pending,
      input,
      output: Map::new(),
      error: None,
      started_at: None,
      completed_at: None,
      triggered_by: None,
      strict_mode: false,
      variables: Map::new(),
      created_at: Utc::now(),
    }
  }
}

/// Status of a single node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Skipped,
  Cancelled,
}

/// One node's run within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
  pub id: String,
  pub execution_id: String,
  pub node_id: String,
  pub status: NodeExecutionStatus,
  #[serde(default)]
  pub input: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub output: Option<Value>,
  /// The node config as authored.
  #[serde(default)]
  pub config: Map<String, Value>,
  /// The config after template resolution.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub resolved_config: Option<Map<String, Value>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub retry_count: u32,
}

impl NodeExecution {
  /// A fresh pending record for `node_id` within `execution_id`.
  pub fn new(execution_id: &str, node_id: &str, config: Map<String, Value>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      execution_id: execution_id.to_string(),
      node_id: node_id.to_string(),
      status: NodeExecutionStatus::Pending,
      input: Value::Null,
      output: None,
      config,
      resolved_config: None,
      error: None,
      started_at: None,
      completed_at: None,
      retry_count: 0,
    }
  }
}
