use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::edge::Edge;
use crate::node::Node;

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
  Draft,
  Active,
  Inactive,
  Archived,
}

/// A workflow definition: a directed graph of typed nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
  pub id: String,
  pub name: String,
  pub version: i64,
  pub status: WorkflowStatus,
  pub nodes: Vec<Node>,
  pub edges: Vec<Edge>,
  /// Workflow-level variables, visible to every node's templates.
  #[serde(default)]
  pub variables: Map<String, Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub metadata: Option<Map<String, Value>>,
}

impl Workflow {
  /// Look up a node by id.
  pub fn node(&self, node_id: &str) -> Option<&Node> {
    self.nodes.iter().find(|n| n.id == node_id)
  }

  /// Look up an edge by id.
  pub fn edge(&self, edge_id: &str) -> Option<&Edge> {
    self.edges.iter().find(|e| e.id == edge_id)
  }

  /// Non-loop edges pointing at `node_id`.
  pub fn incoming(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
    self
      .edges
      .iter()
      .filter(move |e| e.target == node_id && e.loop_config.is_none())
  }

  /// Non-loop edges leaving `node_id`.
  pub fn outgoing(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
    self
      .edges
      .iter()
      .filter(move |e| e.source == node_id && e.loop_config.is_none())
  }

  /// Loop back-edges whose source is `node_id`.
  pub fn loop_edges_from(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
    self
      .edges
      .iter()
      .filter(move |e| e.source == node_id && e.loop_config.is_some())
  }
}
