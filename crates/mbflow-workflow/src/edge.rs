use serde::{Deserialize, Serialize};

/// Configuration for a loop back-edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
  /// How many times the back-edge may fire per execution. Must be positive.
  pub max_iterations: u32,
}

/// How a join target decides it is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum JoinStrategy {
  /// Every eligible predecessor must have a satisfied edge.
  #[default]
  WaitAll,
  /// Any single satisfied edge suffices.
  WaitAny,
  /// At least `n` satisfied edges.
  FirstN { n: usize },
}

/// A directed edge between two nodes.
///
/// An edge carrying a `loop_config` is a back-edge: it must have no condition
/// and must target a node in a strictly earlier wave than its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
  pub id: String,
  pub source: String,
  pub target: String,
  /// Output handle on the source, for multi-output nodes.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_handle: Option<String>,
  /// Expression gating this edge; absent means unconditionally satisfied.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub condition: Option<String>,
  #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
  pub loop_config: Option<LoopConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub join: Option<JoinStrategy>,
}
