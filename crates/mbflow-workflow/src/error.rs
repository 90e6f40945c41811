/// Error type for DAG analysis.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
  #[error("duplicate node id '{id}'")]
  DuplicateNodeId { id: String },

  #[error("edge '{edge_id}' references unknown node '{node_id}'")]
  DanglingEdgeEndpoint { edge_id: String, node_id: String },

  #[error("edge '{edge_id}' is a self-loop without a loop marker")]
  SelfLoopWithoutMarker { edge_id: String },

  #[error("cycle without loop markers through nodes {nodes:?}")]
  CycleWithoutLoopMarker { nodes: Vec<String> },

  #[error("ill-formed loop edge '{edge_id}': {message}")]
  IllFormedLoop { edge_id: String, message: String },
}

impl AnalysisError {
  /// Machine-readable error code.
  pub fn code(&self) -> &'static str {
    match self {
      Self::DuplicateNodeId { .. } => "duplicate_node_id",
      Self::DanglingEdgeEndpoint { .. } => "dangling_edge_endpoint",
      Self::SelfLoopWithoutMarker { .. } => "self_loop_without_marker",
      Self::CycleWithoutLoopMarker { .. } => "cycle_without_loop_marker",
      Self::IllFormedLoop { .. } => "ill_formed_loop",
    }
  }
}
