//! DAG analysis: edge classification and wave computation.
//!
//! Loop back-edges are removed before topology is computed, so the remaining
//! graph must be acyclic. Waves are peeled off Kahn-style: wave 0 holds the
//! nodes with no unresolved predecessors, each following wave the nodes whose
//! predecessors all sit in earlier waves.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::edge::Edge;
use crate::error::AnalysisError;
use crate::workflow::Workflow;

/// Classification of an edge within a schedule plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
  Direct,
  Conditional,
  LoopBack,
}

/// The schedulable shape of a workflow: wave-ordered node sets plus an edge
/// classification. Pure data; safe to cache per (workflow id, version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulePlan {
  /// Node ids grouped by wave, earliest first. Order within a wave is not
  /// meaningful; waves are sorted for determinism.
  pub waves: Vec<Vec<String>>,
  /// Wave index per node id.
  pub wave_of: HashMap<String, usize>,
  /// Classification per edge id.
  pub edge_kinds: HashMap<String, EdgeKind>,
}

impl SchedulePlan {
  /// The wave a node was assigned to.
  pub fn wave_of(&self, node_id: &str) -> Option<usize> {
    self.wave_of.get(node_id).copied()
  }
}

/// Validate a workflow and compute its schedule plan.
pub fn analyze(workflow: &Workflow) -> Result<SchedulePlan, AnalysisError> {
  let mut node_ids = HashSet::new();
  for node in &workflow.nodes {
    if !node_ids.insert(node.id.as_str()) {
      return Err(AnalysisError::DuplicateNodeId {
        id: node.id.clone(),
      });
    }
  }

  for edge in &workflow.edges {
    for endpoint in [&edge.source, &edge.target] {
      if !node_ids.contains(endpoint.as_str()) {
        return Err(AnalysisError::DanglingEdgeEndpoint {
          edge_id: edge.id.clone(),
          node_id: endpoint.clone(),
        });
      }
    }
    if edge.source == edge.target && edge.loop_config.is_none() {
      return Err(AnalysisError::SelfLoopWithoutMarker {
        edge_id: edge.id.clone(),
      });
    }
    if let Some(cfg) = &edge.loop_config {
      if cfg.max_iterations == 0 {
        return Err(AnalysisError::IllFormedLoop {
          edge_id: edge.id.clone(),
          message: "max_iterations must be positive".to_string(),
        });
      }
      if edge.condition.is_some() {
        return Err(AnalysisError::IllFormedLoop {
          edge_id: edge.id.clone(),
          message: "loop edges cannot carry a condition".to_string(),
        });
      }
    }
  }

  let (forward, loop_edges): (Vec<&Edge>, Vec<&Edge>) = workflow
    .edges
    .iter()
    .partition(|e| e.loop_config.is_none());

  let waves = peel_waves(&node_ids, &forward)?;

  let mut wave_of = HashMap::new();
  for (index, wave) in waves.iter().enumerate() {
    for node_id in wave {
      wave_of.insert(node_id.clone(), index);
    }
  }

  // A back-edge must close over at least one forward hop.
  for edge in &loop_edges {
    let source_wave = wave_of[&edge.source];
    let target_wave = wave_of[&edge.target];
    if target_wave >= source_wave {
      return Err(AnalysisError::IllFormedLoop {
        edge_id: edge.id.clone(),
        message: format!(
          "target wave {} is not earlier than source wave {}",
          target_wave, source_wave
        ),
      });
    }
  }

  let mut edge_kinds = HashMap::new();
  for edge in &workflow.edges {
    let kind = if edge.loop_config.is_some() {
      EdgeKind::LoopBack
    } else if edge.condition.is_some() {
      EdgeKind::Conditional
    } else {
      EdgeKind::Direct
    };
    edge_kinds.insert(edge.id.clone(), kind);
  }

  Ok(SchedulePlan {
    waves,
    wave_of,
    edge_kinds,
  })
}

/// Kahn peel over the forward edges.
fn peel_waves(
  node_ids: &HashSet<&str>,
  forward: &[&Edge],
) -> Result<Vec<Vec<String>>, AnalysisError> {
  let mut in_degree: HashMap<&str, usize> = node_ids.iter().map(|id| (*id, 0)).collect();
  let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();
  for edge in forward {
    *in_degree.get_mut(edge.target.as_str()).unwrap() += 1;
    downstream
      .entry(edge.source.as_str())
      .or_default()
      .push(edge.target.as_str());
  }

  let mut waves = Vec::new();
  let mut remaining = node_ids.len();
  let mut frontier: Vec<&str> = in_degree
    .iter()
    .filter(|(_, d)| **d == 0)
    .map(|(id, _)| *id)
    .collect();

  while !frontier.is_empty() {
    frontier.sort_unstable();
    remaining -= frontier.len();

    let mut next = Vec::new();
    for node_id in &frontier {
      for target in downstream.get(node_id).map(|v| v.as_slice()).unwrap_or(&[]) {
        let degree = in_degree.get_mut(target).unwrap();
        *degree -= 1;
        if *degree == 0 {
          next.push(*target);
        }
      }
    }

    waves.push(frontier.iter().map(|id| id.to_string()).collect());
    frontier = next;
  }

  if remaining > 0 {
    let mut nodes: Vec<String> = in_degree
      .iter()
      .filter(|(_, d)| **d > 0)
      .map(|(id, _)| id.to_string())
      .collect();
    nodes.sort_unstable();
    return Err(AnalysisError::CycleWithoutLoopMarker { nodes });
  }

  Ok(waves)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::edge::LoopConfig;
  use crate::node::Node;
  use crate::workflow::WorkflowStatus;
  use serde_json::Map;

  fn node(id: &str) -> Node {
    Node {
      id: id.to_string(),
      name: id.to_string(),
      node_type: "transform".to_string(),
      config: Map::new(),
      position: None,
      timeout_ms: None,
      max_retry_attempts: None,
      on_failure: Default::default(),
    }
  }

  fn edge(id: &str, source: &str, target: &str) -> Edge {
    Edge {
      id: id.to_string(),
      source: source.to_string(),
      target: target.to_string(),
      source_handle: None,
      condition: None,
      loop_config: None,
      join: None,
    }
  }

  fn workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> Workflow {
    Workflow {
      id: "wf".to_string(),
      name: "wf".to_string(),
      version: 1,
      status: WorkflowStatus::Active,
      nodes,
      edges,
      variables: Map::new(),
      metadata: None,
    }
  }

  #[test]
  fn linear_chain_one_node_per_wave() {
    let wf = workflow(
      vec![node("a"), node("b"), node("c")],
      vec![edge("e1", "a", "b"), edge("e2", "b", "c")],
    );
    let plan = analyze(&wf).unwrap();
    assert_eq!(plan.waves, vec![vec!["a"], vec!["b"], vec!["c"]]);
    assert_eq!(plan.wave_of("c"), Some(2));
  }

  #[test]
  fn diamond_fans_out_and_joins() {
    let wf = workflow(
      vec![node("a"), node("b"), node("c"), node("d")],
      vec![
        edge("e1", "a", "b"),
        edge("e2", "a", "c"),
        edge("e3", "b", "d"),
        edge("e4", "c", "d"),
      ],
    );
    let plan = analyze(&wf).unwrap();
    assert_eq!(plan.waves.len(), 3);
    assert_eq!(plan.waves[1], vec!["b", "c"]);
    assert_eq!(plan.wave_of("d"), Some(2));
  }

  #[test]
  fn plan_is_invariant_under_reordering() {
    let nodes = vec![node("a"), node("b"), node("c"), node("d")];
    let edges = vec![
      edge("e1", "a", "b"),
      edge("e2", "a", "c"),
      edge("e3", "b", "d"),
      edge("e4", "c", "d"),
    ];
    let plan = analyze(&workflow(nodes.clone(), edges.clone())).unwrap();

    let mut shuffled_nodes = nodes;
    shuffled_nodes.reverse();
    let mut shuffled_edges = edges;
    shuffled_edges.rotate_left(2);
    let reordered = analyze(&workflow(shuffled_nodes, shuffled_edges)).unwrap();

    assert_eq!(plan.wave_of, reordered.wave_of);
    assert_eq!(plan.waves, reordered.waves);
  }

  #[test]
  fn duplicate_node_id_rejected() {
    let wf = workflow(vec![node("a"), node("a")], vec![]);
    let err = analyze(&wf).unwrap_err();
    assert_eq!(err.code(), "duplicate_node_id");
  }

  #[test]
  fn dangling_endpoint_rejected() {
    let wf = workflow(vec![node("a")], vec![edge("e1", "a", "ghost")]);
    let err = analyze(&wf).unwrap_err();
    assert_eq!(err.code(), "dangling_edge_endpoint");
  }

  #[test]
  fn self_loop_without_marker_rejected() {
    let wf = workflow(vec![node("a")], vec![edge("e1", "a", "a")]);
    let err = analyze(&wf).unwrap_err();
    assert_eq!(err.code(), "self_loop_without_marker");
  }

  #[test]
  fn unmarked_cycle_rejected() {
    let wf = workflow(
      vec![node("a"), node("b")],
      vec![edge("e1", "a", "b"), edge("e2", "b", "a")],
    );
    let err = analyze(&wf).unwrap_err();
    assert_eq!(err.code(), "cycle_without_loop_marker");
  }

  #[test]
  fn marked_back_edge_classified_and_allowed() {
    let mut back = edge("e2", "b", "a");
    back.loop_config = Some(LoopConfig { max_iterations: 3 });
    let wf = workflow(vec![node("a"), node("b")], vec![edge("e1", "a", "b"), back]);
    let plan = analyze(&wf).unwrap();
    assert_eq!(plan.edge_kinds["e2"], EdgeKind::LoopBack);
    assert_eq!(plan.edge_kinds["e1"], EdgeKind::Direct);
    assert_eq!(plan.waves, vec![vec!["a"], vec!["b"]]);
  }

  #[test]
  fn forward_loop_edge_rejected() {
    let mut forward_loop = edge("e2", "a", "b");
    forward_loop.loop_config = Some(LoopConfig { max_iterations: 3 });
    let wf = workflow(
      vec![node("a"), node("b")],
      vec![edge("e1", "a", "b"), forward_loop],
    );
    let err = analyze(&wf).unwrap_err();
    assert_eq!(err.code(), "ill_formed_loop");
  }

  #[test]
  fn loop_edge_with_condition_rejected() {
    let mut back = edge("e2", "b", "a");
    back.loop_config = Some(LoopConfig { max_iterations: 3 });
    back.condition = Some("count < 10".to_string());
    let wf = workflow(vec![node("a"), node("b")], vec![edge("e1", "a", "b"), back]);
    let err = analyze(&wf).unwrap_err();
    assert_eq!(err.code(), "ill_formed_loop");
  }

  #[test]
  fn conditional_edge_classified() {
    let mut cond = edge("e1", "a", "b");
    cond.condition = Some("status == 200".to_string());
    let wf = workflow(vec![node("a"), node("b")], vec![cond]);
    let plan = analyze(&wf).unwrap();
    assert_eq!(plan.edge_kinds["e1"], EdgeKind::Conditional);
  }
}
