//! Edge gate evaluation.
//!
//! A node settles exactly once, at its wave. Predecessors that skipped or
//! failed-with-continue are ineligible; an edge is satisfied when its source
//! completed and its condition (if any) evaluated true. A node with no
//! satisfied edge is skipped, which propagates to everything reachable only
//! through it. Otherwise the join strategy decides readiness.

use std::collections::HashMap;

use mbflow_template::{Scope, TemplateError, eval_condition};
use mbflow_workflow::{JoinStrategy, Node, Workflow};
use serde_json::{Map, Value};

/// How a node ended up, as seen by downstream gates.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
  Completed(Value),
  Failed { continues: bool },
  Skipped,
  Cancelled,
}

/// One condition evaluation, reported for `condition.evaluated` events.
#[derive(Debug, Clone)]
pub struct ConditionEvaluation {
  pub edge_id: String,
  pub condition: String,
  pub result: bool,
}

/// Gate verdict for one node.
#[derive(Debug)]
pub enum GateDecision {
  Ready { input: Value },
  Skip,
}

pub struct GateOutcome {
  pub decision: GateDecision,
  pub evaluations: Vec<ConditionEvaluation>,
}

pub fn evaluate_gate(
  workflow: &Workflow,
  node: &Node,
  outcomes: &HashMap<String, NodeOutcome>,
  scope: &Scope,
  execution_input: &Map<String, Value>,
) -> Result<GateOutcome, TemplateError> {
  let incoming: Vec<_> = workflow.incoming(&node.id).collect();

  if incoming.is_empty() {
    return Ok(GateOutcome {
      decision: GateDecision::Ready {
        input: Value::Object(execution_input.clone()),
      },
      evaluations: Vec::new(),
    });
  }

  let mut evaluations = Vec::new();
  // Per eligible predecessor: did at least one of its edges pass?
  let mut eligible: HashMap<&str, bool> = HashMap::new();
  let mut satisfied_edges = 0usize;
  let mut satisfied_sources: Vec<&str> = Vec::new();
  let mut strategy = JoinStrategy::default();

  for edge in &incoming {
    if let Some(join) = edge.join {
      strategy = join;
    }
    let Some(NodeOutcome::Completed(output)) = outcomes.get(&edge.source) else {
      // Skipped, failed-with-continue, or cancelled source: ineligible.
      continue;
    };

    let passed = match &edge.condition {
      Some(condition) => {
        let result = eval_condition(condition, scope, Some(output))?;
        evaluations.push(ConditionEvaluation {
          edge_id: edge.id.clone(),
          condition: condition.clone(),
          result,
        });
        result
      }
      None => true,
    };

    let entry = eligible.entry(edge.source.as_str()).or_insert(false);
    if passed {
      if !*entry {
        satisfied_sources.push(edge.source.as_str());
      }
      *entry = true;
      satisfied_edges += 1;
    }
  }

  if satisfied_edges == 0 {
    return Ok(GateOutcome {
      decision: GateDecision::Skip,
      evaluations,
    });
  }

  let ready = match strategy {
    JoinStrategy::WaitAll => eligible.values().all(|satisfied| *satisfied),
    JoinStrategy::WaitAny => true,
    JoinStrategy::FirstN { n } => satisfied_edges >= n,
  };

  if !ready {
    return Ok(GateOutcome {
      decision: GateDecision::Skip,
      evaluations,
    });
  }

  satisfied_sources.sort_unstable();
  let input = build_input(&satisfied_sources, outcomes);
  Ok(GateOutcome {
    decision: GateDecision::Ready { input },
    evaluations,
  })
}

/// A single branch feeds its output through unchanged; a join sees the flat
/// merge of branch outputs with `{branch_id}_{key}` naming.
fn build_input(satisfied_sources: &[&str], outcomes: &HashMap<String, NodeOutcome>) -> Value {
  if let [only] = satisfied_sources {
    if let Some(NodeOutcome::Completed(output)) = outcomes.get(*only) {
      return output.clone();
    }
  }

  let mut merged = Map::new();
  for source in satisfied_sources {
    if let Some(NodeOutcome::Completed(output)) = outcomes.get(*source) {
      match output {
        Value::Object(map) => {
          for (key, value) in map {
            merged.insert(format!("{}_{}", source, key), value.clone());
          }
        }
        other => {
          merged.insert(source.to_string(), other.clone());
        }
      }
    }
  }
  Value::Object(merged)
}
