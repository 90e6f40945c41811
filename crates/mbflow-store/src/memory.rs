use async_trait::async_trait;
use dashmap::DashMap;
use mbflow_workflow::{
  Event, Execution, ExecutionStatus, NodeExecution, Trigger, Workflow,
};
use serde_json::{Map, Value};

use crate::{Repository, StoreError};

/// In-process repository for tests and embedded runs.
#[derive(Default)]
pub struct MemoryRepository {
  workflows: DashMap<String, Workflow>,
  executions: DashMap<String, Execution>,
  node_executions: DashMap<String, Vec<NodeExecution>>,
  events: DashMap<String, Vec<Event>>,
  triggers: DashMap<String, Trigger>,
  fired: DashMap<String, u64>,
}

impl MemoryRepository {
  pub fn new() -> Self {
    Self::default()
  }

  /// How many times a trigger was marked fired.
  pub fn fired_count(&self, trigger_id: &str) -> u64 {
    self.fired.get(trigger_id).map(|c| *c).unwrap_or(0)
  }
}

#[async_trait]
impl Repository for MemoryRepository {
  async fn get_workflow(&self, id: &str) -> Result<Workflow, StoreError> {
    self
      .workflows
      .get(id)
      .map(|w| w.clone())
      .ok_or_else(|| StoreError::NotFound(format!("workflow '{}'", id)))
  }

  async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
    self.workflows.insert(workflow.id.clone(), workflow.clone());
    Ok(())
  }

  async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
    self.executions.insert(execution.id.clone(), execution.clone());
    Ok(())
  }

  async fn get_execution(&self, id: &str) -> Result<Execution, StoreError> {
    self
      .executions
      .get(id)
      .map(|e| e.clone())
      .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", id)))
  }

  async fn update_execution_status(
    &self,
    id: &str,
    expected: ExecutionStatus,
    status: ExecutionStatus,
    error: Option<&str>,
  ) -> Result<bool, StoreError> {
    let mut execution = self
      .executions
      .get_mut(id)
      .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", id)))?;
    if execution.status != expected {
      return Ok(false);
    }
    execution.status = status;
    if let Some(error) = error {
      execution.error = Some(error.to_string());
    }
    match status {
      ExecutionStatus::Running => execution.started_at = Some(chrono::Utc::now()),
      s if s.is_terminal() => execution.completed_at = Some(chrono::Utc::now()),
      _ => {}
    }
    Ok(true)
  }

  async fn update_execution_output(
    &self,
    id: &str,
    output: &Map<String, Value>,
  ) -> Result<(), StoreError> {
    let mut execution = self
      .executions
      .get_mut(id)
      .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", id)))?;
    execution.output = output.clone();
    Ok(())
  }

  async fn append_node_execution(&self, record: &NodeExecution) -> Result<(), StoreError> {
    self
      .node_executions
      .entry(record.execution_id.clone())
      .or_default()
      .push(record.clone());
    Ok(())
  }

  async fn update_node_execution(&self, record: &NodeExecution) -> Result<(), StoreError> {
    let mut records = self
      .node_executions
      .get_mut(&record.execution_id)
      .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", record.execution_id)))?;
    match records.iter_mut().find(|r| r.id == record.id) {
      Some(existing) => {
        *existing = record.clone();
        Ok(())
      }
      None => Err(StoreError::NotFound(format!(
        "node execution '{}'",
        record.id
      ))),
    }
  }

  async fn list_node_executions(
    &self,
    execution_id: &str,
  ) -> Result<Vec<NodeExecution>, StoreError> {
    Ok(
      self
        .node_executions
        .get(execution_id)
        .map(|r| r.clone())
        .unwrap_or_default(),
    )
  }

  async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
    self
      .events
      .entry(event.execution_id.clone())
      .or_default()
      .push(event.clone());
    Ok(())
  }

  async fn list_events(&self, execution_id: &str) -> Result<Vec<Event>, StoreError> {
    Ok(
      self
        .events
        .get(execution_id)
        .map(|e| e.clone())
        .unwrap_or_default(),
    )
  }

  async fn create_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
    self.triggers.insert(trigger.id.clone(), trigger.clone());
    Ok(())
  }

  async fn list_enabled_triggers(&self) -> Result<Vec<Trigger>, StoreError> {
    Ok(
      self
        .triggers
        .iter()
        .filter(|t| t.enabled)
        .map(|t| t.clone())
        .collect(),
    )
  }

  async fn mark_trigger_fired(&self, id: &str) -> Result<(), StoreError> {
    *self.fired.entry(id.to_string()).or_insert(0) += 1;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mbflow_workflow::WorkflowStatus;

  fn workflow(id: &str) -> Workflow {
    Workflow {
      id: id.to_string(),
      name: id.to_string(),
      version: 1,
      status: WorkflowStatus::Active,
      nodes: vec![],
      edges: vec![],
      variables: Map::new(),
      metadata: None,
    }
  }

  #[tokio::test]
  async fn workflow_round_trip() {
    let repo = MemoryRepository::new();
    repo.create_workflow(&workflow("w1")).await.unwrap();
    assert_eq!(repo.get_workflow("w1").await.unwrap().id, "w1");
    assert!(repo.get_workflow("missing").await.is_err());
  }

  #[tokio::test]
  async fn status_cas_rejects_stale_transitions() {
    let repo = MemoryRepository::new();
    let execution = Execution::new("w1", 1, Map::new());
    let id = execution.id.clone();
    repo.create_execution(&execution).await.unwrap();

    assert!(
      repo
        .update_execution_status(&id, ExecutionStatus::Pending, ExecutionStatus::Running, None)
        .await
        .unwrap()
    );
    // Stale CAS: still expecting pending.
    assert!(
      !repo
        .update_execution_status(&id, ExecutionStatus::Pending, ExecutionStatus::Failed, None)
        .await
        .unwrap()
    );
    assert_eq!(
      repo.get_execution(&id).await.unwrap().status,
      ExecutionStatus::Running
    );
  }

  #[tokio::test]
  async fn node_executions_append_and_update() {
    let repo = MemoryRepository::new();
    let mut record = NodeExecution::new("e1", "n1", Map::new());
    repo.append_node_execution(&record).await.unwrap();

    record.retry_count = 2;
    repo.update_node_execution(&record).await.unwrap();

    let listed = repo.list_node_executions("e1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].retry_count, 2);
  }
}
