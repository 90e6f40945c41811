use async_trait::async_trait;
use mbflow_workflow::{
  Event, Execution, ExecutionStatus, NodeExecution, Trigger, Workflow,
};
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};

use crate::{Repository, StoreError};

/// SQLite-backed repository.
///
/// Hot lookup keys and the status column live as real columns; the record
/// bodies are stored as JSON documents. Status compare-and-set rides on the
/// `WHERE status = ?` clause of the update.
pub struct SqliteRepository {
  pool: SqlitePool,
}

impl SqliteRepository {
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Create the schema if it does not exist yet.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    for statement in [
      r#"
      CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
      )
      "#,
      r#"
      CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        data TEXT NOT NULL
      )
      "#,
      r#"
      CREATE TABLE IF NOT EXISTS node_executions (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        data TEXT NOT NULL
      )
      "#,
      r#"
      CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        data TEXT NOT NULL
      )
      "#,
      r#"
      CREATE TABLE IF NOT EXISTS triggers (
        id TEXT PRIMARY KEY,
        enabled INTEGER NOT NULL,
        fired_count INTEGER NOT NULL DEFAULT 0,
        data TEXT NOT NULL
      )
      "#,
    ] {
      sqlx::query(statement).execute(&self.pool).await?;
    }
    Ok(())
  }
}

fn status_str(status: ExecutionStatus) -> &'static str {
  match status {
    ExecutionStatus::Pending => "pending",
    ExecutionStatus::Running => "running",
    ExecutionStatus::Cancelling => "cancelling",
    ExecutionStatus::Completed => "completed",
    ExecutionStatus::Failed => "failed",
    ExecutionStatus::Cancelled => "cancelled",
    ExecutionStatus::Timeout => "timeout",
  }
}

#[async_trait]
impl Repository for SqliteRepository {
  async fn get_workflow(&self, id: &str) -> Result<Workflow, StoreError> {
    let row = sqlx::query("SELECT data FROM workflows WHERE id = ?")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| StoreError::NotFound(format!("workflow '{}'", id)))?;
    Ok(serde_json::from_str(row.get::<String, _>(0).as_str())?)
  }

  async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
    sqlx::query("INSERT OR REPLACE INTO workflows (id, data) VALUES (?, ?)")
      .bind(&workflow.id)
      .bind(serde_json::to_string(workflow)?)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO executions (id, workflow_id, status, data) VALUES (?, ?, ?, ?)")
      .bind(&execution.id)
      .bind(&execution.workflow_id)
      .bind(status_str(execution.status))
      .bind(serde_json::to_string(execution)?)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn get_execution(&self, id: &str) -> Result<Execution, StoreError> {
    let row = sqlx::query("SELECT data FROM executions WHERE id = ?")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| StoreError::NotFound(format!("execution '{}'", id)))?;
    Ok(serde_json::from_str(row.get::<String, _>(0).as_str())?)
  }

  async fn update_execution_status(
    &self,
    id: &str,
    expected: ExecutionStatus,
    status: ExecutionStatus,
    error: Option<&str>,
  ) -> Result<bool, StoreError> {
    let mut execution = self.get_execution(id).await?;
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

    let result = sqlx::query("UPDATE executions SET status = ?, data = ? WHERE id = ? AND status = ?")
      .bind(status_str(status))
      .bind(serde_json::to_string(&execution)?)
      .bind(id)
      .bind(status_str(expected))
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() == 1)
  }

  async fn update_execution_output(
    &self,
    id: &str,
    output: &Map<String, Value>,
  ) -> Result<(), StoreError> {
    let mut execution = self.get_execution(id).await?;
    execution.output = output.clone();
    sqlx::query("UPDATE executions SET data = ? WHERE id = ?")
      .bind(serde_json::to_string(&execution)?)
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn append_node_execution(&self, record: &NodeExecution) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO node_executions (id, execution_id, data) VALUES (?, ?, ?)")
      .bind(&record.id)
      .bind(&record.execution_id)
      .bind(serde_json::to_string(record)?)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn update_node_execution(&self, record: &NodeExecution) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE node_executions SET data = ? WHERE id = ?")
      .bind(serde_json::to_string(record)?)
      .bind(&record.id)
      .execute(&self.pool)
      .await?;
    if result.rows_affected() == 0 {
      return Err(StoreError::NotFound(format!(
        "node execution '{}'",
        record.id
      )));
    }
    Ok(())
  }

  async fn list_node_executions(
    &self,
    execution_id: &str,
  ) -> Result<Vec<NodeExecution>, StoreError> {
    let rows = sqlx::query("SELECT data FROM node_executions WHERE execution_id = ?")
      .bind(execution_id)
      .fetch_all(&self.pool)
      .await?;
    rows
      .into_iter()
      .map(|row| Ok(serde_json::from_str(row.get::<String, _>(0).as_str())?))
      .collect()
  }

  async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
    sqlx::query("INSERT INTO events (id, execution_id, sequence, data) VALUES (?, ?, ?, ?)")
      .bind(&event.id)
      .bind(&event.execution_id)
      .bind(event.sequence as i64)
      .bind(serde_json::to_string(event)?)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn list_events(&self, execution_id: &str) -> Result<Vec<Event>, StoreError> {
    let rows =
      sqlx::query("SELECT data FROM events WHERE execution_id = ? ORDER BY sequence ASC")
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
    rows
      .into_iter()
      .map(|row| Ok(serde_json::from_str(row.get::<String, _>(0).as_str())?))
      .collect()
  }

  async fn create_trigger(&self, trigger: &Trigger) -> Result<(), StoreError> {
    sqlx::query("INSERT OR REPLACE INTO triggers (id, enabled, data) VALUES (?, ?, ?)")
      .bind(&trigger.id)
      .bind(trigger.enabled)
      .bind(serde_json::to_string(trigger)?)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn list_enabled_triggers(&self) -> Result<Vec<Trigger>, StoreError> {
    let rows = sqlx::query("SELECT data FROM triggers WHERE enabled = 1")
      .fetch_all(&self.pool)
      .await?;
    rows
      .into_iter()
      .map(|row| Ok(serde_json::from_str(row.get::<String, _>(0).as_str())?))
      .collect()
  }

  async fn mark_trigger_fired(&self, id: &str) -> Result<(), StoreError> {
    sqlx::query("UPDATE triggers SET fired_count = fired_count + 1 WHERE id = ?")
      .bind(id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }
}
