//! Single-node execution: permit acquisition, template resolution, executor
//! dispatch, retry with backoff, and record/event bookkeeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mbflow_executor::{ExecContext, ExecutorError, ExecutorRegistry};
use mbflow_store::Repository;
use mbflow_template::{Scope, resolve_config};
use mbflow_workflow::{
  EventType, Node, NodeExecution, NodeExecutionStatus, OnFailure,
};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::emit::Emitter;
use crate::gate::NodeOutcome;

/// What a settled node task reports back to the wave loop.
pub struct TaskResult {
  pub node_id: String,
  pub outcome: NodeOutcome,
  pub error: Option<String>,
  /// Whether this failure must fail the whole execution.
  pub fatal: bool,
}

impl TaskResult {
  fn completed(node_id: &str, output: Value) -> Self {
    Self {
      node_id: node_id.to_string(),
      outcome: NodeOutcome::Completed(output),
      error: None,
      fatal: false,
    }
  }

  fn cancelled(node_id: &str) -> Self {
    Self {
      node_id: node_id.to_string(),
      outcome: NodeOutcome::Cancelled,
      error: None,
      fatal: false,
    }
  }

  fn failed(node_id: &str, error: String, fatal: bool, continues: bool) -> Self {
    Self {
      node_id: node_id.to_string(),
      outcome: NodeOutcome::Failed { continues },
      error: Some(error),
      fatal,
    }
  }
}

/// Everything one node run needs, owned so it can cross into a spawned task.
pub struct NodeTask {
  pub node: Node,
  pub input: Value,
  pub scope: Scope,
  pub strict: bool,
  pub registry: ExecutorRegistry,
  pub repository: Option<Arc<dyn Repository>>,
  pub emitter: Arc<Emitter>,
  pub retry: RetryPolicy,
  pub node_timeout: Duration,
  pub cancel: CancellationToken,
  pub semaphore: Arc<Semaphore>,
  pub execution_id: String,
  pub workflow_id: String,
}

impl NodeTask {
  pub async fn run(self) -> TaskResult {
    // FIFO permit acquisition; a cancel while queued abandons the task.
    let _permit = tokio::select! {
      biased;
      _ = self.cancel.cancelled() => {
        self.emit_node(EventType::NodeCancelled, "cancelled", None).await;
        return TaskResult::cancelled(&self.node.id);
      }
      permit = self.semaphore.clone().acquire_owned() => match permit {
        Ok(permit) => permit,
        Err(_) => return TaskResult::cancelled(&self.node.id),
      },
    };

    let mut record = NodeExecution::new(&self.execution_id, &self.node.id, self.node.config.clone());
    record.status = NodeExecutionStatus::Running;
    record.input = self.input.clone();
    record.started_at = Some(chrono::Utc::now());

    if !self.persist_append(&record).await {
      return TaskResult::failed(
        &self.node.id,
        "failed to persist node execution".to_string(),
        true,
        false,
      );
    }
    self.emit_node(EventType::NodeStarted, "running", None).await;

    let started = Instant::now();

    // Template resolution happens once; its failures do not retry.
    let resolved = match resolve_config(&self.node.config, &self.scope, self.strict) {
      Ok(resolved) => resolved,
      Err(e) => {
        return self
          .fail(record, e.code(), e.to_string(), self.node.on_failure == OnFailure::Fatal)
          .await;
      }
    };
    record.resolved_config = Some(resolved.clone());

    let Some(executor) = self.registry.get(&self.node.node_type) else {
      return self
        .fail(
          record,
          "executor_not_found",
          format!("no executor registered for type '{}'", self.node.node_type),
          true,
        )
        .await;
    };

    let max_retries = self.node.max_retry_attempts.unwrap_or(self.retry.max_attempts);
    let mut retries = 0u32;

    loop {
      let ctx = ExecContext::new(&self.execution_id, &self.workflow_id, &self.node.id)
        .with_deadline(Instant::now() + self.node_timeout)
        .with_cancel(self.cancel.child_token());

      let attempt = tokio::select! {
        biased;
        _ = self.cancel.cancelled() => {
          record.status = NodeExecutionStatus::Cancelled;
          record.completed_at = Some(chrono::Utc::now());
          self.persist_update(&record).await;
          self.emit_node(EventType::NodeCancelled, "cancelled", None).await;
          return TaskResult::cancelled(&self.node.id);
        }
        result = tokio::time::timeout(
          self.node_timeout,
          executor.execute(&ctx, &resolved, &self.input),
        ) => result,
      };

      let error = match attempt {
        Ok(Ok(output)) => {
          record.status = NodeExecutionStatus::Completed;
          record.output = Some(output.clone());
          record.retry_count = retries;
          record.completed_at = Some(chrono::Utc::now());
          if !self.persist_update(&record).await {
            return TaskResult::failed(
              &self.node.id,
              "failed to persist node execution".to_string(),
              true,
              false,
            );
          }
          let duration_ms = started.elapsed().as_millis() as u64;
          self
            .emitter
            .emit(EventType::NodeCompleted, |e| {
              e.with_node(&self.node.id, &self.node.name, &self.node.node_type)
                .with_status("completed")
                .with_duration(duration_ms)
                .with_output(output.clone())
            })
            .await;
          return TaskResult::completed(&self.node.id, output);
        }
        Ok(Err(e)) => e,
        Err(_) => ExecutorError::transient(format!(
          "node timed out after {}",
          humantime::format_duration(self.node_timeout)
        )),
      };

      if error.is_transient() && retries < max_retries {
        retries += 1;
        record.retry_count = retries;
        record.error = Some(error.to_string());
        self.persist_update(&record).await;
        self
          .emitter
          .emit(EventType::NodeRetrying, |e| {
            e.with_node(&self.node.id, &self.node.name, &self.node.node_type)
              .with_status("retrying")
              .with_error(&error.to_string())
              .with_payload(json!({"attempt": retries}))
          })
          .await;
        tokio::time::sleep(self.retry.backoff(retries)).await;
        continue;
      }

      record.retry_count = retries;
      return self
        .fail(
          record,
          error.code(),
          error.to_string(),
          self.node.on_failure == OnFailure::Fatal,
        )
        .await;
    }
  }

  async fn fail(
    &self,
    mut record: NodeExecution,
    code: &str,
    message: String,
    fatal: bool,
  ) -> TaskResult {
    record.status = NodeExecutionStatus::Failed;
    record.error = Some(message.clone());
    record.completed_at = Some(chrono::Utc::now());
    self.persist_update(&record).await;
    self
      .emitter
      .emit(EventType::NodeFailed, |e| {
        e.with_node(&self.node.id, &self.node.name, &self.node.node_type)
          .with_status("failed")
          .with_error(&message)
          .with_payload(json!({"code": code}))
      })
      .await;
    TaskResult::failed(&self.node.id, message, fatal, !fatal)
  }

  async fn emit_node(&self, event_type: EventType, status: &str, error: Option<&str>) {
    let status = status.to_string();
    let error = error.map(|e| e.to_string());
    self
      .emitter
      .emit(event_type, |mut e| {
        e = e
          .with_node(&self.node.id, &self.node.name, &self.node.node_type)
          .with_status(&status);
        if let Some(error) = &error {
          e = e.with_error(error);
        }
        e
      })
      .await;
  }

  async fn persist_append(&self, record: &NodeExecution) -> bool {
    let Some(repository) = &self.repository else {
      return true;
    };
    if repository.append_node_execution(record).await.is_ok() {
      return true;
    }
    if repository.append_node_execution(record).await.is_ok() {
      return true;
    }
    warn!(node_id = %record.node_id, "failed to persist node execution after retry");
    false
  }

  async fn persist_update(&self, record: &NodeExecution) -> bool {
    let Some(repository) = &self.repository else {
      return true;
    };
    if repository.update_node_execution(record).await.is_ok() {
      return true;
    }
    if repository.update_node_execution(record).await.is_ok() {
      return true;
    }
    warn!(node_id = %record.node_id, "failed to update node execution after retry");
    false
  }
}
