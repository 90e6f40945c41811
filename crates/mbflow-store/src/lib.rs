//! MBFlow storage.
//!
//! The [`Repository`] trait is the narrow persistence surface the engine and
//! trigger manager consume: workflow lookup, execution and node-execution
//! records, the event log, and trigger listing. Every call is atomic on its
//! own; no transactional bracket spans calls. [`MemoryRepository`] backs
//! tests and embedded use, [`SqliteRepository`] persists to a database.

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use mbflow_workflow::{
  Event, Execution, ExecutionStatus, NodeExecution, Trigger, Workflow,
};
use serde_json::{Map, Value};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// A stored value failed to (de)serialize.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl StoreError {
  /// Machine-readable error code.
  pub fn code(&self) -> &'static str {
    "persistence"
  }
}

/// The persistence surface consumed by the engine and trigger manager.
#[async_trait]
pub trait Repository: Send + Sync {
  async fn get_workflow(&self, id: &str) -> Result<Workflow, StoreError>;

  async fn create_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

  async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError>;

  async fn get_execution(&self, id: &str) -> Result<Execution, StoreError>;

  /// Compare-and-set status transition. Returns false (and writes nothing)
  /// when the stored status does not match `expected`.
  async fn update_execution_status(
    &self,
    id: &str,
    expected: ExecutionStatus,
    status: ExecutionStatus,
    error: Option<&str>,
  ) -> Result<bool, StoreError>;

  /// Persist the final output map of an execution.
  async fn update_execution_output(
    &self,
    id: &str,
    output: &Map<String, Value>,
  ) -> Result<(), StoreError>;

  async fn append_node_execution(&self, record: &NodeExecution) -> Result<(), StoreError>;

  async fn update_node_execution(&self, record: &NodeExecution) -> Result<(), StoreError>;

  async fn list_node_executions(
    &self,
    execution_id: &str,
  ) -> Result<Vec<NodeExecution>, StoreError>;

  async fn append_event(&self, event: &Event) -> Result<(), StoreError>;

  async fn list_events(&self, execution_id: &str) -> Result<Vec<Event>, StoreError>;

  async fn create_trigger(&self, trigger: &Trigger) -> Result<(), StoreError>;

  async fn list_enabled_triggers(&self) -> Result<Vec<Trigger>, StoreError>;

  /// Record that a trigger fired (bookkeeping only; the cache-backed trigger
  /// state is authoritative for display).
  async fn mark_trigger_fired(&self, id: &str) -> Result<(), StoreError>;
}
