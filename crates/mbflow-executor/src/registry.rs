use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::context::ExecContext;
use crate::error::ExecutorError;

/// A node executor: validates configs ahead of time and executes resolved
/// configs against an input value.
#[async_trait]
pub trait Executor: Send + Sync {
  /// Check a raw (unresolved) config for structural problems. Returns one
  /// message per problem; empty means valid.
  fn validate(&self, config: &Map<String, Value>) -> Vec<String>;

  /// Run the node. `resolved_config` has already been through template
  /// resolution.
  async fn execute(
    &self,
    ctx: &ExecContext,
    resolved_config: &Map<String, Value>,
    input: &Value,
  ) -> Result<Value, ExecutorError>;
}

/// Thread-safe mapping from node type tag to executor.
///
/// Registration is additive; re-registering a tag replaces the previous
/// executor, and registering the identical executor instance is a no-op.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
  executors: Arc<DashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A registry preloaded with the built-in executors.
  pub fn with_builtins() -> Self {
    let registry = Self::new();
    registry.register("transform", Arc::new(crate::transform::TransformExecutor));
    registry.register("http", Arc::new(crate::http::HttpExecutor::new()));
    registry
  }

  pub fn register(&self, node_type: &str, executor: Arc<dyn Executor>) {
    if let Some(existing) = self.executors.get(node_type) {
      if Arc::ptr_eq(existing.value(), &executor) {
        return;
      }
    }
    self.executors.insert(node_type.to_string(), executor);
  }

  pub fn unregister(&self, node_type: &str) {
    self.executors.remove(node_type);
  }

  pub fn get(&self, node_type: &str) -> Option<Arc<dyn Executor>> {
    self.executors.get(node_type).map(|e| e.value().clone())
  }

  pub fn contains(&self, node_type: &str) -> bool {
    self.executors.contains_key(node_type)
  }
}
