use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// The single request context threaded through every executor call.
///
/// Carries the execution identity, the node deadline, the cancellation
/// token, and the opaque caller token. Executors are expected to honor
/// `cancel` cooperatively and may use `remaining()` to bound their own I/O.
#[derive(Debug, Clone)]
pub struct ExecContext {
  pub execution_id: String,
  pub workflow_id: String,
  pub node_id: String,
  pub deadline: Option<Instant>,
  pub cancel: CancellationToken,
  /// Opaque caller identity; never interpreted by the core.
  pub caller: Option<String>,
}

impl ExecContext {
  pub fn new(execution_id: &str, workflow_id: &str, node_id: &str) -> Self {
    Self {
      execution_id: execution_id.to_string(),
      workflow_id: workflow_id.to_string(),
      node_id: node_id.to_string(),
      deadline: None,
      cancel: CancellationToken::new(),
      caller: None,
    }
  }

  pub fn with_deadline(mut self, deadline: Instant) -> Self {
    self.deadline = Some(deadline);
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn with_caller(mut self, caller: Option<String>) -> Self {
    self.caller = caller;
    self
  }

  /// Time left until the node deadline, if one is set.
  pub fn remaining(&self) -> Option<Duration> {
    self
      .deadline
      .map(|d| d.saturating_duration_since(Instant::now()))
  }
}
