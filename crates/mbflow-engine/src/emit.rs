use std::sync::Arc;

use mbflow_observer::ObserverBus;
use mbflow_store::Repository;
use mbflow_workflow::{Event, EventType};
use tokio::sync::Mutex;
use tracing::warn;

/// Per-execution event emitter.
///
/// Serializes emission so that sequence numbers are contiguous and every
/// observer sees events in sequence order even when node tasks finish
/// concurrently. Persistence failures are retried once and then logged; the
/// stream itself is never interrupted by a bad event write.
pub struct Emitter {
  execution_id: String,
  workflow_id: String,
  bus: ObserverBus,
  repository: Option<Arc<dyn Repository>>,
  sequence: Mutex<u64>,
}

impl Emitter {
  pub fn new(
    execution_id: &str,
    workflow_id: &str,
    bus: ObserverBus,
    repository: Option<Arc<dyn Repository>>,
  ) -> Self {
    Self {
      execution_id: execution_id.to_string(),
      workflow_id: workflow_id.to_string(),
      bus,
      repository,
      sequence: Mutex::new(0),
    }
  }

  /// Emit one event. The builder receives the assigned sequence number.
  pub async fn emit<F>(&self, event_type: EventType, build: F)
  where
    F: FnOnce(Event) -> Event,
  {
    let mut sequence = self.sequence.lock().await;
    *sequence += 1;
    let event = build(Event::new(
      &self.execution_id,
      &self.workflow_id,
      event_type,
      *sequence,
    ));

    if let Some(repository) = &self.repository {
      if repository.append_event(&event).await.is_err()
        && repository.append_event(&event).await.is_err()
      {
        warn!(
          execution_id = %self.execution_id,
          sequence = event.sequence,
          "failed to persist event after retry"
        );
      }
    }

    // Emitting under the sequence lock keeps per-observer queue order equal
    // to sequence order.
    self.bus.emit(&event);
  }
}
