use async_trait::async_trait;
use mbflow_workflow::Event;
use tokio::sync::mpsc;
use tracing::info;

/// Error type observers may return from [`Observer::on_event`].
#[derive(Debug, thiserror::Error)]
#[error("observer error: {message}")]
pub struct ObserverError {
  pub message: String,
}

impl ObserverError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// A consumer of the engine's event stream.
#[async_trait]
pub trait Observer: Send + Sync {
  /// Stable name; used for unregistration and logging.
  fn name(&self) -> &str;

  /// Per-observer event filter. The default accepts everything.
  fn filter(&self, _event: &Event) -> bool {
    true
  }

  /// Handle one event. Errors are logged and do not unregister the observer.
  async fn on_event(&self, event: &Event) -> Result<(), ObserverError>;
}

/// An observer that forwards events to an unbounded channel.
///
/// Useful for tests and for bridging the bus into other async consumers.
pub struct ChannelObserver {
  name: String,
  sender: mpsc::UnboundedSender<Event>,
}

impl ChannelObserver {
  pub fn new(name: &str, sender: mpsc::UnboundedSender<Event>) -> Self {
    Self {
      name: name.to_string(),
      sender,
    }
  }
}

#[async_trait]
impl Observer for ChannelObserver {
  fn name(&self) -> &str {
    &self.name
  }

  async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
    // Receiver may have been dropped; that is not our problem to report.
    let _ = self.sender.send(event.clone());
    Ok(())
  }
}

/// An observer that logs events through `tracing`.
pub struct LogObserver;

#[async_trait]
impl Observer for LogObserver {
  fn name(&self) -> &str {
    "log"
  }

  async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
    info!(
      execution_id = %event.execution_id,
      sequence = event.sequence,
      event_type = ?event.event_type,
      node_id = event.node_id.as_deref().unwrap_or(""),
      "execution_event"
    );
    Ok(())
  }
}
