use std::sync::Arc;

use async_trait::async_trait;
use mbflow_observer::{Observer, ObserverError};
use mbflow_workflow::Event;

use crate::hub::Hub;

/// Bridges the engine's observer bus into the hub.
pub struct HubObserver {
  hub: Arc<Hub>,
}

impl HubObserver {
  pub fn new(hub: Arc<Hub>) -> Self {
    Self { hub }
  }
}

#[async_trait]
impl Observer for HubObserver {
  fn name(&self) -> &str {
    "websocket-hub"
  }

  async fn on_event(&self, event: &Event) -> Result<(), ObserverError> {
    self.hub.broadcast_event(event);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mbflow_workflow::EventType;

  #[tokio::test]
  async fn observer_forwards_into_hub() {
    let hub = Arc::new(Hub::new());
    let (_, mut rx) = hub.register(None);
    rx.recv().await.unwrap();

    let observer = HubObserver::new(hub.clone());
    let event = Event::new("e1", "w1", EventType::ExecutionStarted, 1);
    observer.on_event(&event).await.unwrap();

    let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(frame["event"]["event_type"], "execution.started");
  }
}
