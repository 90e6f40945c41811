use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use mbflow_workflow::{Event, EventType};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::wire::WireMessage;

const DEFAULT_QUEUE_SIZE: usize = 64;

/// One connected client.
pub struct HubClient {
  pub id: String,
  /// When set, only events for this execution reach the client.
  pub execution_id: Option<String>,
  sender: mpsc::Sender<String>,
  /// Event types the client asked for; empty means all.
  subscriptions: RwLock<HashSet<EventType>>,
}

impl HubClient {
  fn wants(&self, event: &Event) -> bool {
    if let Some(execution_id) = &self.execution_id {
      if execution_id != &event.execution_id {
        return false;
      }
    }
    let subscriptions = self.subscriptions.read().unwrap();
    subscriptions.is_empty() || subscriptions.contains(&event.event_type)
  }
}

/// The client set and fan-out logic.
pub struct Hub {
  clients: DashMap<String, Arc<HubClient>>,
  queue_size: usize,
}

impl Default for Hub {
  fn default() -> Self {
    Self::new()
  }
}

impl Hub {
  pub fn new() -> Self {
    Self::with_queue_size(DEFAULT_QUEUE_SIZE)
  }

  pub fn with_queue_size(queue_size: usize) -> Self {
    Self {
      clients: DashMap::new(),
      queue_size: queue_size.max(1),
    }
  }

  /// Register a client, optionally scoped to one execution. Returns the
  /// client id and the receiving end of its send queue; the first queued
  /// frame is the `Connected` control message.
  pub fn register(&self, execution_id: Option<String>) -> (String, mpsc::Receiver<String>) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (sender, receiver) = mpsc::channel(self.queue_size);
    let client = Arc::new(HubClient {
      id: client_id.clone(),
      execution_id: execution_id.clone(),
      sender,
      subscriptions: RwLock::new(HashSet::new()),
    });

    let hello = WireMessage::connected(&client_id, execution_id.as_deref());
    if let Ok(text) = serde_json::to_string(&hello) {
      let _ = client.sender.try_send(text);
    }

    self.clients.insert(client_id.clone(), client);
    debug!(client_id = %client_id, "hub client connected");
    (client_id, receiver)
  }

  pub fn unregister(&self, client_id: &str) {
    if self.clients.remove(client_id).is_some() {
      debug!(client_id = %client_id, "hub client disconnected");
    }
  }

  pub fn client_count(&self) -> usize {
    self.clients.len()
  }

  pub fn subscribe(&self, client_id: &str, event_types: &[EventType]) {
    if let Some(client) = self.clients.get(client_id) {
      let mut subscriptions = client.subscriptions.write().unwrap();
      subscriptions.extend(event_types.iter().copied());
    }
  }

  pub fn unsubscribe(&self, client_id: &str, event_types: &[EventType]) {
    if let Some(client) = self.clients.get(client_id) {
      let mut subscriptions = client.subscriptions.write().unwrap();
      for event_type in event_types {
        subscriptions.remove(event_type);
      }
    }
  }

  /// Send a raw frame to every client.
  pub fn broadcast(&self, text: &str) {
    let mut slow = Vec::new();
    for entry in self.clients.iter() {
      if entry.sender.try_send(text.to_string()).is_err() {
        slow.push(entry.id.clone());
      }
    }
    self.close_slow(slow);
  }

  /// Send a raw frame to clients watching one execution (or unscoped ones).
  pub fn broadcast_to_execution(&self, execution_id: &str, text: &str) {
    let mut slow = Vec::new();
    for entry in self.clients.iter() {
      let interested = entry
        .execution_id
        .as_deref()
        .is_none_or(|scoped| scoped == execution_id);
      if interested && entry.sender.try_send(text.to_string()).is_err() {
        slow.push(entry.id.clone());
      }
    }
    self.close_slow(slow);
  }

  /// Serialize an event once and fan it out through every client's scope and
  /// subscription filter.
  pub fn broadcast_event(&self, event: &Event) {
    let Ok(text) = serde_json::to_string(&WireMessage::event(event)) else {
      return;
    };
    let mut slow = Vec::new();
    for entry in self.clients.iter() {
      if entry.wants(event) && entry.sender.try_send(text.clone()).is_err() {
        slow.push(entry.id.clone());
      }
    }
    self.close_slow(slow);
  }

  /// A full send queue means the socket stopped draining; close the client
  /// rather than stall everyone else.
  fn close_slow(&self, client_ids: Vec<String>) {
    for client_id in client_ids {
      warn!(client_id = %client_id, "closing slow consumer");
      self.clients.remove(&client_id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn event(execution_id: &str, event_type: EventType, sequence: u64) -> Event {
    Event::new(execution_id, "w1", event_type, sequence)
  }

  #[tokio::test]
  async fn register_sends_connected_control_frame() {
    let hub = Hub::new();
    let (client_id, mut rx) = hub.register(Some("exec-1".to_string()));

    let frame: serde_json::Value =
      serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(frame["type"], "control");
    assert_eq!(frame["message"], "Connected");
    assert_eq!(frame["client_id"], client_id.as_str());
    assert_eq!(frame["execution_id"], "exec-1");
  }

  #[tokio::test]
  async fn event_broadcast_honors_execution_scope() {
    let hub = Hub::new();
    let (_, mut scoped_rx) = hub.register(Some("exec-1".to_string()));
    let (_, mut open_rx) = hub.register(None);
    scoped_rx.recv().await.unwrap();
    open_rx.recv().await.unwrap();

    hub.broadcast_event(&event("exec-1", EventType::NodeStarted, 1));
    hub.broadcast_event(&event("exec-2", EventType::NodeStarted, 1));

    // The scoped client sees only its execution.
    let frame: serde_json::Value =
      serde_json::from_str(&scoped_rx.recv().await.unwrap()).unwrap();
    assert_eq!(frame["event"]["execution_id"], "exec-1");
    assert!(scoped_rx.try_recv().is_err());

    // The unscoped client sees both.
    open_rx.recv().await.unwrap();
    open_rx.recv().await.unwrap();
  }

  #[tokio::test]
  async fn subscriptions_filter_event_types() {
    let hub = Hub::new();
    let (client_id, mut rx) = hub.register(None);
    rx.recv().await.unwrap();

    hub.subscribe(&client_id, &[EventType::NodeCompleted]);
    hub.broadcast_event(&event("e", EventType::NodeStarted, 1));
    hub.broadcast_event(&event("e", EventType::NodeCompleted, 2));

    let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(frame["event"]["event_type"], "node.completed");
    assert!(rx.try_recv().is_err());

    // Unsubscribing the last type reverts to receive-all.
    hub.unsubscribe(&client_id, &[EventType::NodeCompleted]);
    hub.broadcast_event(&event("e", EventType::NodeStarted, 3));
    let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(frame["event"]["event_type"], "node.started");
  }

  #[tokio::test]
  async fn slow_consumer_is_closed_on_overflow() {
    let hub = Hub::with_queue_size(2);
    let (_, _stalled_rx) = hub.register(None);
    assert_eq!(hub.client_count(), 1);

    // The connect frame occupies one slot; two more broadcasts overflow.
    hub.broadcast("one");
    hub.broadcast("two");
    assert_eq!(hub.client_count(), 0);
  }
}
