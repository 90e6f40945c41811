//! Event listener.
//!
//! Subscribes to `mbflow:events:{event_type}` pub/sub channels and routes
//! matching events to the engine. One subscription per event type, created
//! lazily and torn down when the last trigger for that type is removed.
//! Dispatch happens on background workers bounded by a per-dispatch deadline
//! so a slow workflow cannot starve the listener loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mbflow_cache::Cache;
use mbflow_engine::{Engine, ExecutionOptions};
use mbflow_store::Repository;
use mbflow_workflow::{Trigger, TriggerType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TriggerError;
use crate::state::TriggerStateStore;

const DISPATCH_DEADLINE: Duration = Duration::from_secs(300);

/// The pub/sub channel for one event type.
pub fn event_channel(event_type: &str) -> String {
  format!("mbflow:events:{}", event_type)
}

/// The wire format on the event channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
  #[serde(rename = "type")]
  pub event_type: String,
  pub source: String,
  #[serde(default)]
  pub data: Map<String, Value>,
  #[serde(default)]
  pub timestamp: Option<DateTime<Utc>>,
}

/// Outbound helper: stamp a timestamp and publish to the type's channel.
pub async fn publish_event(
  cache: &dyn Cache,
  mut message: EventMessage,
) -> Result<(), TriggerError> {
  message.timestamp = Some(Utc::now());
  let channel = event_channel(&message.event_type);
  let bytes = serde_json::to_vec(&message).unwrap_or_default();
  cache.publish(&channel, &bytes).await?;
  Ok(())
}

struct Subscription {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

/// Routes pub/sub events to matching event triggers.
pub struct EventListener {
  engine: Engine,
  cache: Arc<dyn Cache>,
  repository: Arc<dyn Repository>,
  states: TriggerStateStore,
  triggers: Arc<Mutex<HashMap<String, Vec<Trigger>>>>,
  subscriptions: Mutex<HashMap<String, Subscription>>,
  cancel: CancellationToken,
}

impl EventListener {
  pub fn new(
    engine: Engine,
    cache: Arc<dyn Cache>,
    repository: Arc<dyn Repository>,
    states: TriggerStateStore,
  ) -> Self {
    Self {
      engine,
      cache,
      repository,
      states,
      triggers: Arc::new(Mutex::new(HashMap::new())),
      subscriptions: Mutex::new(HashMap::new()),
      cancel: CancellationToken::new(),
    }
  }

  /// Subscribe the initial trigger set, one channel per event type.
  pub async fn start(&self, triggers: Vec<Trigger>) {
    for trigger in triggers {
      if let Err(e) = self.add_trigger(&trigger).await {
        warn!(trigger_id = %trigger.id, error = %e, "event trigger not armed");
      }
    }
  }

  pub async fn stop(&self) {
    self.cancel.cancel();
    let mut subscriptions = self.subscriptions.lock().await;
    for (_, subscription) in subscriptions.drain() {
      subscription.cancel.cancel();
      let _ = tokio::time::timeout(Duration::from_secs(5), subscription.handle).await;
    }
    self.triggers.lock().await.clear();
  }

  pub async fn add_trigger(&self, trigger: &Trigger) -> Result<(), TriggerError> {
    if trigger.trigger_type != TriggerType::Event || !trigger.enabled {
      return Ok(());
    }
    let event_type = trigger
      .config_str("event_type")
      .ok_or_else(|| TriggerError::InvalidEventConfig {
        message: format!("trigger '{}' has no event_type", trigger.id),
      })?
      .to_string();

    {
      let mut triggers = self.triggers.lock().await;
      let group = triggers.entry(event_type.clone()).or_default();
      group.retain(|t| t.id != trigger.id);
      group.push(trigger.clone());
    }
    self.ensure_subscription(&event_type).await?;
    info!(trigger_id = %trigger.id, event_type = %event_type, "event trigger armed");
    Ok(())
  }

  pub async fn remove_trigger(&self, trigger_id: &str) -> Result<(), TriggerError> {
    let mut emptied = Vec::new();
    {
      let mut triggers = self.triggers.lock().await;
      for (event_type, group) in triggers.iter_mut() {
        group.retain(|t| t.id != trigger_id);
        if group.is_empty() {
          emptied.push(event_type.clone());
        }
      }
      for event_type in &emptied {
        triggers.remove(event_type);
      }
    }

    // Unsubscribe channels that lost their last trigger.
    let mut subscriptions = self.subscriptions.lock().await;
    for event_type in emptied {
      if let Some(subscription) = subscriptions.remove(&event_type) {
        subscription.cancel.cancel();
        debug!(event_type = %event_type, "unsubscribed event channel");
      }
    }
    self.states.delete(trigger_id).await?;
    Ok(())
  }

  pub async fn is_subscribed(&self, event_type: &str) -> bool {
    self.subscriptions.lock().await.contains_key(event_type)
  }

  async fn ensure_subscription(&self, event_type: &str) -> Result<(), TriggerError> {
    let mut subscriptions = self.subscriptions.lock().await;
    if subscriptions.contains_key(event_type) {
      return Ok(());
    }

    let receiver = self.cache.subscribe(&[event_channel(event_type)]).await?;
    let cancel = self.cancel.child_token();
    let handle = tokio::spawn(run_subscription(
      event_type.to_string(),
      receiver,
      self.engine.clone(),
      self.repository.clone(),
      self.states.clone(),
      self.triggers.clone(),
      cancel.clone(),
    ));
    subscriptions.insert(event_type.to_string(), Subscription { cancel, handle });
    Ok(())
  }
}

async fn run_subscription(
  event_type: String,
  mut receiver: tokio::sync::mpsc::Receiver<mbflow_cache::PubSubMessage>,
  engine: Engine,
  repository: Arc<dyn Repository>,
  states: TriggerStateStore,
  triggers: Arc<Mutex<HashMap<String, Vec<Trigger>>>>,
  cancel: CancellationToken,
) {
  loop {
    let message = tokio::select! {
      _ = cancel.cancelled() => return,
      message = receiver.recv() => match message {
        Some(message) => message,
        None => return,
      },
    };

    let event: EventMessage = match serde_json::from_slice(&message.payload) {
      Ok(event) => event,
      Err(e) => {
        debug!(channel = %message.channel, error = %e, "ignoring malformed event");
        continue;
      }
    };

    let matched: Vec<Trigger> = {
      let triggers = triggers.lock().await;
      triggers
        .get(&event_type)
        .map(|group| {
          group
            .iter()
            .filter(|t| matches_trigger(t, &event))
            .cloned()
            .collect()
        })
        .unwrap_or_default()
    };

    // One worker per matched trigger, each bounded so a slow workflow does
    // not starve the listener loop.
    for trigger in matched {
      let engine = engine.clone();
      let repository = repository.clone();
      let states = states.clone();
      let event = event.clone();
      tokio::spawn(async move {
        let result = tokio::time::timeout(
          DISPATCH_DEADLINE,
          dispatch(&trigger, &event, &engine, &repository, &states),
        )
        .await;
        match result {
          Ok(Err(e)) => warn!(trigger_id = %trigger.id, error = %e, "event dispatch failed"),
          Err(_) => warn!(trigger_id = %trigger.id, "event dispatch deadline exceeded"),
          Ok(Ok(())) => {}
        }
      });
    }
  }
}

/// Type equality plus filter matching: `filter.source` checks the event's
/// source, any other key checks `event.data[key]`. A missing data key fails
/// the match.
fn matches_trigger(trigger: &Trigger, event: &EventMessage) -> bool {
  if trigger.config_str("event_type") != Some(event.event_type.as_str()) {
    return false;
  }
  let Some(Value::Object(filter)) = trigger.config.get("filter") else {
    return true;
  };
  for (key, expected) in filter {
    let actual = if key == "source" {
      Some(Value::String(event.source.clone()))
    } else {
      event.data.get(key).cloned()
    };
    if actual.as_ref() != Some(expected) {
      return false;
    }
  }
  true
}

async fn dispatch(
  trigger: &Trigger,
  event: &EventMessage,
  engine: &Engine,
  repository: &Arc<dyn Repository>,
  states: &TriggerStateStore,
) -> Result<(), TriggerError> {
  // Event data wins over the trigger's default input.
  let mut input = trigger.default_input();
  for (key, value) in &event.data {
    input.insert(key.clone(), value.clone());
  }

  let options = ExecutionOptions::default().with_caller(&format!("trigger:{}", trigger.id));
  let execution_id = engine.execute(&trigger.workflow_id, input, options).await?;
  debug!(trigger_id = %trigger.id, execution_id = %execution_id, "event trigger fired");

  states.record_fire(&trigger.id, None).await?;
  repository.mark_trigger_fired(&trigger.id).await?;

  // Hold the dispatch worker until the run settles; the deadline above
  // bounds this wait.
  loop {
    match repository.get_execution(&execution_id).await {
      Ok(execution) if execution.status.is_terminal() => return Ok(()),
      Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
      Err(_) => return Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mbflow_cache::MemoryCache;
  use mbflow_engine::EngineConfig;
  use mbflow_executor::ExecutorRegistry;
  use mbflow_store::MemoryRepository;
  use mbflow_workflow::{Node, Workflow, WorkflowStatus};
  use serde_json::json;

  fn simple_workflow(id: &str) -> Workflow {
    Workflow {
      id: id.to_string(),
      name: id.to_string(),
      version: 1,
      status: WorkflowStatus::Active,
      nodes: vec![Node {
        id: "a".to_string(),
        name: "a".to_string(),
        node_type: "transform".to_string(),
        config: json!({"output": {"ok": true}}).as_object().unwrap().clone(),
        position: None,
        timeout_ms: None,
        max_retry_attempts: None,
        on_failure: Default::default(),
      }],
      edges: vec![],
      variables: Map::new(),
      metadata: None,
    }
  }

  fn event_trigger(id: &str, config: Value) -> Trigger {
    Trigger {
      id: id.to_string(),
      workflow_id: "wf".to_string(),
      trigger_type: TriggerType::Event,
      enabled: true,
      config: config.as_object().cloned().unwrap_or_default(),
    }
  }

  fn message(event_type: &str, source: &str, data: Value) -> EventMessage {
    EventMessage {
      event_type: event_type.to_string(),
      source: source.to_string(),
      data: data.as_object().cloned().unwrap_or_default(),
      timestamp: None,
    }
  }

  #[test]
  fn matching_requires_type_and_filter() {
    let trigger = event_trigger(
      "t1",
      json!({"event_type": "order.created", "filter": {"source": "shop", "region": "eu"}}),
    );

    assert!(matches_trigger(
      &trigger,
      &message("order.created", "shop", json!({"region": "eu"}))
    ));
    // Wrong type.
    assert!(!matches_trigger(
      &trigger,
      &message("order.deleted", "shop", json!({"region": "eu"}))
    ));
    // Wrong source.
    assert!(!matches_trigger(
      &trigger,
      &message("order.created", "warehouse", json!({"region": "eu"}))
    ));
    // Wrong data value.
    assert!(!matches_trigger(
      &trigger,
      &message("order.created", "shop", json!({"region": "us"}))
    ));
    // Missing data key fails the match.
    assert!(!matches_trigger(
      &trigger,
      &message("order.created", "shop", json!({}))
    ));
  }

  #[test]
  fn no_filter_matches_on_type_alone() {
    let trigger = event_trigger("t1", json!({"event_type": "ping"}));
    assert!(matches_trigger(&trigger, &message("ping", "anywhere", json!({}))));
  }

  struct Fixture {
    listener: EventListener,
    cache: Arc<MemoryCache>,
    repository: Arc<MemoryRepository>,
  }

  async fn fixture() -> Fixture {
    let repository = Arc::new(MemoryRepository::new());
    repository.create_workflow(&simple_workflow("wf")).await.unwrap();
    let cache = Arc::new(MemoryCache::new());
    let engine = Engine::new(
      repository.clone(),
      ExecutorRegistry::with_builtins(),
      EngineConfig::default(),
    );
    let states = TriggerStateStore::new(cache.clone());
    Fixture {
      listener: EventListener::new(engine, cache.clone(), repository.clone(), states),
      cache,
      repository,
    }
  }

  #[tokio::test]
  async fn matched_event_starts_an_execution() {
    let f = fixture().await;
    f.listener
      .add_trigger(&event_trigger("t1", json!({"event_type": "order.created"})))
      .await
      .unwrap();

    publish_event(
      f.cache.as_ref(),
      message("order.created", "shop", json!({"id": 9})),
    )
    .await
    .unwrap();

    for _ in 0..100 {
      if f.repository.fired_count("t1") == 1 {
        return;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("event trigger never fired");
  }

  #[tokio::test]
  async fn unmatched_event_does_not_fire() {
    let f = fixture().await;
    f.listener
      .add_trigger(&event_trigger(
        "t1",
        json!({"event_type": "order.created", "filter": {"source": "shop"}}),
      ))
      .await
      .unwrap();

    publish_event(
      f.cache.as_ref(),
      message("order.created", "warehouse", json!({})),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(f.repository.fired_count("t1"), 0);
  }

  #[tokio::test]
  async fn last_trigger_removal_unsubscribes_the_channel() {
    let f = fixture().await;
    f.listener
      .add_trigger(&event_trigger("t1", json!({"event_type": "ping"})))
      .await
      .unwrap();
    f.listener
      .add_trigger(&event_trigger("t2", json!({"event_type": "ping"})))
      .await
      .unwrap();
    assert!(f.listener.is_subscribed("ping").await);

    f.listener.remove_trigger("t1").await.unwrap();
    assert!(f.listener.is_subscribed("ping").await);

    f.listener.remove_trigger("t2").await.unwrap();
    assert!(!f.listener.is_subscribed("ping").await);
  }

  #[tokio::test]
  async fn missing_event_type_is_rejected() {
    let f = fixture().await;
    let err = f
      .listener
      .add_trigger(&event_trigger("t1", json!({})))
      .await
      .unwrap_err();
    assert_eq!(err.code(), "validation");
  }
}
