//! Cron/interval scheduler.
//!
//! Each armed trigger runs its own timer task. A tick that arrives while the
//! previous fire is still executing is dropped and counted; at most one
//! engine call per trigger is ever in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use mbflow_engine::{Engine, ExecutionOptions};
use mbflow_store::Repository;
use mbflow_workflow::{Trigger, TriggerType};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::TriggerError;
use crate::schedule::Schedule;
use crate::state::TriggerStateStore;

const STOP_DEADLINE: Duration = Duration::from_secs(10);
const FIRE_DEADLINE: Duration = Duration::from_secs(600);

struct ArmedTrigger {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
  skipped: Arc<AtomicU64>,
}

/// Scheduler for cron and interval triggers.
pub struct CronScheduler {
  engine: Engine,
  repository: Arc<dyn Repository>,
  states: TriggerStateStore,
  armed: Mutex<HashMap<String, ArmedTrigger>>,
  cancel: CancellationToken,
}

impl CronScheduler {
  pub fn new(engine: Engine, repository: Arc<dyn Repository>, states: TriggerStateStore) -> Self {
    Self {
      engine,
      repository,
      states,
      armed: Mutex::new(HashMap::new()),
      cancel: CancellationToken::new(),
    }
  }

  /// Arm an initial trigger set. Invalid schedules are logged and skipped;
  /// non-schedule trigger types are ignored without error.
  pub async fn start(&self, triggers: Vec<Trigger>) {
    for trigger in triggers {
      if let Err(e) = self.add_trigger(&trigger).await {
        warn!(trigger_id = %trigger.id, error = %e, "trigger not armed");
      }
    }
  }

  /// Disarm everything and wait (bounded) for running fires to settle.
  pub async fn stop(&self) {
    self.cancel.cancel();
    let mut armed = self.armed.lock().await;
    for (_, entry) in armed.drain() {
      entry.cancel.cancel();
      let _ = tokio::time::timeout(STOP_DEADLINE, entry.handle).await;
    }
  }

  /// Arm one trigger. Re-adding an id replaces the prior entry. Types other
  /// than cron/interval are ignored.
  pub async fn add_trigger(&self, trigger: &Trigger) -> Result<(), TriggerError> {
    if !matches!(
      trigger.trigger_type,
      TriggerType::Cron | TriggerType::Interval
    ) {
      return Ok(());
    }
    if !trigger.enabled {
      return Ok(());
    }

    let schedule = Schedule::from_trigger(trigger)?;
    let cancel = self.cancel.child_token();
    let skipped = Arc::new(AtomicU64::new(0));

    let handle = tokio::spawn(run_trigger_loop(
      trigger.clone(),
      schedule,
      self.engine.clone(),
      self.repository.clone(),
      self.states.clone(),
      cancel.clone(),
      skipped.clone(),
    ));

    let mut armed = self.armed.lock().await;
    if let Some(previous) = armed.insert(
      trigger.id.clone(),
      ArmedTrigger {
        cancel,
        handle,
        skipped,
      },
    ) {
      previous.cancel.cancel();
    }
    info!(trigger_id = %trigger.id, "trigger armed");
    Ok(())
  }

  /// Disarm one trigger and drop its cached state.
  pub async fn remove_trigger(&self, trigger_id: &str) -> Result<(), TriggerError> {
    let entry = self.armed.lock().await.remove(trigger_id);
    if let Some(entry) = entry {
      entry.cancel.cancel();
      let _ = tokio::time::timeout(STOP_DEADLINE, entry.handle).await;
      self.states.delete(trigger_id).await?;
      info!(trigger_id = %trigger_id, "trigger disarmed");
    }
    Ok(())
  }

  pub async fn is_armed(&self, trigger_id: &str) -> bool {
    self.armed.lock().await.contains_key(trigger_id)
  }

  /// Ticks dropped because the previous fire was still running.
  pub async fn skipped_fires(&self, trigger_id: &str) -> u64 {
    self
      .armed
      .lock()
      .await
      .get(trigger_id)
      .map(|e| e.skipped.load(Ordering::Relaxed))
      .unwrap_or(0)
  }
}

async fn run_trigger_loop(
  trigger: Trigger,
  schedule: Schedule,
  engine: Engine,
  repository: Arc<dyn Repository>,
  states: TriggerStateStore,
  cancel: CancellationToken,
  skipped: Arc<AtomicU64>,
) {
  let in_flight = Arc::new(AtomicBool::new(false));

  loop {
    let Some(next) = schedule.next_fire(Utc::now()) else {
      warn!(trigger_id = %trigger.id, "schedule has no future fire times");
      return;
    };
    let wait = (next - Utc::now())
      .to_std()
      .unwrap_or(Duration::from_millis(1));

    tokio::select! {
      _ = cancel.cancelled() => return,
      _ = tokio::time::sleep(wait) => {}
    }

    if in_flight.swap(true, Ordering::SeqCst) {
      // Previous fire still pending: collapse this tick.
      skipped.fetch_add(1, Ordering::Relaxed);
      continue;
    }

    let trigger = trigger.clone();
    let engine = engine.clone();
    let repository = repository.clone();
    let states = states.clone();
    let in_flight = in_flight.clone();
    let next_after_fire = schedule.next_fire(Utc::now());
    tokio::spawn(async move {
      fire(&trigger, &engine, &repository, &states, next_after_fire).await;
      in_flight.store(false, Ordering::SeqCst);
    });
  }
}

/// One fire: start the execution, record state, and hold the in-flight slot
/// until the execution reaches a terminal status.
async fn fire(
  trigger: &Trigger,
  engine: &Engine,
  repository: &Arc<dyn Repository>,
  states: &TriggerStateStore,
  next_execution: Option<chrono::DateTime<Utc>>,
) {
  let input = trigger.default_input();
  let options = ExecutionOptions::default().with_caller(&format!("trigger:{}", trigger.id));

  let execution_id = match engine.execute(&trigger.workflow_id, input, options).await {
    Ok(execution_id) => execution_id,
    Err(e) => {
      warn!(trigger_id = %trigger.id, error = %e, "scheduled fire failed to start");
      return;
    }
  };

  if let Err(e) = states.record_fire(&trigger.id, next_execution).await {
    warn!(trigger_id = %trigger.id, error = %e, "failed to record trigger state");
  }
  if let Err(e) = repository.mark_trigger_fired(&trigger.id).await {
    warn!(trigger_id = %trigger.id, error = %e, "failed to mark trigger fired");
  }

  // Overlap collapse is defined against the execution, not the submit call:
  // hold the slot until the run settles.
  let deadline = tokio::time::Instant::now() + FIRE_DEADLINE;
  loop {
    if tokio::time::Instant::now() >= deadline {
      warn!(trigger_id = %trigger.id, execution_id = %execution_id, "fire wait deadline reached");
      return;
    }
    match repository.get_execution(&execution_id).await {
      Ok(execution) if execution.status.is_terminal() => return,
      Ok(_) => {}
      Err(_) => return,
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
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
  use serde_json::{Map, json};

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

  fn interval_trigger(id: &str, workflow_id: &str, duration: &str) -> Trigger {
    Trigger {
      id: id.to_string(),
      workflow_id: workflow_id.to_string(),
      trigger_type: TriggerType::Interval,
      enabled: true,
      config: json!({"duration": duration}).as_object().unwrap().clone(),
    }
  }

  async fn scheduler_fixture() -> (CronScheduler, Arc<MemoryRepository>) {
    let repository = Arc::new(MemoryRepository::new());
    let engine = Engine::new(
      repository.clone(),
      ExecutorRegistry::with_builtins(),
      EngineConfig::default(),
    );
    let states = TriggerStateStore::new(Arc::new(MemoryCache::new()));
    (
      CronScheduler::new(engine, repository.clone(), states),
      repository,
    )
  }

  #[tokio::test]
  async fn interval_trigger_fires_and_records_state() {
    let (scheduler, repository) = scheduler_fixture().await;
    repository.create_workflow(&simple_workflow("wf")).await.unwrap();

    scheduler
      .add_trigger(&interval_trigger("t1", "wf", "100ms"))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    scheduler.stop().await;

    let fired = repository.fired_count("t1");
    assert!(fired >= 2, "expected at least two fires, got {}", fired);
  }

  #[tokio::test]
  async fn non_schedule_triggers_are_ignored() {
    let (scheduler, _repository) = scheduler_fixture().await;
    let trigger = Trigger {
      id: "hook".to_string(),
      workflow_id: "wf".to_string(),
      trigger_type: TriggerType::Webhook,
      enabled: true,
      config: Map::new(),
    };
    scheduler.add_trigger(&trigger).await.unwrap();
    assert!(!scheduler.is_armed("hook").await);
  }

  #[tokio::test]
  async fn disabled_triggers_are_not_armed() {
    let (scheduler, _repository) = scheduler_fixture().await;
    let mut trigger = interval_trigger("t1", "wf", "1s");
    trigger.enabled = false;
    scheduler.add_trigger(&trigger).await.unwrap();
    assert!(!scheduler.is_armed("t1").await);
  }

  #[tokio::test]
  async fn invalid_interval_surfaces_at_arm_time() {
    let (scheduler, _repository) = scheduler_fixture().await;
    let trigger = interval_trigger("t1", "wf", "not-a-duration");
    let err = scheduler.add_trigger(&trigger).await.unwrap_err();
    assert_eq!(err.code(), "invalid_interval");
  }

  #[tokio::test]
  async fn remove_trigger_disarms_and_clears_state() {
    let (scheduler, repository) = scheduler_fixture().await;
    repository.create_workflow(&simple_workflow("wf")).await.unwrap();

    scheduler
      .add_trigger(&interval_trigger("t1", "wf", "50ms"))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    scheduler.remove_trigger("t1").await.unwrap();
    assert!(!scheduler.is_armed("t1").await);

    let fired_at_removal = repository.fired_count("t1");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(repository.fired_count("t1"), fired_at_removal);
  }

  #[tokio::test]
  async fn re_adding_replaces_the_prior_entry() {
    let (scheduler, repository) = scheduler_fixture().await;
    repository.create_workflow(&simple_workflow("wf")).await.unwrap();

    scheduler
      .add_trigger(&interval_trigger("t1", "wf", "10m"))
      .await
      .unwrap();
    scheduler
      .add_trigger(&interval_trigger("t1", "wf", "100ms"))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    scheduler.stop().await;

    assert!(repository.fired_count("t1") >= 1);
  }
}
