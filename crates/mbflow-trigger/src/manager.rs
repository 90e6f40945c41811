//! Trigger manager.
//!
//! Owns the scheduler, webhook dispatcher, and event listener. Hydrates them
//! from the repository on start, routes create/update/delete notifications,
//! and exposes the manual fire entry point.

use std::sync::Arc;

use mbflow_cache::Cache;
use mbflow_engine::{Engine, ExecutionOptions};
use mbflow_store::{Repository, StoreError};
use mbflow_workflow::{Trigger, TriggerType};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::TriggerError;
use crate::listener::EventListener;
use crate::scheduler::CronScheduler;
use crate::state::TriggerStateStore;
use crate::webhook::WebhookDispatcher;

/// Lifecycle owner for all trigger sub-managers.
pub struct TriggerManager {
  engine: Engine,
  repository: Arc<dyn Repository>,
  states: TriggerStateStore,
  scheduler: CronScheduler,
  webhooks: WebhookDispatcher,
  listener: EventListener,
}

impl TriggerManager {
  pub fn new(engine: Engine, repository: Arc<dyn Repository>, cache: Arc<dyn Cache>) -> Self {
    let states = TriggerStateStore::new(cache.clone());
    let scheduler = CronScheduler::new(engine.clone(), repository.clone(), states.clone());
    let webhooks = WebhookDispatcher::new(
      engine.clone(),
      cache.clone(),
      repository.clone(),
      states.clone(),
    );
    let listener = EventListener::new(engine.clone(), cache, repository.clone(), states.clone());
    Self {
      engine,
      repository,
      states,
      scheduler,
      webhooks,
      listener,
    }
  }

  pub fn scheduler(&self) -> &CronScheduler {
    &self.scheduler
  }

  pub fn webhooks(&self) -> &WebhookDispatcher {
    &self.webhooks
  }

  pub fn listener(&self) -> &EventListener {
    &self.listener
  }

  /// Load all enabled triggers, drop the ones whose workflow is gone, and
  /// start each sub-manager with its slice.
  pub async fn start(&self) -> Result<(), TriggerError> {
    let triggers = self.repository.list_enabled_triggers().await?;

    let mut scheduled = Vec::new();
    let mut webhooks = Vec::new();
    let mut events = Vec::new();
    for trigger in triggers {
      match self.repository.get_workflow(&trigger.workflow_id).await {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => {
          warn!(
            trigger_id = %trigger.id,
            workflow_id = %trigger.workflow_id,
            "disarming trigger: workflow no longer exists"
          );
          continue;
        }
        Err(e) => return Err(e.into()),
      }
      match trigger.trigger_type {
        TriggerType::Cron | TriggerType::Interval => scheduled.push(trigger),
        TriggerType::Webhook => webhooks.push(trigger),
        TriggerType::Event => events.push(trigger),
        TriggerType::Manual => {}
      }
    }

    info!(
      scheduled = scheduled.len(),
      webhooks = webhooks.len(),
      events = events.len(),
      "starting trigger manager"
    );
    self.scheduler.start(scheduled).await;
    self.webhooks.start(webhooks).await;
    self.listener.start(events).await;
    Ok(())
  }

  pub async fn stop(&self) {
    self.scheduler.stop().await;
    self.webhooks.stop().await;
    self.listener.stop().await;
  }

  pub async fn on_trigger_created(&self, trigger: &Trigger) -> Result<(), TriggerError> {
    if !trigger.enabled {
      return Ok(());
    }
    match trigger.trigger_type {
      TriggerType::Cron | TriggerType::Interval => self.scheduler.add_trigger(trigger).await,
      TriggerType::Webhook => {
        self.webhooks.register(trigger).await;
        Ok(())
      }
      TriggerType::Event => self.listener.add_trigger(trigger).await,
      TriggerType::Manual => Ok(()),
    }
  }

  /// Remove-then-add so config changes always take effect.
  pub async fn on_trigger_updated(&self, trigger: &Trigger) -> Result<(), TriggerError> {
    self
      .on_trigger_deleted(&trigger.id, trigger.trigger_type)
      .await?;
    self.on_trigger_created(trigger).await
  }

  pub async fn on_trigger_deleted(
    &self,
    trigger_id: &str,
    trigger_type: TriggerType,
  ) -> Result<(), TriggerError> {
    match trigger_type {
      TriggerType::Cron | TriggerType::Interval => {
        self.scheduler.remove_trigger(trigger_id).await
      }
      TriggerType::Webhook => {
        self.webhooks.unregister(trigger_id).await;
        Ok(())
      }
      TriggerType::Event => self.listener.remove_trigger(trigger_id).await,
      TriggerType::Manual => Ok(()),
    }
  }

  /// Manual fire entry point used by the HTTP/gRPC surface.
  pub async fn fire(
    &self,
    trigger_id: &str,
    input: Map<String, Value>,
  ) -> Result<String, TriggerError> {
    let trigger = self
      .repository
      .list_enabled_triggers()
      .await?
      .into_iter()
      .find(|t| t.id == trigger_id)
      .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()))?;

    if self.repository.get_workflow(&trigger.workflow_id).await.is_err() {
      return Err(TriggerError::WorkflowMissing {
        trigger_id: trigger.id.clone(),
        workflow_id: trigger.workflow_id.clone(),
      });
    }

    let mut merged = trigger.default_input();
    for (key, value) in input {
      merged.insert(key, value);
    }

    let options = ExecutionOptions::default().with_caller(&format!("trigger:{}", trigger.id));
    let execution_id = self
      .engine
      .execute(&trigger.workflow_id, merged, options)
      .await?;

    self.states.record_fire(&trigger.id, None).await?;
    self.repository.mark_trigger_fired(&trigger.id).await?;
    Ok(execution_id)
  }
}
