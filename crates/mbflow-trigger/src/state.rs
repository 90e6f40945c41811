use std::sync::Arc;

use chrono::{DateTime, Utc};
use mbflow_cache::Cache;
use serde::{Deserialize, Serialize};

use crate::error::TriggerError;

/// Live trigger bookkeeping, kept in the shared cache under
/// `trigger:{trigger_id}:state`. Display-only: the schedulers are
/// authoritative for actual firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerState {
  pub trigger_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_executed: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_execution: Option<DateTime<Utc>>,
  pub execution_count: u64,
  pub updated_at: DateTime<Utc>,
}

impl TriggerState {
  pub fn fresh(trigger_id: &str) -> Self {
    Self {
      trigger_id: trigger_id.to_string(),
      last_executed: None,
      next_execution: None,
      execution_count: 0,
      updated_at: Utc::now(),
    }
  }
}

fn state_key(trigger_id: &str) -> String {
  format!("trigger:{}:state", trigger_id)
}

/// Cache-backed store for [`TriggerState`].
#[derive(Clone)]
pub struct TriggerStateStore {
  cache: Arc<dyn Cache>,
}

impl TriggerStateStore {
  pub fn new(cache: Arc<dyn Cache>) -> Self {
    Self { cache }
  }

  /// Load a trigger's state; a missing entry reads as a fresh state.
  pub async fn load(&self, trigger_id: &str) -> Result<TriggerState, TriggerError> {
    match self.cache.get(&state_key(trigger_id)).await? {
      Some(bytes) => {
        serde_json::from_slice(&bytes).map_err(|_| TriggerError::NotFound(trigger_id.to_string()))
      }
      None => Ok(TriggerState::fresh(trigger_id)),
    }
  }

  pub async fn save(&self, state: &TriggerState) -> Result<(), TriggerError> {
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    self
      .cache
      .set(&state_key(&state.trigger_id), &bytes, None)
      .await?;
    Ok(())
  }

  pub async fn delete(&self, trigger_id: &str) -> Result<(), TriggerError> {
    self.cache.del(&state_key(trigger_id)).await?;
    Ok(())
  }

  /// Record one fire: bumps the counter and stamps the times.
  pub async fn record_fire(
    &self,
    trigger_id: &str,
    next_execution: Option<DateTime<Utc>>,
  ) -> Result<TriggerState, TriggerError> {
    let mut state = self.load(trigger_id).await?;
    state.last_executed = Some(Utc::now());
    state.next_execution = next_execution;
    state.execution_count += 1;
    state.updated_at = Utc::now();
    self.save(&state).await?;
    Ok(state)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mbflow_cache::MemoryCache;

  #[tokio::test]
  async fn missing_state_reads_fresh() {
    let store = TriggerStateStore::new(Arc::new(MemoryCache::new()));
    let state = store.load("t1").await.unwrap();
    assert_eq!(state.execution_count, 0);
    assert!(state.last_executed.is_none());
  }

  #[tokio::test]
  async fn record_fire_bumps_counter_and_persists() {
    let store = TriggerStateStore::new(Arc::new(MemoryCache::new()));
    store.record_fire("t1", None).await.unwrap();
    store.record_fire("t1", None).await.unwrap();

    let state = store.load("t1").await.unwrap();
    assert_eq!(state.execution_count, 2);
    assert!(state.last_executed.is_some());
  }

  #[tokio::test]
  async fn delete_resets_to_fresh() {
    let store = TriggerStateStore::new(Arc::new(MemoryCache::new()));
    store.record_fire("t1", None).await.unwrap();
    store.delete("t1").await.unwrap();
    assert_eq!(store.load("t1").await.unwrap().execution_count, 0);
  }
}
