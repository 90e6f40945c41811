//! Webhook dispatcher.
//!
//! Processes a delivered payload for a webhook trigger: signature check over
//! canonical JSON, source-IP allow-list, cache-backed token-bucket rate
//! limit, then delivery to the engine.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use ipnet::IpNet;
use mbflow_cache::Cache;
use mbflow_engine::{Engine, ExecutionOptions};
use mbflow_store::Repository;
use mbflow_workflow::{Trigger, TriggerType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::canonical::to_canonical_json;
use crate::error::TriggerError;
use crate::state::TriggerStateStore;

/// Header carrying the lowercase-hex HMAC-SHA256 of the canonical payload.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Everything the HTTP layer hands over for one delivery.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
  pub trigger_id: String,
  pub raw_body: Vec<u8>,
  pub payload: Map<String, Value>,
  pub headers: HashMap<String, String>,
  pub source_ip: String,
}

#[derive(Serialize, Deserialize)]
struct Bucket {
  tokens: f64,
  updated_ms: i64,
}

/// In-memory registry of webhook triggers plus the delivery pipeline.
pub struct WebhookDispatcher {
  engine: Engine,
  cache: Arc<dyn Cache>,
  repository: Arc<dyn Repository>,
  states: TriggerStateStore,
  triggers: Mutex<HashMap<String, Trigger>>,
}

/// The signature a well-behaved client sends: lowercase hex of
/// HMAC-SHA256(secret, canonical(payload)).
pub fn compute_signature(secret: &str, payload: &Map<String, Value>) -> String {
  let canonical = to_canonical_json(&Value::Object(payload.clone()));
  let mut mac =
    HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
  mac.update(canonical.as_bytes());
  hex::encode(mac.finalize().into_bytes())
}

impl WebhookDispatcher {
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
      triggers: Mutex::new(HashMap::new()),
    }
  }

  /// Register the initial webhook set. Non-webhook triggers are ignored.
  pub async fn start(&self, triggers: Vec<Trigger>) {
    for trigger in triggers {
      self.register(&trigger).await;
    }
  }

  pub async fn stop(&self) {
    self.triggers.lock().await.clear();
  }

  pub async fn register(&self, trigger: &Trigger) {
    if trigger.trigger_type != TriggerType::Webhook {
      return;
    }
    self
      .triggers
      .lock()
      .await
      .insert(trigger.id.clone(), trigger.clone());
    info!(trigger_id = %trigger.id, "webhook registered");
  }

  pub async fn unregister(&self, trigger_id: &str) {
    if self.triggers.lock().await.remove(trigger_id).is_some() {
      let _ = self.states.delete(trigger_id).await;
      info!(trigger_id = %trigger_id, "webhook unregistered");
    }
  }

  pub async fn is_registered(&self, trigger_id: &str) -> bool {
    self.triggers.lock().await.contains_key(trigger_id)
  }

  /// Validate and deliver one webhook payload. Returns the execution id.
  pub async fn handle(&self, delivery: WebhookDelivery) -> Result<String, TriggerError> {
    let trigger = {
      let triggers = self.triggers.lock().await;
      triggers
        .get(&delivery.trigger_id)
        .cloned()
        .ok_or_else(|| TriggerError::NotFound(delivery.trigger_id.clone()))?
    };
    if !trigger.enabled {
      return Err(TriggerError::Disabled(trigger.id.clone()));
    }

    if let Some(secret) = trigger.config_str("secret") {
      self.verify_signature(secret, &delivery)?;
    }
    if let Some(Value::Array(allowed)) = trigger.config.get("ip_whitelist") {
      verify_source_ip(&delivery.source_ip, allowed)?;
    }
    if let Some(rate_limit) = trigger.config.get("rate_limit") {
      let per_minute = rate_limit
        .get("per_minute")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
      if per_minute > 0.0 {
        self.take_token(&trigger.id, per_minute).await?;
      }
    }

    // Delivery: webhook payload wins over the trigger's default input.
    let mut input = trigger.default_input();
    for (key, value) in &delivery.payload {
      input.insert(key.clone(), value.clone());
    }

    let options = ExecutionOptions::default().with_caller(&format!("trigger:{}", trigger.id));
    let execution_id = self.engine.execute(&trigger.workflow_id, input, options).await?;

    if let Err(e) = self.states.record_fire(&trigger.id, None).await {
      warn!(trigger_id = %trigger.id, error = %e, "failed to record trigger state");
    }
    if let Err(e) = self.repository.mark_trigger_fired(&trigger.id).await {
      warn!(trigger_id = %trigger.id, error = %e, "failed to mark trigger fired");
    }

    Ok(execution_id)
  }

  fn verify_signature(
    &self,
    secret: &str,
    delivery: &WebhookDelivery,
  ) -> Result<(), TriggerError> {
    let sent = delivery
      .headers
      .iter()
      .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
      .map(|(_, value)| value.as_str())
      .ok_or(TriggerError::SignatureMissing)?;

    let expected = compute_signature(secret, &delivery.payload);
    if !sent.eq_ignore_ascii_case(&expected) {
      return Err(TriggerError::SignatureInvalid);
    }
    Ok(())
  }

  /// Token bucket in the shared cache: capacity `per_minute`, refill at
  /// `per_minute / 60` tokens per second.
  async fn take_token(&self, trigger_id: &str, per_minute: f64) -> Result<(), TriggerError> {
    let key = format!("trigger:{}:bucket", trigger_id);
    let now_ms = chrono::Utc::now().timestamp_millis();

    let mut bucket = match self.cache.get(&key).await? {
      Some(bytes) => serde_json::from_slice(&bytes).unwrap_or(Bucket {
        tokens: per_minute,
        updated_ms: now_ms,
      }),
      None => Bucket {
        tokens: per_minute,
        updated_ms: now_ms,
      },
    };

    let elapsed_secs = ((now_ms - bucket.updated_ms).max(0)) as f64 / 1000.0;
    bucket.tokens = (bucket.tokens + elapsed_secs * per_minute / 60.0).min(per_minute);
    bucket.updated_ms = now_ms;

    if bucket.tokens < 1.0 {
      let deficit = 1.0 - bucket.tokens;
      let retry_after_secs = (deficit / (per_minute / 60.0)).ceil() as u64;
      let bytes = serde_json::to_vec(&bucket).unwrap_or_default();
      let _ = self.cache.set(&key, &bytes, None).await;
      return Err(TriggerError::RateLimited { retry_after_secs });
    }

    bucket.tokens -= 1.0;
    let bytes = serde_json::to_vec(&bucket).unwrap_or_default();
    self.cache.set(&key, &bytes, None).await?;
    Ok(())
  }
}

fn verify_source_ip(source_ip: &str, allowed: &[Value]) -> Result<(), TriggerError> {
  let source: IpAddr = source_ip
    .parse()
    .map_err(|_| TriggerError::InvalidSourceIp(source_ip.to_string()))?;

  for entry in allowed {
    let Some(text) = entry.as_str() else {
      // Non-string entries are skipped.
      continue;
    };
    if let Ok(network) = IpNet::from_str(text) {
      if network.contains(&source) {
        return Ok(());
      }
    } else if let Ok(exact) = text.parse::<IpAddr>() {
      if exact == source {
        return Ok(());
      }
    } else {
      debug!(entry = text, "skipping unparsable allow-list entry");
    }
  }
  Err(TriggerError::IpNotAllowed(source_ip.to_string()))
}
