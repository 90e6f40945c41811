use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a trigger is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
  Manual,
  Cron,
  Interval,
  Webhook,
  Event,
}

/// An arming specification bound to one workflow.
///
/// The `config` map is type-specific: `cron.{schedule,timezone}`,
/// `interval.duration`, `webhook.{secret,ip_whitelist,rate_limit}`,
/// `event.{event_type,filter,source}`. All types accept an `input` map used
/// as the default execution input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
  pub id: String,
  pub workflow_id: String,
  #[serde(rename = "type")]
  pub trigger_type: TriggerType,
  pub enabled: bool,
  #[serde(default)]
  pub config: Map<String, Value>,
}

impl Trigger {
  /// A string-valued config key, if present.
  pub fn config_str(&self, key: &str) -> Option<&str> {
    self.config.get(key).and_then(|v| v.as_str())
  }

  /// The default execution input carried in `config.input`.
  pub fn default_input(&self) -> Map<String, Value> {
    self
      .config
      .get("input")
      .and_then(|v| v.as_object())
      .cloned()
      .unwrap_or_default()
  }
}
