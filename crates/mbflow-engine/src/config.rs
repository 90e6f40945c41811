use std::time::Duration;

/// Retry policy for transient node failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  /// First backoff delay.
  pub base: Duration,
  /// Backoff ceiling.
  pub cap: Duration,
  /// Retries after the initial attempt.
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base: Duration::from_millis(200),
      cap: Duration::from_secs(30),
      max_attempts: 3,
    }
  }
}

impl RetryPolicy {
  /// Jittered exponential delay before retry `attempt` (1-based).
  /// Never below `base`, never above `cap` plus half a step of jitter.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exp = self.base.saturating_mul(1u32 << (attempt - 1).min(16));
    let step = exp.min(self.cap);
    let jitter = step.mul_f64(rand::random::<f64>() * 0.5);
    step + jitter
  }
}

/// Engine tunables. Every field has a spec default and an `MBFLOW_*`
/// environment override; durations use humantime syntax (`"30s"`, `"1h"`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub max_parallelism: usize,
  pub execution_timeout: Duration,
  /// Per-node timeout when the node does not set one. `None` derives
  /// `max(1s, execution_timeout / (node_count * 2))` per execution.
  pub node_timeout_default: Option<Duration>,
  /// How long a cancel waits for in-flight tasks before abandoning them.
  pub cancel_grace: Duration,
  pub observer_queue_size: usize,
  pub retry: RetryPolicy,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      max_parallelism: 10,
      execution_timeout: Duration::from_secs(3600),
      node_timeout_default: None,
      cancel_grace: Duration::from_secs(30),
      observer_queue_size: 256,
      retry: RetryPolicy::default(),
    }
  }
}

impl EngineConfig {
  /// Build a config from `MBFLOW_*` environment variables, falling back to
  /// the defaults for anything unset or unparsable.
  pub fn from_env() -> Self {
    let mut config = Self::default();
    if let Some(n) = env_usize("MBFLOW_MAX_PARALLELISM") {
      config.max_parallelism = n;
    }
    if let Some(d) = env_duration("MBFLOW_EXECUTION_TIMEOUT") {
      config.execution_timeout = d;
    }
    if let Some(d) = env_duration("MBFLOW_NODE_TIMEOUT_DEFAULT") {
      config.node_timeout_default = Some(d);
    }
    if let Some(d) = env_duration("MBFLOW_CANCEL_GRACE") {
      config.cancel_grace = d;
    }
    if let Some(n) = env_usize("MBFLOW_OBSERVER_QUEUE_SIZE") {
      config.observer_queue_size = n;
    }
    if let Some(d) = env_duration("MBFLOW_RETRY_BASE") {
      config.retry.base = d;
    }
    if let Some(d) = env_duration("MBFLOW_RETRY_CAP") {
      config.retry.cap = d;
    }
    if let Some(n) = env_usize("MBFLOW_RETRY_MAX_ATTEMPTS") {
      config.retry.max_attempts = n as u32;
    }
    config
  }

  /// Effective timeout for a node: its own setting, then the configured
  /// default, then the derived formula.
  pub fn node_timeout(&self, node_timeout_ms: Option<u64>, node_count: usize) -> Duration {
    if let Some(ms) = node_timeout_ms {
      return Duration::from_millis(ms);
    }
    if let Some(d) = self.node_timeout_default {
      return d;
    }
    let derived = self.execution_timeout / (node_count.max(1) as u32 * 2);
    derived.max(Duration::from_secs(1))
  }
}

fn env_usize(key: &str) -> Option<usize> {
  std::env::var(key).ok()?.parse().ok()
}

fn env_duration(key: &str) -> Option<Duration> {
  humantime::parse_duration(&std::env::var(key).ok()?).ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backoff_grows_and_respects_base() {
    let policy = RetryPolicy::default();
    let first = policy.backoff(1);
    assert!(first >= Duration::from_millis(200));
    assert!(first <= Duration::from_millis(300));

    let third = policy.backoff(3);
    assert!(third >= Duration::from_millis(800));
  }

  #[test]
  fn backoff_caps_out() {
    let policy = RetryPolicy::default();
    let late = policy.backoff(12);
    assert!(late <= Duration::from_secs(45));
  }

  #[test]
  fn node_timeout_prefers_explicit_setting() {
    let config = EngineConfig::default();
    assert_eq!(
      config.node_timeout(Some(5000), 4),
      Duration::from_millis(5000)
    );
  }

  #[test]
  fn node_timeout_derives_from_execution_timeout() {
    let config = EngineConfig {
      execution_timeout: Duration::from_secs(100),
      ..Default::default()
    };
    assert_eq!(config.node_timeout(None, 5), Duration::from_secs(10));
    // Floors at one second.
    let tight = EngineConfig {
      execution_timeout: Duration::from_secs(1),
      ..Default::default()
    };
    assert_eq!(tight.node_timeout(None, 50), Duration::from_secs(1));
  }
}
