use mbflow_cache::CacheError;
use mbflow_engine::EngineError;
use mbflow_store::StoreError;

/// Error type for trigger operations.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
  #[error("trigger '{0}' not found")]
  NotFound(String),

  #[error("trigger '{0}' is disabled")]
  Disabled(String),

  #[error("invalid cron schedule '{schedule}': {message}")]
  InvalidSchedule { schedule: String, message: String },

  #[error("invalid interval '{value}': {message}")]
  InvalidInterval { value: String, message: String },

  #[error("signature required but no {header} header was sent", header = crate::webhook::SIGNATURE_HEADER)]
  SignatureMissing,

  #[error("webhook signature mismatch")]
  SignatureInvalid,

  #[error("source ip '{0}' is not a valid address")]
  InvalidSourceIp(String),

  #[error("source ip '{0}' is not on the allow-list")]
  IpNotAllowed(String),

  #[error("rate limit exceeded; retry after {retry_after_secs}s")]
  RateLimited { retry_after_secs: u64 },

  #[error("invalid event trigger config: {message}")]
  InvalidEventConfig { message: String },

  #[error("workflow '{workflow_id}' for trigger '{trigger_id}' no longer exists")]
  WorkflowMissing {
    trigger_id: String,
    workflow_id: String,
  },

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Engine(#[from] EngineError),
}

impl TriggerError {
  /// Machine-readable error code.
  pub fn code(&self) -> &'static str {
    match self {
      Self::NotFound(_) | Self::Disabled(_) | Self::InvalidEventConfig { .. } => "validation",
      Self::InvalidSchedule { .. } => "invalid_schedule",
      Self::InvalidInterval { .. } => "invalid_interval",
      Self::SignatureMissing => "signature_missing",
      Self::SignatureInvalid => "signature_invalid",
      Self::InvalidSourceIp(_) => "invalid_source_ip",
      Self::IpNotAllowed(_) => "ip_not_allowed",
      Self::RateLimited { .. } => "rate_limited",
      Self::WorkflowMissing { .. } => "trigger_workflow_missing",
      Self::Cache(_) => "persistence",
      Self::Store(_) => "persistence",
      Self::Engine(e) => e.code(),
    }
  }
}
