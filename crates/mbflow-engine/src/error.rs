use mbflow_workflow::AnalysisError;
use mbflow_store::StoreError;

/// Error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error(transparent)]
  Analysis(#[from] AnalysisError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("execution '{id}' cannot be retried from status '{status}'")]
  NotRetryable { id: String, status: String },

  #[error("workflow '{workflow_id}' is at version {current}, execution was against {expected}")]
  VersionChanged {
    workflow_id: String,
    expected: i64,
    current: i64,
  },

  #[error("validation failed: {message}")]
  Validation { message: String },
}

impl EngineError {
  /// Machine-readable error code.
  pub fn code(&self) -> &'static str {
    match self {
      Self::Analysis(e) => e.code(),
      Self::Store(e) => e.code(),
      Self::NotRetryable { .. } | Self::VersionChanged { .. } | Self::Validation { .. } => {
        "validation"
      }
    }
  }
}
