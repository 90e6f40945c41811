/// Error type for executor invocations.
///
/// Executors self-classify their failures: transient errors (network,
/// upstream 5xx, timeouts) are retried by the engine, permanent errors are
/// not.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
  #[error("transient executor error: {message}")]
  Transient { message: String },

  #[error("permanent executor error: {message}")]
  Permanent { message: String },
}

impl ExecutorError {
  pub fn transient(message: impl Into<String>) -> Self {
    Self::Transient {
      message: message.into(),
    }
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self::Permanent {
      message: message.into(),
    }
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient { .. })
  }

  /// Machine-readable error code.
  pub fn code(&self) -> &'static str {
    match self {
      Self::Transient { .. } => "executor_error_transient",
      Self::Permanent { .. } => "executor_error_permanent",
    }
  }
}
