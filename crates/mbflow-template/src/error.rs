/// Error type for template resolution.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
  #[error("unresolved template '{template}': {message}")]
  Unresolved { template: String, message: String },

  #[error("invalid template '{template}': {message}")]
  Syntax { template: String, message: String },

  #[error("condition '{expression}' failed to evaluate: {message}")]
  Condition { expression: String, message: String },
}

impl TemplateError {
  /// Machine-readable error code.
  pub fn code(&self) -> &'static str {
    match self {
      Self::Unresolved { .. } => "template_unresolved",
      Self::Syntax { .. } | Self::Condition { .. } => "validation",
    }
  }
}
