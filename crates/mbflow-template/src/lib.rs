//! Template resolution for node configs and edge conditions.
//!
//! Placeholders use `{{ dotted.path }}` syntax and resolve against a [`Scope`]
//! of workflow variables, execution variables, node outputs, and the reserved
//! `input` and `env` maps. A string that is exactly one placeholder resolves
//! to the native value; placeholders embedded in a larger string interpolate
//! as text. Edge conditions are evaluated as typed expressions against the
//! same scope.

mod error;
mod resolve;
mod scope;

pub use error::TemplateError;
pub use resolve::{eval_condition, resolve_config, resolve_value};
pub use scope::Scope;
