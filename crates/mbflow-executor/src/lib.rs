//! Node executors for MBFlow.
//!
//! An [`Executor`] turns a resolved node config plus input into an output
//! value. The [`ExecutorRegistry`] maps node type tags to executors; the
//! engine knows nothing about any specific node semantics.

mod context;
mod error;
mod http;
mod registry;
mod transform;

pub use context::ExecContext;
pub use error::ExecutorError;
pub use http::HttpExecutor;
pub use registry::{Executor, ExecutorRegistry};
pub use transform::TransformExecutor;
