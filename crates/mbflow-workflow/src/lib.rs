//! MBFlow workflow model
//!
//! The serializable workflow definition (nodes, edges, triggers) together with
//! the execution records the engine produces, and the DAG analyzer that turns
//! a definition into a wave-ordered schedule plan.

mod edge;
mod error;
mod event;
mod execution;
mod node;
mod plan;
mod trigger;
mod workflow;

pub use edge::{Edge, JoinStrategy, LoopConfig};
pub use error::AnalysisError;
pub use event::{Event, EventType};
pub use execution::{Execution, ExecutionStatus, NodeExecution, NodeExecutionStatus};
pub use node::{Node, OnFailure, Position};
pub use plan::{EdgeKind, SchedulePlan, analyze};
pub use trigger::{Trigger, TriggerType};
pub use workflow::{Workflow, WorkflowStatus};
