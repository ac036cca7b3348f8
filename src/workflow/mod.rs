//! Workflow orchestration
//!
//! Templates describe a DAG of typed tasks. The [`WorkflowEngine`] registers
//! templates, turns them into instances on request or on bus triggers, and
//! drives every instance to a terminal state.

pub mod api;
pub mod engine;
pub mod instance;
pub mod task;
pub mod template;

pub use engine::{instance_topic, EngineError, EventSink, WorkflowEngine};
pub use instance::{InstanceState, TaskExecution, TaskState, WorkflowInstance};
pub use task::{TaskError, TaskKind, TaskSpec, TriggerWorkflowConfig};
pub use template::{
    CompiledTemplate, Edge, TaskDefinition, WorkflowTemplate, WorkflowTrigger,
    WorkflowValidationError,
};
