//! Agent runtime
//!
//! Wires configuration, bus, workflow engine and history into one process.

pub mod dispatch;
pub mod lifecycle;

pub use dispatch::{DispatchTable, TriggerHandler, TriggerRoute};
pub use lifecycle::{AgentRuntime, LifecycleError};
