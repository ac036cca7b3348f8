//! Structured logging and in-process metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot, TaskOutcome};

// Span macros for structured logging
pub use logging::{bus_span, workflow_span};
