//! Task types and their configuration
//!
//! Task configurations are checked twice when a template is registered: once
//! against the per-type JSON schema, then parsed into the typed config used
//! by the scheduler.

use crate::protocol::Payload;
use crate::rules::{Converter, RuleError, RuleRegistry, RulerConfig};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default sleep duration in seconds
pub const DEFAULT_SLEEP_SECS: u64 = 2;
/// Default join timeout in seconds
pub const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 60;
/// Default wait for a nested workflow, in seconds
pub const DEFAULT_NESTED_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Sleep,
    Join,
    Factory,
    /// Emit the instance payload on a bus topic
    Publish,
    /// Start a nested, non-root instance of another template
    #[serde(rename = "trigger_workflow")]
    TriggerWorkflow,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Sleep => "sleep",
            TaskKind::Join => "join",
            TaskKind::Factory => "factory",
            TaskKind::Publish => "publish",
            TaskKind::TriggerWorkflow => "trigger_workflow",
        }
    }

    /// JSON schema the task `config` must satisfy
    pub fn schema(&self) -> &'static Value {
        match self {
            TaskKind::Sleep => &SLEEP_SCHEMA,
            TaskKind::Join => &JOIN_SCHEMA,
            TaskKind::Factory => &FACTORY_SCHEMA,
            TaskKind::Publish => &PUBLISH_SCHEMA,
            TaskKind::TriggerWorkflow => &TRIGGER_WORKFLOW_SCHEMA,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static SLEEP_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "time": {"type": "integer", "minimum": 1}
        }
    })
});

static JOIN_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["wait_for"],
        "properties": {
            "wait_for": {
                "type": "array",
                "minItems": 1,
                "items": {"type": "string", "minLength": 1}
            },
            "timeout": {"type": "integer", "minimum": 1}
        }
    })
});

static FACTORY_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["rulers"],
        "properties": {
            "rulers": {
                "type": "array",
                "items": {
                    "anyOf": [
                        {"type": "string", "minLength": 1},
                        {
                            "type": "object",
                            "required": ["rules"],
                            "properties": {
                                "type": {"type": "string"},
                                "name": {"type": "string"},
                                "rules": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "required": ["type", "fieldname"],
                                        "properties": {
                                            "type": {"type": "string"},
                                            "fieldname": {"type": "string", "minLength": 1}
                                        }
                                    }
                                }
                            }
                        }
                    ]
                }
            }
        }
    })
});

static PUBLISH_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["topic"],
        "properties": {
            "topic": {"type": "string", "minLength": 1}
        }
    })
});

static TRIGGER_WORKFLOW_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["template"],
        "properties": {
            "template": {"type": "string", "minLength": 1},
            "await_completion": {"type": "boolean"},
            "timeout": {"type": "integer", "minimum": 1}
        }
    })
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SleepConfig {
    /// Seconds
    #[serde(default = "default_sleep")]
    pub time: u64,
}

fn default_sleep() -> u64 {
    DEFAULT_SLEEP_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinConfig {
    pub wait_for: Vec<String>,
    /// Seconds, counted from the join's start
    #[serde(default = "default_join_timeout")]
    pub timeout: u64,
}

fn default_join_timeout() -> u64 {
    DEFAULT_JOIN_TIMEOUT_SECS
}

/// A ruler given by name or inline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RulerRef {
    Named(String),
    Inline(RulerConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactoryConfig {
    pub rulers: Vec<RulerRef>,
}

impl FactoryConfig {
    /// Resolve named rulers and registry references, then compile everything
    /// into one converter
    pub fn compile(
        &self,
        named: &HashMap<String, RulerConfig>,
        registry: &RuleRegistry,
    ) -> Result<Converter, String> {
        let mut rulers = Vec::with_capacity(self.rulers.len());
        for ruler in &self.rulers {
            let ruler = match ruler {
                RulerRef::Named(name) => named
                    .get(name)
                    .ok_or_else(|| format!("unknown ruler '{name}'"))?,
                RulerRef::Inline(ruler) => ruler,
            };
            rulers.push(registry.resolve_ruler(ruler).map_err(|e| e.to_string())?);
        }
        Converter::from_rulers(&rulers).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerWorkflowConfig {
    /// Template id of the nested workflow
    pub template: String,
    /// Finish only when the nested instance does
    #[serde(default)]
    pub await_completion: bool,
    /// Seconds to wait when `await_completion` is set
    #[serde(default = "default_nested_timeout")]
    pub timeout: u64,
}

fn default_nested_timeout() -> u64 {
    DEFAULT_NESTED_TIMEOUT_SECS
}

/// Compiled, ready-to-run task behavior
#[derive(Debug, Clone)]
pub enum TaskSpec {
    Sleep(Duration),
    Join {
        wait_for: Vec<String>,
        timeout: Duration,
    },
    Factory(Arc<Converter>),
    Publish {
        topic: String,
    },
    TriggerWorkflow {
        template: String,
        await_completion: bool,
        timeout: Duration,
    },
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskSpec::Sleep(_) => TaskKind::Sleep,
            TaskSpec::Join { .. } => TaskKind::Join,
            TaskSpec::Factory(_) => TaskKind::Factory,
            TaskSpec::Publish { .. } => TaskKind::Publish,
            TaskSpec::TriggerWorkflow { .. } => TaskKind::TriggerWorkflow,
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self, TaskSpec::Join { .. })
    }
}

/// Failure recorded on a task execution
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("Task execution failed: {0}")]
    Execution(String),
    #[error("Timed out after {seconds}s waiting for {pending:?}")]
    Timeout { seconds: u64, pending: Vec<String> },
    #[error("Rules failed: {}", format_rule_errors(.0))]
    Rules(Vec<RuleError>),
    #[error("Upstream task '{0}' failed")]
    Upstream(String),
}

fn format_rule_errors(errors: &[RuleError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Run a factory on the instance payload
///
/// The transformed payload is committed even when some rules failed; the
/// failures make the task fail.
pub fn run_factory(converter: &Converter, payload: &mut Payload) -> Result<(), TaskError> {
    let errors = converter.apply_in_place(payload);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TaskError::Rules(errors))
    }
}
