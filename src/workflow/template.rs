//! Workflow templates and their validation
//!
//! A template is a directed acyclic graph of tasks. It is validated once, at
//! registration, and compiled into a [`CompiledTemplate`] holding the typed
//! task behaviors and the parent/child adjacency used by the scheduler.

use super::task::{
    FactoryConfig, JoinConfig, PublishConfig, SleepConfig, TaskKind, TaskSpec,
    TriggerWorkflowConfig,
};
use crate::protocol::{validate_publish_topic, validate_topic_filter};
use crate::rules::{RuleRegistry, RulerConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTemplate {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Root templates are the entry points listed by `root=1` queries
    #[serde(default)]
    pub root: bool,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub triggers: Vec<WorkflowTrigger>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default = "empty_config")]
    pub config: Value,
}

fn empty_config() -> Value {
    Value::Object(Default::default())
}

/// Parent to child dependency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// Bus input starting an instance of the template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTrigger {
    pub topic: String,
    /// Named ruler applied to the event payload first
    pub ruler: Option<String>,
    /// Payload fields that must be present, else the instance is skipped
    #[serde(default)]
    pub require: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkflowValidationError {
    #[error("Template id cannot be empty")]
    EmptyId,
    #[error("Template '{0}' has no task")]
    NoTask(String),
    #[error("Template '{0}' is already registered")]
    DuplicateTemplate(String),
    #[error("Duplicate task id '{0}'")]
    DuplicateTask(String),
    #[error("Edge {from} -> {to} references unknown task '{unknown}'")]
    UnknownEdgeEndpoint {
        from: String,
        to: String,
        unknown: String,
    },
    #[error("Task graph contains a cycle through {0:?}")]
    Cycle(Vec<String>),
    #[error("Invalid config for task '{task}': {details}")]
    InvalidTaskConfig { task: String, details: String },
    #[error("Join '{join}' waits for unknown task '{unknown}'")]
    UnknownWaitFor { join: String, unknown: String },
    #[error("Join '{join}' cannot wait for '{task}', which runs after it")]
    WaitForDescendant { join: String, task: String },
    #[error("Invalid rules in task '{task}': {details}")]
    InvalidRules { task: String, details: String },
    #[error("Invalid trigger on '{topic}': {details}")]
    InvalidTrigger { topic: String, details: String },
}

/// Validated template ready to be instantiated
#[derive(Debug)]
pub struct CompiledTemplate {
    pub template: WorkflowTemplate,
    pub specs: HashMap<String, TaskSpec>,
    pub parents: HashMap<String, Vec<String>>,
    pub children: HashMap<String, Vec<String>>,
    /// Task ids in declaration order
    pub order: Vec<String>,
}

impl CompiledTemplate {
    pub fn id(&self) -> &str {
        &self.template.id
    }

    /// Tasks without parents, started on instantiation
    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.parents.get(*id).map_or(true, Vec::is_empty))
            .map(String::as_str)
            .collect()
    }

    pub fn parents_of(&self, task: &str) -> &[String] {
        self.parents.get(task).map_or(&[], Vec::as_slice)
    }

    pub fn children_of(&self, task: &str) -> &[String] {
        self.children.get(task).map_or(&[], Vec::as_slice)
    }

    /// Running joins that wait on `task`
    pub fn joins_waiting_for<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.order.iter().map(String::as_str).filter(move |id| {
            matches!(self.specs.get(*id), Some(TaskSpec::Join { wait_for, .. }) if wait_for.iter().any(|w| w == task))
        })
    }
}

fn invalid_config(task: &str, details: impl ToString) -> WorkflowValidationError {
    WorkflowValidationError::InvalidTaskConfig {
        task: task.to_string(),
        details: details.to_string(),
    }
}

/// Check a task config against its type's JSON schema
fn validate_schema(task: &TaskDefinition) -> Result<(), WorkflowValidationError> {
    let validator = jsonschema::validator_for(task.kind.schema())
        .map_err(|e| invalid_config(&task.id, format!("schema compilation error: {e}")))?;

    validator.validate(&task.config).map_err(|errors| {
        let messages: Vec<String> = errors
            .map(|e| format!("at '{}': {}", e.instance_path, e))
            .collect();
        invalid_config(&task.id, messages.join("; "))
    })
}

fn compile_task(
    task: &TaskDefinition,
    rulers: &HashMap<String, RulerConfig>,
    registry: &RuleRegistry,
) -> Result<TaskSpec, WorkflowValidationError> {
    validate_schema(task)?;
    let config = task.config.clone();

    let spec = match task.kind {
        TaskKind::Sleep => {
            let config: SleepConfig =
                serde_json::from_value(config).map_err(|e| invalid_config(&task.id, e))?;
            TaskSpec::Sleep(Duration::from_secs(config.time))
        }
        TaskKind::Join => {
            let config: JoinConfig =
                serde_json::from_value(config).map_err(|e| invalid_config(&task.id, e))?;
            TaskSpec::Join {
                wait_for: config.wait_for,
                timeout: Duration::from_secs(config.timeout),
            }
        }
        TaskKind::Factory => {
            let config: FactoryConfig =
                serde_json::from_value(config).map_err(|e| invalid_config(&task.id, e))?;
            let converter =
                config
                    .compile(rulers, registry)
                    .map_err(|details| WorkflowValidationError::InvalidRules {
                        task: task.id.clone(),
                        details,
                    })?;
            TaskSpec::Factory(Arc::new(converter))
        }
        TaskKind::Publish => {
            let config: PublishConfig =
                serde_json::from_value(config).map_err(|e| invalid_config(&task.id, e))?;
            validate_publish_topic(&config.topic).map_err(|e| invalid_config(&task.id, e))?;
            TaskSpec::Publish {
                topic: config.topic,
            }
        }
        TaskKind::TriggerWorkflow => {
            let config: TriggerWorkflowConfig =
                serde_json::from_value(config).map_err(|e| invalid_config(&task.id, e))?;
            TaskSpec::TriggerWorkflow {
                template: config.template,
                await_completion: config.await_completion,
                timeout: Duration::from_secs(config.timeout),
            }
        }
    };
    Ok(spec)
}

/// Kahn's algorithm; the leftover tasks are on a cycle
fn check_acyclic(
    order: &[String],
    children: &HashMap<String, Vec<String>>,
    parents: &HashMap<String, Vec<String>>,
) -> Result<(), WorkflowValidationError> {
    let mut in_degree: HashMap<&str, usize> = order
        .iter()
        .map(|id| (id.as_str(), parents.get(id).map_or(0, Vec::len)))
        .collect();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for child in children.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if visited == order.len() {
        return Ok(());
    }
    let mut on_cycle: Vec<String> = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(id, _)| id.to_string())
        .collect();
    on_cycle.sort();
    Err(WorkflowValidationError::Cycle(on_cycle))
}

fn descendants(task: &str, children: &HashMap<String, Vec<String>>) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = vec![task];
    while let Some(id) = stack.pop() {
        for child in children.get(id).into_iter().flatten() {
            if seen.insert(child.clone()) {
                stack.push(child);
            }
        }
    }
    seen
}

impl WorkflowTemplate {
    /// Validate the template and compile it for the scheduler
    pub fn compile(
        &self,
        rulers: &HashMap<String, RulerConfig>,
    ) -> Result<CompiledTemplate, WorkflowValidationError> {
        self.compile_with(rulers, &RuleRegistry::new())
    }

    /// Like [`compile`](Self::compile), resolving factory rule references
    /// against `registry`
    pub fn compile_with(
        &self,
        rulers: &HashMap<String, RulerConfig>,
        registry: &RuleRegistry,
    ) -> Result<CompiledTemplate, WorkflowValidationError> {
        if self.id.trim().is_empty() {
            return Err(WorkflowValidationError::EmptyId);
        }
        if self.tasks.is_empty() {
            return Err(WorkflowValidationError::NoTask(self.id.clone()));
        }

        let mut order = Vec::with_capacity(self.tasks.len());
        let mut specs = HashMap::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if specs.contains_key(&task.id) {
                return Err(WorkflowValidationError::DuplicateTask(task.id.clone()));
            }
            let spec = compile_task(task, rulers, registry)?;
            if matches!(&spec, TaskSpec::TriggerWorkflow { template, .. } if *template == self.id) {
                return Err(invalid_config(&task.id, "a workflow cannot trigger itself"));
            }
            specs.insert(task.id.clone(), spec);
            order.push(task.id.clone());
        }

        // BTreeMap keeps children in a stable order
        let mut parents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut seen_edges = HashSet::new();
        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !specs.contains_key(endpoint) {
                    return Err(WorkflowValidationError::UnknownEdgeEndpoint {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        unknown: endpoint.clone(),
                    });
                }
            }
            if !seen_edges.insert(edge) {
                continue;
            }
            children.entry(edge.from.clone()).or_default().push(edge.to.clone());
            parents.entry(edge.to.clone()).or_default().push(edge.from.clone());
        }
        let parents: HashMap<String, Vec<String>> = parents.into_iter().collect();
        let children: HashMap<String, Vec<String>> = children.into_iter().collect();

        check_acyclic(&order, &children, &parents)?;

        for (id, spec) in &specs {
            if let TaskSpec::Join { wait_for, .. } = spec {
                let after = descendants(id, &children);
                for waited in wait_for {
                    if !specs.contains_key(waited) {
                        return Err(WorkflowValidationError::UnknownWaitFor {
                            join: id.clone(),
                            unknown: waited.clone(),
                        });
                    }
                    if waited == id || after.contains(waited) {
                        return Err(WorkflowValidationError::WaitForDescendant {
                            join: id.clone(),
                            task: waited.clone(),
                        });
                    }
                }
            }
        }

        for trigger in &self.triggers {
            let invalid = |details: String| WorkflowValidationError::InvalidTrigger {
                topic: trigger.topic.clone(),
                details,
            };
            validate_topic_filter(&trigger.topic).map_err(|e| invalid(e.to_string()))?;
            if let Some(ruler) = &trigger.ruler {
                if !rulers.contains_key(ruler) {
                    return Err(invalid(format!("unknown ruler '{ruler}'")));
                }
            }
        }

        Ok(CompiledTemplate {
            template: self.clone(),
            specs,
            parents,
            children,
            order,
        })
    }
}
