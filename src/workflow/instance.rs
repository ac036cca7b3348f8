//! Workflow instance and task execution state

use super::task::{TaskError, TaskKind};
use crate::error::sanitize_error_message;
use crate::protocol::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Finished,
    Exception,
    Cancelled,
    /// A trigger precondition was not met
    Skipped,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceState::Pending | InstanceState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Finished => "finished",
            InstanceState::Exception => "exception",
            InstanceState::Cancelled => "cancelled",
            InstanceState::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "finished" => Some(InstanceState::Finished),
            "exception" => Some(InstanceState::Exception),
            "cancelled" => Some(InstanceState::Cancelled),
            "skipped" => Some(InstanceState::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Skipped)
    }
}

/// One task's run inside one instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecution {
    pub instance_id: Uuid,
    pub task_id: String,
    pub task_type: TaskKind,
    pub state: TaskState,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskExecution {
    pub fn running(instance_id: Uuid, task_id: &str, task_type: TaskKind) -> Self {
        Self {
            instance_id,
            task_id: task_id.to_string(),
            task_type,
            state: TaskState::Running,
            start: Utc::now(),
            end: None,
            error: None,
        }
    }

    /// Execution created directly in the skipped state
    pub fn skipped(instance_id: Uuid, task_id: &str, task_type: TaskKind) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            task_id: task_id.to_string(),
            task_type,
            state: TaskState::Skipped,
            start: now,
            end: Some(now),
            error: None,
        }
    }

    /// Move to a terminal state; returns false if already terminal
    pub fn finish(&mut self, result: Result<(), TaskError>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        match result {
            Ok(()) => self.state = TaskState::Done,
            Err(e) => {
                self.state = TaskState::Failed;
                self.error = Some(sanitize_error_message(&e.to_string()));
            }
        }
        self.end = Some(Utc::now().max(self.start));
        true
    }

    pub fn skip(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TaskState::Skipped;
        self.end = Some(Utc::now().max(self.start));
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: Uuid,
    #[serde(rename = "template")]
    pub template_id: String,
    pub title: String,
    pub root: bool,
    pub state: InstanceState,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub payload: Payload,
}

impl WorkflowInstance {
    pub fn new(template_id: &str, title: &str, root: bool, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            template_id: template_id.to_string(),
            title: title.to_string(),
            root,
            state: InstanceState::Pending,
            start: Utc::now(),
            end: None,
            payload,
        }
    }

    /// Change state, stamping `end` exactly once on the first terminal state
    ///
    /// Returns false when the instance is already terminal.
    pub fn transition(&mut self, state: InstanceState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = state;
        if state.is_terminal() {
            self.end = Some(Utc::now().max(self.start));
        }
        true
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end.map(|end| (end - self.start).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_end_set_once() {
        let mut instance = WorkflowInstance::new("wf", "Workflow", true, Payload::new());
        assert!(instance.end.is_none());

        assert!(instance.transition(InstanceState::Running));
        assert!(instance.end.is_none());

        assert!(instance.transition(InstanceState::Finished));
        let end = instance.end;
        assert!(end.is_some());
        assert!(instance.duration_ms().unwrap() >= 0);

        assert!(!instance.transition(InstanceState::Cancelled));
        assert_eq!(instance.state, InstanceState::Finished);
        assert_eq!(instance.end, end);
    }

    #[test]
    fn test_task_execution_terminal_once() {
        let mut execution = TaskExecution::running(Uuid::new_v4(), "a", TaskKind::Join);
        assert!(execution.finish(Err(TaskError::Upstream("b".to_string()))));
        assert_eq!(execution.state, TaskState::Failed);
        assert_eq!(execution.error.as_deref(), Some("Upstream task 'b' failed"));
        assert!(execution.start <= execution.end.unwrap());

        assert!(!execution.skip());
        assert_eq!(execution.state, TaskState::Failed);
    }

    #[test]
    fn test_state_strings() {
        for state in [
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Finished,
            InstanceState::Exception,
            InstanceState::Cancelled,
            InstanceState::Skipped,
        ] {
            assert_eq!(InstanceState::parse(state.as_str()), Some(state));
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.to_string())
            );
        }
        assert_eq!(InstanceState::parse("done"), None);
    }
}
