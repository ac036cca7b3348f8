//! Workflow scheduler
//!
//! One actor task owns every template and running instance. Commands arrive on
//! an mpsc queue, timers live in a `BTreeMap` wheel, and task transitions are
//! processed from an internal work queue so that nothing recurses. Side
//! effects (bus emissions, history writes) go through a single FIFO worker, so
//! the scheduler never waits on I/O.

use super::instance::{InstanceState, TaskExecution, TaskState, WorkflowInstance};
use super::task::{run_factory, TaskError, TaskSpec};
use super::template::{CompiledTemplate, WorkflowTemplate, WorkflowValidationError};
use crate::bus::Bus;
use crate::history::{HistoryError, HistoryStore, InstanceRecord};
use crate::observability::metrics::{metrics, TaskOutcome};
use crate::protocol::{payload_from_value, Payload};
use crate::rules::{LookupEntry, RegexEntry, RegistryError, RuleRegistry, RulerConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const COMMAND_CHANNEL_CAPACITY: usize = 256;
pub const HISTORY_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Instance state changes are published under this prefix
pub const INSTANCE_TOPIC_PREFIX: &str = "workflow/instances";

pub fn instance_topic(id: Uuid) -> String {
    format!("{INSTANCE_TOPIC_PREFIX}/{id}")
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown template '{0}'")]
    UnknownTemplate(String),
    #[error("Unknown instance {0}")]
    UnknownInstance(Uuid),
    #[error(transparent)]
    Validation(#[from] WorkflowValidationError),
    #[error("Instance {0} is already terminal")]
    AlreadyTerminal(Uuid),
    #[error("History lookup failed: {0}")]
    History(#[from] HistoryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Workflow engine stopped")]
    Stopped,
}

/// Where the engine publishes instance states and publish-task payloads
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, topic: &str, payload: Payload) -> Result<(), String>;
}

#[async_trait]
impl EventSink for Bus {
    async fn emit(&self, topic: &str, payload: Payload) -> Result<(), String> {
        self.publish(topic, payload)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

enum Command {
    RegisterTemplate {
        template: WorkflowTemplate,
        replace: bool,
        reply: oneshot::Sender<Result<WorkflowTemplate, EngineError>>,
    },
    Templates {
        reply: oneshot::Sender<Vec<WorkflowTemplate>>,
    },
    RemoveTemplate {
        id: String,
        reply: oneshot::Sender<Option<WorkflowTemplate>>,
    },
    PutRegex {
        entry: RegexEntry,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    PutLookup {
        entry: LookupEntry,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    RemoveRegex {
        id: String,
        reply: oneshot::Sender<Option<RegexEntry>>,
    },
    RemoveLookup {
        id: String,
        reply: oneshot::Sender<Option<LookupEntry>>,
    },
    Registry {
        reply: oneshot::Sender<RuleRegistry>,
    },
    Instantiate {
        template_id: String,
        payload: Payload,
        reply: oneshot::Sender<Result<WorkflowInstance, EngineError>>,
    },
    Trigger {
        template_id: String,
        payload: Payload,
        require: Vec<String>,
        reply: oneshot::Sender<Result<WorkflowInstance, EngineError>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<Result<WorkflowInstance, EngineError>>,
    },
    Get {
        id: Uuid,
        reply: oneshot::Sender<Option<InstanceRecord>>,
    },
    List {
        reply: oneshot::Sender<Vec<WorkflowInstance>>,
    },
    Watch {
        id: Uuid,
        reply: oneshot::Sender<Option<WorkflowInstance>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Effect {
    Emit {
        topic: String,
        payload: Payload,
        /// Publish task waiting on the outcome
        completion: Option<(Uuid, String)>,
    },
    Record(Box<InstanceRecord>),
    Notify {
        waiter: oneshot::Sender<Option<WorkflowInstance>>,
        instance: WorkflowInstance,
    },
    Sync(oneshot::Sender<()>),
}

struct Completion {
    instance: Uuid,
    task: String,
    result: Result<(), TaskError>,
}

enum Step {
    Start { instance: Uuid, task: String },
    Complete {
        instance: Uuid,
        task: String,
        result: Result<(), TaskError>,
    },
    Skip { instance: Uuid, task: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    SleepDone,
    JoinTimeout,
    NestedTimeout,
}

struct Timer {
    instance: Uuid,
    task: String,
    kind: TimerKind,
}

type TimerKey = (Instant, u64);

struct ActiveInstance {
    instance: WorkflowInstance,
    template: Arc<CompiledTemplate>,
    executions: HashMap<String, TaskExecution>,
    started: HashMap<String, Instant>,
    timers: HashMap<String, TimerKey>,
    waiters: Vec<oneshot::Sender<Option<WorkflowInstance>>>,
}

impl ActiveInstance {
    fn new(instance: WorkflowInstance, template: Arc<CompiledTemplate>) -> Self {
        Self {
            instance,
            template,
            executions: HashMap::new(),
            started: HashMap::new(),
            timers: HashMap::new(),
            waiters: Vec::new(),
        }
    }

    fn state_of(&self, task: &str) -> Option<TaskState> {
        self.executions.get(task).map(|e| e.state)
    }

    fn record(&self) -> InstanceRecord {
        let executions = self
            .template
            .order
            .iter()
            .filter_map(|task| self.executions.get(task).cloned())
            .collect();
        InstanceRecord::full(self.instance.clone(), &self.template.template, executions)
    }
}

fn state_payload(instance: &WorkflowInstance) -> Payload {
    payload_from_value(json!({
        "type": "instance",
        "state": instance.state,
        "template": instance.template_id,
        "instance_id": instance.id.to_string(),
        "title": instance.title,
        "root": instance.root,
        "start": instance.start.to_rfc3339(),
        "end": instance.end.map(|end| end.to_rfc3339()),
    }))
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to the scheduler actor
#[derive(Clone)]
pub struct WorkflowEngine {
    commands: mpsc::Sender<Command>,
    history: Arc<dyn HistoryStore>,
}

impl WorkflowEngine {
    /// Start the scheduler and its effects worker
    ///
    /// `rulers` are the named rulers factory tasks may reference. Without a
    /// sink, state changes are not published and publish tasks fail.
    pub fn spawn(
        rulers: HashMap<String, RulerConfig>,
        sink: Option<Arc<dyn EventSink>>,
        history: Arc<dyn HistoryStore>,
    ) -> (Self, JoinHandle<()>) {
        Self::spawn_with_registry(rulers, RuleRegistry::new(), sink, history)
    }

    /// Start the scheduler with regexes and lookups factory rules may name
    pub fn spawn_with_registry(
        rulers: HashMap<String, RulerConfig>,
        registry: RuleRegistry,
        sink: Option<Arc<dyn EventSink>>,
        history: Arc<dyn HistoryStore>,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (effects_tx, effects_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_effects(
            effects_rx,
            sink,
            history.clone(),
            completions_tx,
        ));

        let scheduler = Scheduler {
            rulers,
            registry,
            templates: HashMap::new(),
            nested: HashMap::new(),
            instances: HashMap::new(),
            timers: BTreeMap::new(),
            next_timer: 0,
            work: VecDeque::new(),
            dirty: BTreeSet::new(),
            effects: effects_tx,
        };
        let handle = tokio::spawn(scheduler.run(commands_rx, completions_rx));

        (
            Self {
                commands: commands_tx,
                history,
            },
            handle,
        )
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Validate and register a template; ids are unique
    pub async fn register_template(&self, template: WorkflowTemplate) -> Result<(), EngineError> {
        self.request(|reply| Command::RegisterTemplate {
            template,
            replace: false,
            reply,
        })
        .await?
        .map(|_| ())
    }

    /// Register a template or replace the one with the same id
    ///
    /// A replacement gets a version above the one it replaces. Running
    /// instances keep the template they started with.
    pub async fn put_template(
        &self,
        template: WorkflowTemplate,
    ) -> Result<WorkflowTemplate, EngineError> {
        self.request(|reply| Command::RegisterTemplate {
            template,
            replace: true,
            reply,
        })
        .await?
    }

    /// Registered templates sorted by id
    pub async fn templates(&self) -> Result<Vec<WorkflowTemplate>, EngineError> {
        self.request(|reply| Command::Templates { reply }).await
    }

    pub async fn template(&self, id: &str) -> Result<Option<WorkflowTemplate>, EngineError> {
        Ok(self.templates().await?.into_iter().find(|t| t.id == id))
    }

    pub async fn remove_template(&self, id: &str) -> Result<Option<WorkflowTemplate>, EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::RemoveTemplate { id, reply }).await
    }

    pub async fn put_regex(&self, entry: RegexEntry) -> Result<(), EngineError> {
        self.request(|reply| Command::PutRegex { entry, reply }).await?
    }

    pub async fn put_lookup(&self, entry: LookupEntry) -> Result<(), EngineError> {
        self.request(|reply| Command::PutLookup { entry, reply }).await?
    }

    pub async fn remove_regex(&self, id: &str) -> Result<Option<RegexEntry>, EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::RemoveRegex { id, reply }).await
    }

    pub async fn remove_lookup(&self, id: &str) -> Result<Option<LookupEntry>, EngineError> {
        let id = id.to_string();
        self.request(|reply| Command::RemoveLookup { id, reply }).await
    }

    /// Snapshot of the registered regexes and lookups
    pub async fn registry(&self) -> Result<RuleRegistry, EngineError> {
        self.request(|reply| Command::Registry { reply }).await
    }

    /// Create a running instance; returns it as created
    pub async fn instantiate(
        &self,
        template_id: &str,
        payload: Payload,
    ) -> Result<WorkflowInstance, EngineError> {
        let template_id = template_id.to_string();
        self.request(|reply| Command::Instantiate {
            template_id,
            payload,
            reply,
        })
        .await?
    }

    /// Instantiate from a bus event
    ///
    /// When a `require` field is absent or null the instance is recorded as
    /// skipped and no task runs.
    pub async fn trigger(
        &self,
        template_id: &str,
        payload: Payload,
        require: &[String],
    ) -> Result<WorkflowInstance, EngineError> {
        let template_id = template_id.to_string();
        let require = require.to_vec();
        self.request(|reply| Command::Trigger {
            template_id,
            payload,
            require,
            reply,
        })
        .await?
    }

    pub async fn cancel(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        match self.request(|reply| Command::Cancel { id, reply }).await? {
            Err(EngineError::UnknownInstance(id)) => {
                if self.from_history(id, false).await?.is_some() {
                    Err(EngineError::AlreadyTerminal(id))
                } else {
                    Err(EngineError::UnknownInstance(id))
                }
            }
            other => other,
        }
    }

    /// Full record of an instance, live or from history
    pub async fn get(&self, id: Uuid) -> Result<Option<InstanceRecord>, EngineError> {
        if let Some(record) = self.request(|reply| Command::Get { id, reply }).await? {
            return Ok(Some(record));
        }
        self.from_history(id, true).await
    }

    /// Retired instances are only in history once pending writes land
    async fn from_history(&self, id: Uuid, full: bool) -> Result<Option<InstanceRecord>, EngineError> {
        self.flush().await?;
        Ok(self.history.get_one(id, full).await?)
    }

    /// Instances not yet terminal, oldest first
    pub async fn active(&self) -> Result<Vec<WorkflowInstance>, EngineError> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Resolve once the instance reaches a terminal state
    pub async fn await_terminal(&self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        match self.request(|reply| Command::Watch { id, reply }).await? {
            Some(instance) => Ok(instance),
            None => self
                .from_history(id, false)
                .await?
                .map(|record| record.instance)
                .ok_or(EngineError::UnknownInstance(id)),
        }
    }

    /// Wait until every emission and history write issued so far is done
    pub async fn flush(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Stop the scheduler after pending effects are drained
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

async fn run_effects(
    mut effects: mpsc::UnboundedReceiver<Effect>,
    sink: Option<Arc<dyn EventSink>>,
    history: Arc<dyn HistoryStore>,
    completions: mpsc::UnboundedSender<Completion>,
) {
    while let Some(effect) = effects.recv().await {
        match effect {
            Effect::Emit {
                topic,
                payload,
                completion,
            } => {
                let result = match &sink {
                    Some(sink) => sink.emit(&topic, payload).await,
                    None if completion.is_none() => continue,
                    None => Err("No event sink attached".to_string()),
                };
                match completion {
                    Some((instance, task)) => {
                        let _ = completions.send(Completion {
                            instance,
                            task,
                            result: result.map_err(TaskError::Execution),
                        });
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(topic = %topic, error = %e, "Failed to emit workflow event");
                        }
                    }
                }
            }
            Effect::Record(record) => {
                match timeout(HISTORY_WRITE_TIMEOUT, history.upsert(&record)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        instance_id = %record.instance.id,
                        error = %e,
                        "History write failed"
                    ),
                    Err(_) => warn!(
                        instance_id = %record.instance.id,
                        timeout_secs = HISTORY_WRITE_TIMEOUT.as_secs(),
                        "History write timed out"
                    ),
                }
            }
            Effect::Notify { waiter, instance } => {
                let _ = waiter.send(Some(instance));
            }
            Effect::Sync(reply) => {
                let _ = reply.send(());
            }
        }
    }
    debug!("Workflow effects worker stopped");
}

struct Scheduler {
    rulers: HashMap<String, RulerConfig>,
    registry: RuleRegistry,
    templates: HashMap<String, Arc<CompiledTemplate>>,
    /// Awaited nested instance -> (parent instance, trigger_workflow task)
    nested: HashMap<Uuid, (Uuid, String)>,
    instances: HashMap<Uuid, ActiveInstance>,
    timers: BTreeMap<TimerKey, Timer>,
    next_timer: u64,
    work: VecDeque<Step>,
    /// Instances whose record changed since the last history write
    dirty: BTreeSet<Uuid>,
    effects: mpsc::UnboundedSender<Effect>,
}

impl Scheduler {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!("Workflow engine started");
        loop {
            let deadline = self.timers.keys().next().map(|(at, _)| *at);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                Some(completion) = completions.recv() => {
                    self.work.push_back(Step::Complete {
                        instance: completion.instance,
                        task: completion.task,
                        result: completion.result,
                    });
                    self.run_queue();
                }
                _ = wait_until(deadline) => self.fire_timers(Instant::now()),
            }
        }
        info!(active = self.instances.len(), "Workflow engine stopped");
    }

    fn effect(&self, effect: Effect) -> bool {
        self.effects.send(effect).is_ok()
    }

    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::RegisterTemplate {
                template,
                replace,
                reply,
            } => {
                let _ = reply.send(self.register(template, replace));
            }
            Command::Templates { reply } => {
                let mut templates: Vec<WorkflowTemplate> = self
                    .templates
                    .values()
                    .map(|compiled| compiled.template.clone())
                    .collect();
                templates.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(templates);
            }
            Command::RemoveTemplate { id, reply } => {
                let removed = self.templates.remove(&id).map(|compiled| {
                    info!(template = %id, "Removed workflow template");
                    compiled.template.clone()
                });
                let _ = reply.send(removed);
            }
            Command::PutRegex { entry, reply } => {
                let _ = reply.send(self.registry.put_regex(entry).map(|_| ()).map_err(Into::into));
            }
            Command::PutLookup { entry, reply } => {
                let _ = reply.send(self.registry.put_lookup(entry).map(|_| ()).map_err(Into::into));
            }
            Command::RemoveRegex { id, reply } => {
                let _ = reply.send(self.registry.remove_regex(&id));
            }
            Command::RemoveLookup { id, reply } => {
                let _ = reply.send(self.registry.remove_lookup(&id));
            }
            Command::Registry { reply } => {
                let _ = reply.send(self.registry.clone());
            }
            Command::Instantiate {
                template_id,
                payload,
                reply,
            } => {
                let result = self.instantiate(&template_id, payload, &[], false);
                self.run_queue();
                let _ = reply.send(result);
            }
            Command::Trigger {
                template_id,
                payload,
                require,
                reply,
            } => {
                let result = self.instantiate(&template_id, payload, &require, false);
                self.run_queue();
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => {
                let result = self.cancel(id);
                self.run_queue();
                let _ = reply.send(result);
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.instances.get(&id).map(ActiveInstance::record));
            }
            Command::List { reply } => {
                let mut active: Vec<WorkflowInstance> = self
                    .instances
                    .values()
                    .map(|a| a.instance.clone())
                    .collect();
                active.sort_by_key(|instance| instance.start);
                let _ = reply.send(active);
            }
            Command::Watch { id, reply } => match self.instances.get_mut(&id) {
                Some(active) => active.waiters.push(reply),
                None => {
                    let _ = reply.send(None);
                }
            },
            Command::Flush { reply } => {
                self.effect(Effect::Sync(reply));
            }
            Command::Shutdown { reply } => {
                self.effect(Effect::Sync(reply));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn register(
        &mut self,
        mut template: WorkflowTemplate,
        replace: bool,
    ) -> Result<WorkflowTemplate, EngineError> {
        if let Some(existing) = self.templates.get(&template.id) {
            if !replace {
                return Err(WorkflowValidationError::DuplicateTemplate(template.id).into());
            }
            template.version = template.version.max(existing.template.version + 1);
        }
        let compiled = template.compile_with(&self.rulers, &self.registry)?;
        info!(
            template = %template.id,
            version = template.version,
            tasks = compiled.order.len(),
            triggers = template.triggers.len(),
            "Registered workflow template"
        );
        self.templates.insert(template.id.clone(), Arc::new(compiled));
        Ok(template)
    }

    /// Nested instances are never root, whatever their template says
    fn instantiate(
        &mut self,
        template_id: &str,
        payload: Payload,
        require: &[String],
        nested: bool,
    ) -> Result<WorkflowInstance, EngineError> {
        let template = self
            .templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTemplate(template_id.to_string()))?;
        let title = if template.template.title.is_empty() {
            template_id
        } else {
            &template.template.title
        };
        let root = template.template.root && !nested;
        let mut instance = WorkflowInstance::new(template_id, title, root, payload);

        let missing: Vec<&String> = require
            .iter()
            .filter(|field| instance.payload.get(*field).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            info!(
                instance_id = %instance.id,
                template = template_id,
                missing = ?missing,
                "Trigger requirements not met, skipping instance"
            );
            instance.transition(InstanceState::Skipped);
            metrics().instance_skipped();
            self.emit_state(&instance);
            let record = InstanceRecord::full(instance.clone(), &template.template, Vec::new());
            self.effect(Effect::Record(Box::new(record)));
            return Ok(instance);
        }

        metrics().instance_started();
        self.emit_state(&instance);
        instance.transition(InstanceState::Running);
        self.emit_state(&instance);

        let id = instance.id;
        info!(instance_id = %id, template = template_id, root, "Workflow instance started");
        for root in template.roots() {
            self.work.push_back(Step::Start {
                instance: id,
                task: root.to_string(),
            });
        }
        self.instances
            .insert(id, ActiveInstance::new(instance.clone(), template));
        self.dirty.insert(id);
        Ok(instance)
    }

    fn cancel(&mut self, id: Uuid) -> Result<WorkflowInstance, EngineError> {
        let active = self
            .instances
            .get_mut(&id)
            .ok_or(EngineError::UnknownInstance(id))?;
        let template = active.template.clone();
        for task in &template.order {
            let skipped = match active.executions.get_mut(task) {
                Some(execution) => execution.skip(),
                None => {
                    if let Some(spec) = template.specs.get(task) {
                        active
                            .executions
                            .insert(task.clone(), TaskExecution::skipped(id, task, spec.kind()));
                    }
                    true
                }
            };
            if skipped {
                if let Some(spec) = template.specs.get(task) {
                    metrics().task_finished(spec.kind().as_str(), TaskOutcome::Skipped, Duration::ZERO);
                }
            }
        }
        info!(instance_id = %id, "Cancelling workflow instance");
        let awaited: Vec<Uuid> = self
            .nested
            .iter()
            .filter(|(_, (parent, _))| *parent == id)
            .map(|(child, _)| *child)
            .collect();
        for child in awaited {
            self.nested.remove(&child);
            let _ = self.cancel(child);
        }
        self.finalize(id, InstanceState::Cancelled)
            .ok_or(EngineError::UnknownInstance(id))
    }

    fn emit_state(&self, instance: &WorkflowInstance) {
        self.effect(Effect::Emit {
            topic: instance_topic(instance.id),
            payload: state_payload(instance),
            completion: None,
        });
    }

    fn schedule(&mut self, id: Uuid, task: &str, after: Duration, kind: TimerKind) {
        let key = (Instant::now() + after, self.next_timer);
        self.next_timer += 1;
        self.timers.insert(
            key,
            Timer {
                instance: id,
                task: task.to_string(),
                kind,
            },
        );
        if let Some(active) = self.instances.get_mut(&id) {
            active.timers.insert(task.to_string(), key);
        }
    }

    fn fire_timers(&mut self, now: Instant) {
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timer = entry.remove();
            let Some(active) = self.instances.get_mut(&timer.instance) else {
                continue;
            };
            active.timers.remove(&timer.task);

            let result = match timer.kind {
                TimerKind::SleepDone => Ok(()),
                TimerKind::JoinTimeout => {
                    let Some(TaskSpec::Join { wait_for, timeout: limit }) =
                        active.template.specs.get(&timer.task)
                    else {
                        continue;
                    };
                    let pending: Vec<String> = wait_for
                        .iter()
                        .filter(|w| !active.state_of(w).is_some_and(|s| s.is_terminal()))
                        .cloned()
                        .collect();
                    Err(TaskError::Timeout {
                        seconds: limit.as_secs(),
                        pending,
                    })
                }
                TimerKind::NestedTimeout => {
                    let Some(TaskSpec::TriggerWorkflow { timeout: limit, .. }) =
                        active.template.specs.get(&timer.task)
                    else {
                        continue;
                    };
                    let seconds = limit.as_secs();
                    let link = (timer.instance, timer.task.clone());
                    let pending: Vec<String> = self
                        .nested
                        .iter()
                        .filter(|(_, waiting)| **waiting == link)
                        .map(|(child, _)| child.to_string())
                        .collect();
                    self.nested.retain(|_, waiting| *waiting != link);
                    Err(TaskError::Timeout { seconds, pending })
                }
            };
            self.work.push_back(Step::Complete {
                instance: timer.instance,
                task: timer.task,
                result,
            });
        }
        self.run_queue();
    }

    fn run_queue(&mut self) {
        while let Some(step) = self.work.pop_front() {
            match step {
                Step::Start { instance, task } => self.start_task(instance, task),
                Step::Complete {
                    instance,
                    task,
                    result,
                } => self.complete_task(instance, task, result),
                Step::Skip { instance, task } => self.skip_task(instance, task),
            }
        }

        let dirty = std::mem::take(&mut self.dirty);
        for id in dirty {
            if let Some(active) = self.instances.get(&id) {
                self.effect(Effect::Record(Box::new(active.record())));
            }
        }
    }

    fn start_task(&mut self, id: Uuid, task: String) {
        let Some(active) = self.instances.get_mut(&id) else {
            return;
        };
        if active.executions.contains_key(&task) {
            return;
        }
        let template = active.template.clone();
        let Some(spec) = template.specs.get(&task) else {
            return;
        };

        let _span = crate::workflow_span!(instance_id = %id, task = %task, task_type = %spec.kind())
            .entered();
        debug!("Starting task");
        active
            .executions
            .insert(task.clone(), TaskExecution::running(id, &task, spec.kind()));
        active.started.insert(task.clone(), Instant::now());
        let payload = matches!(spec, TaskSpec::Publish { .. } | TaskSpec::TriggerWorkflow { .. })
            .then(|| active.instance.payload.clone())
            .unwrap_or_default();
        self.dirty.insert(id);

        match spec {
            TaskSpec::Sleep(duration) => self.schedule(id, &task, *duration, TimerKind::SleepDone),
            TaskSpec::Join { timeout: limit, .. } => {
                self.schedule(id, &task, *limit, TimerKind::JoinTimeout);
                self.evaluate_join(id, &task);
            }
            TaskSpec::Factory(converter) => {
                let result = match self.instances.get_mut(&id) {
                    Some(active) => run_factory(converter, &mut active.instance.payload),
                    None => return,
                };
                self.work.push_back(Step::Complete {
                    instance: id,
                    task,
                    result,
                });
            }
            TaskSpec::Publish { topic } => {
                let sent = self.effect(Effect::Emit {
                    topic: topic.clone(),
                    payload,
                    completion: Some((id, task.clone())),
                });
                if !sent {
                    self.work.push_back(Step::Complete {
                        instance: id,
                        task,
                        result: Err(TaskError::Execution("Effects worker stopped".to_string())),
                    });
                }
            }
            TaskSpec::TriggerWorkflow {
                template: nested,
                await_completion,
                timeout: limit,
            } => {
                let result = match self.instantiate(nested, payload, &[], true) {
                    Err(e) => Err(TaskError::Execution(e.to_string())),
                    Ok(child) if *await_completion => {
                        debug!(nested_id = %child.id, "Waiting for nested workflow");
                        self.nested.insert(child.id, (id, task.clone()));
                        self.schedule(id, &task, *limit, TimerKind::NestedTimeout);
                        return;
                    }
                    Ok(child) => {
                        debug!(nested_id = %child.id, "Nested workflow started");
                        Ok(())
                    }
                };
                self.work.push_back(Step::Complete {
                    instance: id,
                    task,
                    result,
                });
            }
        }
    }

    fn complete_task(&mut self, id: Uuid, task: String, result: Result<(), TaskError>) {
        let Some(active) = self.instances.get_mut(&id) else {
            return;
        };
        let Some(execution) = active.executions.get_mut(&task) else {
            return;
        };
        if !execution.finish(result) {
            return;
        }
        let state = execution.state;
        let kind = execution.task_type;
        let error = execution.error.clone();
        let duration = active
            .started
            .remove(&task)
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let timer = active.timers.remove(&task);
        if let Some(key) = timer {
            self.timers.remove(&key);
        }

        let outcome = if state == TaskState::Failed {
            warn!(
                instance_id = %id,
                task = %task,
                task_type = %kind,
                error = error.as_deref().unwrap_or_default(),
                "Task failed"
            );
            TaskOutcome::Failed
        } else {
            debug!(instance_id = %id, task = %task, task_type = %kind, "Task done");
            TaskOutcome::Done
        };
        metrics().task_finished(kind.as_str(), outcome, duration);

        self.dirty.insert(id);
        self.after_terminal(id, &task);
    }

    /// Only tasks that never started are skipped this way
    fn skip_task(&mut self, id: Uuid, task: String) {
        let Some(active) = self.instances.get_mut(&id) else {
            return;
        };
        if active.executions.contains_key(&task) {
            return;
        }
        let Some(kind) = active.template.specs.get(&task).map(TaskSpec::kind) else {
            return;
        };
        debug!(instance_id = %id, task = %task, "Task skipped");
        active
            .executions
            .insert(task.clone(), TaskExecution::skipped(id, &task, kind));
        metrics().task_finished(kind.as_str(), TaskOutcome::Skipped, Duration::ZERO);

        self.dirty.insert(id);
        self.after_terminal(id, &task);
    }

    /// Propagate a task reaching a terminal state to joins and children
    fn after_terminal(&mut self, id: Uuid, task: &str) {
        let Some(active) = self.instances.get(&id) else {
            return;
        };
        let template = active.template.clone();
        let Some(finished) = active.state_of(task) else {
            return;
        };
        let failed_join = finished == TaskState::Failed
            && template.specs.get(task).is_some_and(TaskSpec::is_join);

        let joins: Vec<String> = template
            .joins_waiting_for(task)
            .filter(|join| active.state_of(join) == Some(TaskState::Running))
            .map(str::to_string)
            .collect();

        let mut steps = Vec::new();
        for child in template.children_of(task) {
            if active.executions.contains_key(child) {
                continue;
            }
            if failed_join {
                steps.push(Step::Skip {
                    instance: id,
                    task: child.clone(),
                });
                continue;
            }

            let parents: Vec<Option<TaskState>> = template
                .parents_of(child)
                .iter()
                .map(|parent| active.state_of(parent))
                .collect();
            let all_terminal = parents.iter().all(|s| s.is_some_and(|s| s.is_terminal()));
            let all_skipped = parents.iter().all(|s| *s == Some(TaskState::Skipped));
            let child_is_join = template.specs.get(child).is_some_and(TaskSpec::is_join);

            let step = if all_skipped {
                Some(Step::Skip {
                    instance: id,
                    task: child.clone(),
                })
            } else if (child_is_join && finished != TaskState::Skipped) || all_terminal {
                Some(Step::Start {
                    instance: id,
                    task: child.clone(),
                })
            } else {
                None
            };
            steps.extend(step);
        }

        for join in joins {
            self.evaluate_join(id, &join);
        }
        self.work.extend(steps);
        self.check_complete(id);
    }

    fn evaluate_join(&mut self, id: Uuid, join: &str) {
        let Some(active) = self.instances.get(&id) else {
            return;
        };
        if active.state_of(join) != Some(TaskState::Running) {
            return;
        }
        let Some(TaskSpec::Join { wait_for, .. }) = active.template.specs.get(join) else {
            return;
        };

        let mut all_terminal = true;
        for waited in wait_for {
            match active.state_of(waited) {
                Some(TaskState::Failed) => {
                    self.work.push_back(Step::Complete {
                        instance: id,
                        task: join.to_string(),
                        result: Err(TaskError::Upstream(waited.clone())),
                    });
                    return;
                }
                Some(state) if state.is_terminal() => {}
                _ => all_terminal = false,
            }
        }
        if all_terminal {
            self.work.push_back(Step::Complete {
                instance: id,
                task: join.to_string(),
                result: Ok(()),
            });
        }
    }

    fn check_complete(&mut self, id: Uuid) {
        let Some(active) = self.instances.get(&id) else {
            return;
        };
        let mut failed = false;
        for task in &active.template.order {
            match active.state_of(task) {
                Some(TaskState::Failed) => failed = true,
                Some(state) if state.is_terminal() => {}
                _ => return,
            }
        }
        let state = if failed {
            InstanceState::Exception
        } else {
            InstanceState::Finished
        };
        self.finalize(id, state);
    }

    /// Move an instance to a terminal state and retire it
    fn finalize(&mut self, id: Uuid, state: InstanceState) -> Option<WorkflowInstance> {
        let mut active = self.instances.remove(&id)?;
        for key in active.timers.values() {
            self.timers.remove(key);
        }
        self.dirty.remove(&id);
        active.instance.transition(state);

        match state {
            InstanceState::Finished => metrics().instance_finished(),
            InstanceState::Exception => metrics().instance_failed(),
            InstanceState::Cancelled => metrics().instance_cancelled(),
            _ => {}
        }
        info!(
            instance_id = %id,
            template = %active.instance.template_id,
            state = %state,
            duration_ms = active.instance.duration_ms().unwrap_or_default(),
            "Workflow instance ended"
        );

        self.emit_state(&active.instance);
        self.effect(Effect::Record(Box::new(active.record())));
        for waiter in active.waiters.drain(..) {
            self.effect(Effect::Notify {
                waiter,
                instance: active.instance.clone(),
            });
        }

        if let Some((parent, task)) = self.nested.remove(&id) {
            let result = match state {
                InstanceState::Finished => Ok(()),
                other => Err(TaskError::Execution(format!(
                    "Nested workflow {id} ended {other}"
                ))),
            };
            self.work.push_back(Step::Complete {
                instance: parent,
                task,
                result,
            });
        }
        self.nested.retain(|_, (parent, _)| *parent != id);
        Some(active.instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;
    use crate::testing::FailingHistoryStore;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, Payload)>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&self, topic: &str, payload: Payload) -> Result<(), String> {
            self.events.lock().await.push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn template(value: Value) -> WorkflowTemplate {
        serde_json::from_value(value).unwrap()
    }

    fn spawn_engine() -> (WorkflowEngine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let (engine, _) = WorkflowEngine::spawn(
            HashMap::new(),
            Some(sink.clone()),
            Arc::new(MemoryHistoryStore::new()),
        );
        (engine, sink)
    }

    fn task_state(record: &InstanceRecord, task: &str) -> TaskState {
        record
            .executions
            .as_ref()
            .and_then(|executions| executions.iter().find(|e| e.task_id == task))
            .map(|e| e.state)
            .unwrap_or_else(|| panic!("no execution for {task}"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_chain_finishes() {
        let (engine, _) = spawn_engine();
        engine
            .register_template(template(json!({
                "id": "chain",
                "tasks": [
                    {"id": "a", "type": "sleep", "config": {"time": 1}},
                    {"id": "b", "type": "sleep", "config": {"time": 1}}
                ],
                "edges": [{"from": "a", "to": "b"}]
            })))
            .await
            .unwrap();

        let started = Instant::now();
        let instance = engine.instantiate("chain", Payload::new()).await.unwrap();
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.title, "chain");

        let done = engine.await_terminal(instance.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Finished);
        assert!(done.end.is_some());
        assert!(started.elapsed() >= Duration::from_secs(2));

        let record = engine.get(instance.id).await.unwrap().unwrap();
        assert_eq!(task_state(&record, "a"), TaskState::Done);
        assert_eq!(task_state(&record, "b"), TaskState::Done);
        assert!(engine.active().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_times_out_and_skips_children() {
        let (engine, _) = spawn_engine();
        engine
            .register_template(template(json!({
                "id": "join",
                "tasks": [
                    {"id": "a", "type": "sleep", "config": {"time": 1}},
                    {"id": "b", "type": "sleep", "config": {"time": 100000}},
                    {"id": "j", "type": "join", "config": {"wait_for": ["a", "b"], "timeout": 60}},
                    {"id": "c", "type": "sleep", "config": {"time": 1}},
                    {"id": "d", "type": "sleep", "config": {"time": 1}}
                ],
                "edges": [
                    {"from": "a", "to": "j"},
                    {"from": "b", "to": "j"},
                    {"from": "j", "to": "c"},
                    {"from": "c", "to": "d"}
                ]
            })))
            .await
            .unwrap();

        let instance = engine.instantiate("join", Payload::new()).await.unwrap();

        // join starts at t=1s when `a` finishes, timeout fires at t=61s
        tokio::time::sleep(Duration::from_millis(60_500)).await;
        let record = engine.get(instance.id).await.unwrap().unwrap();
        assert_eq!(task_state(&record, "j"), TaskState::Running);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let record = engine.get(instance.id).await.unwrap().unwrap();
        assert_eq!(task_state(&record, "j"), TaskState::Failed);
        assert_eq!(task_state(&record, "c"), TaskState::Skipped);
        assert_eq!(task_state(&record, "d"), TaskState::Skipped);
        assert_eq!(task_state(&record, "b"), TaskState::Running);
        let join = record
            .executions
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.task_id == "j")
            .unwrap();
        assert_eq!(
            join.error.as_deref(),
            Some("Timed out after 60s waiting for [\"b\"]")
        );
        assert_eq!(record.instance.state, InstanceState::Running);

        let done = engine.await_terminal(instance.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Exception);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_completes_when_waited_tasks_done() {
        let (engine, _) = spawn_engine();
        engine
            .register_template(template(json!({
                "id": "diamond",
                "tasks": [
                    {"id": "a", "type": "sleep", "config": {"time": 1}},
                    {"id": "b", "type": "sleep", "config": {"time": 5}},
                    {"id": "j", "type": "join", "config": {"wait_for": ["a", "b"], "timeout": 60}},
                    {"id": "c", "type": "sleep", "config": {"time": 1}}
                ],
                "edges": [
                    {"from": "a", "to": "j"},
                    {"from": "b", "to": "j"},
                    {"from": "j", "to": "c"}
                ]
            })))
            .await
            .unwrap();

        let started = Instant::now();
        let instance = engine.instantiate("diamond", Payload::new()).await.unwrap();
        let done = engine.await_terminal(instance.id).await.unwrap();

        assert_eq!(done.state, InstanceState::Finished);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_upstream_failure_fails_join() {
        let (engine, _) = spawn_engine();
        engine
            .register_template(template(json!({
                "id": "fail",
                "tasks": [
                    {"id": "f", "type": "factory", "config": {"rulers": [
                        {"type": "r", "rules": [{"type": "upper", "fieldname": "missing"}]}
                    ]}},
                    {"id": "j", "type": "join", "config": {"wait_for": ["f"]}},
                    {"id": "after", "type": "factory", "config": {"rulers": []}}
                ],
                "edges": [{"from": "f", "to": "j"}, {"from": "j", "to": "after"}]
            })))
            .await
            .unwrap();

        let instance = engine.instantiate("fail", Payload::new()).await.unwrap();
        let done = engine.await_terminal(instance.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Exception);

        let record = engine.get(instance.id).await.unwrap().unwrap();
        assert_eq!(task_state(&record, "f"), TaskState::Failed);
        assert_eq!(task_state(&record, "j"), TaskState::Failed);
        assert_eq!(task_state(&record, "after"), TaskState::Skipped);
    }

    #[tokio::test]
    async fn test_failed_parent_does_not_block_plain_child() {
        let (engine, _) = spawn_engine();
        engine
            .register_template(template(json!({
                "id": "continue",
                "tasks": [
                    {"id": "f", "type": "factory", "config": {"rulers": [
                        {"type": "r", "rules": [{"type": "lower", "fieldname": "missing"}]}
                    ]}},
                    {"id": "g", "type": "factory", "config": {"rulers": [
                        {"type": "r", "rules": [{"type": "set", "fieldname": "ran", "value": true}]}
                    ]}}
                ],
                "edges": [{"from": "f", "to": "g"}]
            })))
            .await
            .unwrap();

        let instance = engine.instantiate("continue", Payload::new()).await.unwrap();
        let done = engine.await_terminal(instance.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Exception);
        assert_eq!(done.payload["ran"], true);
    }

    #[tokio::test]
    async fn test_factory_then_publish_emits_payload() {
        let (engine, sink) = spawn_engine();
        engine
            .register_template(template(json!({
                "id": "pipeline",
                "title": "Pipeline",
                "root": true,
                "tasks": [
                    {"id": "normalize", "type": "factory", "config": {"rulers": [
                        {"type": "n", "rules": [{"type": "upper", "fieldname": "message"}]}
                    ]}},
                    {"id": "announce", "type": "publish", "config": {"topic": "announcements"}}
                ],
                "edges": [{"from": "normalize", "to": "announce"}]
            })))
            .await
            .unwrap();

        let payload = payload_from_value(json!({"message": "hi"}));
        let instance = engine.instantiate("pipeline", payload).await.unwrap();
        let done = engine.await_terminal(instance.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Finished);
        assert!(done.root);
        assert_eq!(done.payload["message"], "HI");
        engine.flush().await.unwrap();

        let events = sink.events.lock().await.clone();
        let announced: Vec<&Payload> = events
            .iter()
            .filter(|(topic, _)| topic == "announcements")
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0]["message"], "HI");

        let states: Vec<&str> = events
            .iter()
            .filter(|(topic, _)| *topic == instance_topic(instance.id))
            .filter_map(|(_, payload)| payload["state"].as_str())
            .collect();
        assert_eq!(states, vec!["pending", "running", "finished"]);
        let (_, last) = events.last().unwrap();
        assert_eq!(last["type"], "instance");
        assert_eq!(last["template"], "pipeline");
    }

    #[tokio::test]
    async fn test_publish_without_sink_fails_task() {
        let (engine, _) = WorkflowEngine::spawn(
            HashMap::new(),
            None,
            Arc::new(MemoryHistoryStore::new()),
        );
        engine
            .register_template(template(json!({
                "id": "p",
                "tasks": [{"id": "out", "type": "publish", "config": {"topic": "x"}}]
            })))
            .await
            .unwrap();

        let instance = engine.instantiate("p", Payload::new()).await.unwrap();
        let done = engine.await_terminal(instance.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Exception);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_skips_remaining_tasks() {
        let (engine, _) = spawn_engine();
        engine
            .register_template(template(json!({
                "id": "slow",
                "tasks": [
                    {"id": "a", "type": "sleep", "config": {"time": 100}},
                    {"id": "b", "type": "sleep"}
                ],
                "edges": [{"from": "a", "to": "b"}]
            })))
            .await
            .unwrap();

        let instance = engine.instantiate("slow", Payload::new()).await.unwrap();
        let cancelled = engine.cancel(instance.id).await.unwrap();
        assert_eq!(cancelled.state, InstanceState::Cancelled);
        assert!(cancelled.end.is_some());

        let record = engine.get(instance.id).await.unwrap().unwrap();
        assert_eq!(task_state(&record, "a"), TaskState::Skipped);
        assert_eq!(task_state(&record, "b"), TaskState::Skipped);

        assert!(matches!(
            engine.cancel(instance.id).await,
            Err(EngineError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            engine.cancel(Uuid::new_v4()).await,
            Err(EngineError::UnknownInstance(_))
        ));

        // the dropped sleep timer must not resurrect anything
        tokio::time::sleep(Duration::from_secs(200)).await;
        let record = engine.get(instance.id).await.unwrap().unwrap();
        assert_eq!(record.instance.state, InstanceState::Cancelled);
    }

    #[tokio::test]
    async fn test_trigger_missing_required_field_skips_instance() {
        let (engine, _) = spawn_engine();
        engine
            .register_template(template(json!({
                "id": "needs",
                "tasks": [{"id": "a", "type": "sleep"}]
            })))
            .await
            .unwrap();

        let require = vec!["message".to_string()];
        let skipped = engine
            .trigger("needs", payload_from_value(json!({"other": 1})), &require)
            .await
            .unwrap();
        assert_eq!(skipped.state, InstanceState::Skipped);
        assert!(skipped.end.is_some());

        let null_field = engine
            .trigger("needs", payload_from_value(json!({"message": null})), &require)
            .await
            .unwrap();
        assert_eq!(null_field.state, InstanceState::Skipped);

        engine.flush().await.unwrap();
        let record = engine.get(skipped.id).await.unwrap().unwrap();
        assert_eq!(record.instance.state, InstanceState::Skipped);
        assert_eq!(record.executions.as_deref(), Some(&[][..]));
    }

    #[tokio::test]
    async fn test_registration_errors() {
        let (engine, _) = spawn_engine();
        let wf = template(json!({"id": "wf", "tasks": [{"id": "a", "type": "sleep"}]}));
        engine.register_template(wf.clone()).await.unwrap();

        assert!(matches!(
            engine.register_template(wf).await,
            Err(EngineError::Validation(WorkflowValidationError::DuplicateTemplate(_)))
        ));
        assert!(matches!(
            engine.instantiate("nope", Payload::new()).await,
            Err(EngineError::UnknownTemplate(_))
        ));
        assert_eq!(engine.templates().await.unwrap().len(), 1);
    }

    async fn register_nested(engine: &WorkflowEngine, child_tasks: Value, await_completion: bool) {
        engine
            .register_template(template(json!({
                "id": "child",
                "root": true,
                "tasks": child_tasks
            })))
            .await
            .unwrap();
        engine
            .register_template(template(json!({
                "id": "parent",
                "root": true,
                "tasks": [{"id": "spawn", "type": "trigger_workflow", "config": {
                    "template": "child",
                    "await_completion": await_completion,
                    "timeout": 10
                }}]
            })))
            .await
            .unwrap();
    }

    fn error_of(record: &InstanceRecord, task: &str) -> Option<String> {
        record
            .executions
            .as_ref()
            .and_then(|executions| executions.iter().find(|e| e.task_id == task))
            .and_then(|e| e.error.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_workflow_starts_nested_instance() {
        let (engine, _) = spawn_engine();
        register_nested(&engine, json!([{"id": "wait", "type": "sleep", "config": {"time": 30}}]), false)
            .await;

        let payload = payload_from_value(json!({"order": 7}));
        let parent = engine.instantiate("parent", payload).await.unwrap();
        assert!(parent.root);
        let done = engine.await_terminal(parent.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Finished);

        let active = engine.active().await.unwrap();
        assert_eq!(active.len(), 1);
        let child = &active[0];
        assert_eq!(child.template_id, "child");
        assert!(!child.root);
        assert_eq!(child.payload["order"], 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_workflow_waits_for_nested_instance() {
        let (engine, _) = spawn_engine();
        register_nested(&engine, json!([{"id": "wait", "type": "sleep", "config": {"time": 5}}]), true)
            .await;

        let started = Instant::now();
        let parent = engine.instantiate("parent", Payload::new()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let record = engine.get(parent.id).await.unwrap().unwrap();
        assert_eq!(task_state(&record, "spawn"), TaskState::Running);

        let done = engine.await_terminal(parent.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Finished);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(engine.active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nested_failure_fails_trigger_workflow_task() {
        let (engine, _) = spawn_engine();
        register_nested(
            &engine,
            json!([{"id": "f", "type": "factory", "config": {"rulers": [
                {"type": "r", "rules": [{"type": "upper", "fieldname": "missing"}]}
            ]}}]),
            true,
        )
        .await;

        let parent = engine.instantiate("parent", Payload::new()).await.unwrap();
        let done = engine.await_terminal(parent.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Exception);

        let record = engine.get(parent.id).await.unwrap().unwrap();
        assert_eq!(task_state(&record, "spawn"), TaskState::Failed);
        assert!(error_of(&record, "spawn").unwrap().contains("ended exception"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_timeout_fails_task_and_leaves_child_running() {
        let (engine, _) = spawn_engine();
        register_nested(&engine, json!([{"id": "wait", "type": "sleep", "config": {"time": 100}}]), true)
            .await;

        let parent = engine.instantiate("parent", Payload::new()).await.unwrap();
        let done = engine.await_terminal(parent.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Exception);

        let active = engine.active().await.unwrap();
        assert_eq!(active.len(), 1);
        let record = engine.get(parent.id).await.unwrap().unwrap();
        assert_eq!(
            error_of(&record, "spawn").as_deref(),
            Some(format!("Timed out after 10s waiting for [\"{}\"]", active[0].id).as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_parent_cancels_awaited_child() {
        let (engine, _) = spawn_engine();
        register_nested(&engine, json!([{"id": "wait", "type": "sleep", "config": {"time": 5}}]), true)
            .await;

        let parent = engine.instantiate("parent", Payload::new()).await.unwrap();
        let child = engine.active().await.unwrap().into_iter().find(|i| i.id != parent.id).unwrap();

        engine.cancel(parent.id).await.unwrap();
        let child = engine.await_terminal(child.id).await.unwrap();
        assert_eq!(child.state, InstanceState::Cancelled);
        assert!(engine.active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_nested_template_fails_task() {
        let (engine, _) = spawn_engine();
        engine
            .register_template(template(json!({
                "id": "orphan",
                "tasks": [{"id": "spawn", "type": "trigger_workflow", "config": {"template": "gone"}}]
            })))
            .await
            .unwrap();

        let instance = engine.instantiate("orphan", Payload::new()).await.unwrap();
        let done = engine.await_terminal(instance.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Exception);
        let record = engine.get(instance.id).await.unwrap().unwrap();
        assert!(error_of(&record, "spawn").unwrap().contains("gone"));
    }

    #[tokio::test]
    async fn test_put_template_replaces_with_higher_version() {
        let (engine, _) = spawn_engine();
        let wf = template(json!({"id": "wf", "tasks": [{"id": "a", "type": "sleep"}]}));
        assert_eq!(engine.put_template(wf.clone()).await.unwrap().version, 1);

        let replaced = engine.put_template(wf).await.unwrap();
        assert_eq!(replaced.version, 2);
        assert_eq!(engine.template("wf").await.unwrap().unwrap().version, 2);

        let removed = engine.remove_template("wf").await.unwrap();
        assert_eq!(removed.map(|t| t.version), Some(2));
        assert!(engine.template("wf").await.unwrap().is_none());
        assert!(engine.remove_template("wf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registry_entries_used_by_later_templates() {
        let (engine, _) = spawn_engine();
        let wf = template(json!({
            "id": "codes",
            "tasks": [{"id": "f", "type": "factory", "config": {"rulers": [
                {"type": "r", "rules": [
                    {"type": "lookup", "fieldname": "code", "lookup_id": "codes"}
                ]}
            ]}}]
        }));
        assert!(matches!(
            engine.register_template(wf.clone()).await,
            Err(EngineError::Validation(WorkflowValidationError::InvalidRules { .. }))
        ));

        engine
            .put_lookup(LookupEntry {
                id: "codes".to_string(),
                title: "Codes".to_string(),
                table: vec![crate::rules::LookupRow {
                    value: "a".to_string(),
                    replace: "alpha".to_string(),
                }],
            })
            .await
            .unwrap();
        engine.register_template(wf).await.unwrap();

        let payload = payload_from_value(json!({"code": "a"}));
        let instance = engine.instantiate("codes", payload).await.unwrap();
        let done = engine.await_terminal(instance.id).await.unwrap();
        assert_eq!(done.payload["code"], "alpha");

        assert!(matches!(
            engine
                .put_regex(RegexEntry {
                    id: "bad".to_string(),
                    title: String::new(),
                    pattern: "[".to_string(),
                })
                .await,
            Err(EngineError::Registry(_))
        ));
        assert_eq!(engine.registry().await.unwrap().lookups().len(), 1);
        assert!(engine.remove_lookup("codes").await.unwrap().is_some());
        assert!(engine.remove_regex("bad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_failure_does_not_stop_instances() {
        let (engine, _) = WorkflowEngine::spawn(
            HashMap::new(),
            None,
            Arc::new(FailingHistoryStore),
        );
        engine
            .register_template(template(json!({
                "id": "wf",
                "tasks": [{"id": "f", "type": "factory", "config": {"rulers": []}}]
            })))
            .await
            .unwrap();

        let instance = engine.instantiate("wf", Payload::new()).await.unwrap();
        let done = engine.await_terminal(instance.id).await.unwrap();
        assert_eq!(done.state, InstanceState::Finished);
    }

    #[tokio::test]
    async fn test_shutdown_stops_engine() {
        let (engine, handle) = WorkflowEngine::spawn(
            HashMap::new(),
            None,
            Arc::new(MemoryHistoryStore::new()),
        );
        engine.shutdown().await.unwrap();
        handle.await.unwrap();
        assert!(matches!(
            engine.instantiate("wf", Payload::new()).await,
            Err(EngineError::Stopped)
        ));
    }
}
