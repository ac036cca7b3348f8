//! Agent runtime lifecycle
//!
//! [`AgentRuntime`] is the explicit context object of one agent process: it
//! owns the bus, the workflow engine and the history store built from the
//! configuration, and hands them to each other at construction time.

use super::dispatch::{DispatchTable, TriggerHandler};
use crate::bus::{Bus, BusError};
use crate::config::{AgentConfig, BackendKind, ConfigError, TransportKind};
use crate::history::{HistoryError, HistoryServer, HistoryStore, MemoryHistoryStore};
use crate::persistence::{
    BusPersistence, DeliveryError, PersistenceBackend, PersistenceOptions, DEFAULT_SWEEP_INTERVAL,
};
use crate::transport::{MqttTransport, RoomHub, RoomTransport, Transport, TransportError};
use crate::workflow::{EngineError, EventSink, WorkflowEngine};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Subscriber id of the workflow trigger handlers
pub const TRIGGER_SUBSCRIBER: &str = "workflow-triggers";

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] DeliveryError),
    #[error("History error: {0}")]
    History(#[from] HistoryError),
    #[error("Workflow error: {0}")]
    Workflow(#[from] EngineError),
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),
    #[error("Feature '{0}' is not enabled in this build")]
    FeatureDisabled(&'static str),
    #[error("Agent already started")]
    AlreadyStarted,
}

/// Pick the transport named by the configuration
fn build_transport(config: &AgentConfig) -> Result<Arc<dyn Transport>, LifecycleError> {
    let name = &config.agent.name;
    let transport: Arc<dyn Transport> = match config.bus.transport {
        TransportKind::Mqtt => Arc::new(MqttTransport::new(name, config.bus.clone())?),
        TransportKind::Room => {
            info!(domain = %config.bus.muc_domain, "Using in-process room transport");
            Arc::new(RoomTransport::new(name, RoomHub::new(&config.bus.muc_domain)))
        }
    };
    Ok(transport)
}

fn persistence_options(config: &AgentConfig) -> PersistenceOptions {
    PersistenceOptions {
        memory_size: config.bus.persistence.memory_size,
        ttl_minutes: config.bus.persistence.ttl,
        ..PersistenceOptions::default()
    }
}

#[cfg(feature = "postgres")]
async fn build_persistence_backend(
    config: &AgentConfig,
) -> Result<Option<Arc<dyn PersistenceBackend>>, LifecycleError> {
    match (config.bus.persistence.backend, &config.bus.persistence.host) {
        (Some(BackendKind::Postgres), Some(host)) => {
            let backend = crate::persistence::PostgresBackend::connect(
                host,
                &crate::config::TlsSection::default(),
            )
            .await?;
            Ok(Some(Arc::new(backend)))
        }
        _ => Ok(None),
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_persistence_backend(
    config: &AgentConfig,
) -> Result<Option<Arc<dyn PersistenceBackend>>, LifecycleError> {
    match config.bus.persistence.backend {
        Some(BackendKind::Postgres) => Err(LifecycleError::FeatureDisabled("postgres")),
        _ => Ok(None),
    }
}

#[cfg(feature = "postgres")]
async fn build_history(config: &AgentConfig) -> Result<Arc<dyn HistoryStore>, LifecycleError> {
    let history = &config.history;
    match (history.backend, &history.host) {
        (BackendKind::Postgres, Some(host)) => {
            let store =
                crate::history::PostgresHistoryStore::connect(host, &history.database, &history.tls)
                    .await?;
            Ok(Arc::new(store))
        }
        _ => Ok(Arc::new(MemoryHistoryStore::new())),
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_history(config: &AgentConfig) -> Result<Arc<dyn HistoryStore>, LifecycleError> {
    match config.history.backend {
        BackendKind::Postgres => Err(LifecycleError::FeatureDisabled("postgres")),
        BackendKind::Memory => Ok(Arc::new(MemoryHistoryStore::new())),
    }
}

/// One agent: bus, workflow engine, history and their background tasks
pub struct AgentRuntime {
    config: AgentConfig,
    bus: Bus,
    engine: WorkflowEngine,
    history: Arc<dyn HistoryStore>,
    dispatch: DispatchTable,
    started: bool,
    engine_handle: Option<JoinHandle<()>>,
    sweeper_shutdown: watch::Sender<bool>,
    sweeper_handle: Option<JoinHandle<()>>,
    api_handle: Option<JoinHandle<()>>,
}

impl AgentRuntime {
    /// Build every component named by the configuration
    pub async fn build(config: AgentConfig) -> Result<Self, LifecycleError> {
        config.validate()?;
        let transport = build_transport(&config)?;
        let backend = build_persistence_backend(&config).await?;
        let persistence = Arc::new(BusPersistence::new(persistence_options(&config), backend));
        let history = build_history(&config).await?;
        Self::with_parts(config, transport, persistence, history)
    }

    /// Assemble a runtime from already built components
    pub fn with_parts(
        config: AgentConfig,
        transport: Arc<dyn Transport>,
        persistence: Arc<BusPersistence>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, LifecycleError> {
        let registry = config.rule_registry()?;
        let rulers = config.resolved_rulers(&registry)?;
        let dispatch =
            DispatchTable::build(&config.workflows, &rulers).map_err(LifecycleError::InvalidTrigger)?;

        let bus = Bus::new(&config.agent.name, transport, persistence);
        let sink: Arc<dyn EventSink> = Arc::new(bus.clone());
        let (engine, engine_handle) =
            WorkflowEngine::spawn_with_registry(rulers, registry, Some(sink), history.clone());
        let (sweeper_shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            bus,
            engine,
            history,
            dispatch,
            started: false,
            engine_handle: Some(engine_handle),
            sweeper_shutdown,
            sweeper_handle: None,
            api_handle: None,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn agent_name(&self) -> &str {
        &self.config.agent.name
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn dispatch(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Register templates, connect the bus and subscribe the triggers
    ///
    /// A transport that cannot connect yet is not fatal: the transport keeps
    /// retrying and published events are queued meanwhile.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        if self.started {
            return Err(LifecycleError::AlreadyStarted);
        }
        info!(agent = %self.agent_name(), "Starting agent runtime");

        let persistence = self.bus.persistence().clone();
        if let Err(e) = persistence.init().await {
            warn!(error = %e, "Persistence backend unavailable, continuing in memory");
        }
        if let Err(e) = self.history.init().await {
            warn!(error = %e, "History store initialization failed");
        }

        for template in &self.config.workflows {
            self.engine.register_template(template.clone()).await?;
        }

        match self.bus.start().await {
            Ok(()) => {}
            Err(BusError::Transport(e)) if e.is_connection_error() => {
                warn!(error = %e, "Bus not connected yet, events will be queued");
            }
            Err(e) => return Err(e.into()),
        }

        for filter in self.dispatch.topics() {
            let handler = Arc::new(TriggerHandler::new(
                self.engine.clone(),
                self.dispatch.routes(filter).to_vec(),
            ));
            self.bus.subscribe(filter, TRIGGER_SUBSCRIBER, handler).await?;
        }
        info!(
            triggers = self.dispatch.len(),
            templates = self.config.workflows.len(),
            "Workflow triggers registered"
        );

        self.sweeper_handle = Some(
            persistence.spawn_sweeper(DEFAULT_SWEEP_INTERVAL, self.sweeper_shutdown.subscribe()),
        );

        if self.config.api.port != 0 {
            let server = HistoryServer::new(
                &self.config.agent.name,
                self.config.api.port,
                self.history.clone(),
            )
            .with_engine(self.engine.clone());
            self.api_handle = Some(tokio::spawn(server.run()));
        }

        self.started = true;
        info!(agent = %self.agent_name(), "Agent runtime started");
        Ok(())
    }

    /// Stop the API, drain the engine, flush persistence and disconnect
    pub async fn shutdown(&mut self) -> Result<(), LifecycleError> {
        info!(agent = %self.agent_name(), "Shutting down agent runtime");

        if let Some(api) = self.api_handle.take() {
            api.abort();
        }

        if let Err(e) = self.engine.shutdown().await {
            warn!(error = %e, "Workflow engine shutdown failed");
        }
        if let Some(handle) = self.engine_handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Workflow engine task panicked");
            }
        }

        let _ = self.sweeper_shutdown.send(true);
        if let Some(sweeper) = self.sweeper_handle.take() {
            let _ = sweeper.await;
        }
        self.bus.persistence().flush().await;

        let result = self.bus.shutdown().await;
        self.started = false;
        info!(agent = %self.agent_name(), "Agent runtime stopped");
        result.map_err(Into::into)
    }
}
