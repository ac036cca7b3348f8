//! agentbus
//!
//! A reliable topic-based pub/sub bus for cooperating agents, with a DAG
//! workflow engine started by bus events.
//!
//! # Overview
//!
//! - Topic validation and wildcard matching ([`protocol`])
//! - MQTT and in-process room transports ([`transport`])
//! - Bounded, TTL-swept event persistence with optional PostgreSQL backing ([`persistence`])
//! - Per-topic ordered publish, replay on subscribe and on reconnection ([`bus`])
//! - Declarative payload rules ([`rules`])
//! - Workflow templates, instances and the engine actor ([`workflow`])
//! - Queryable instance history over HTTP ([`history`])
//!
//! # Quick Start
//!
//! ```rust
//! use agentbus::bus::{Bus, ChannelHandler};
//! use agentbus::persistence::BusPersistence;
//! use agentbus::transport::{RoomHub, RoomTransport};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = RoomHub::new("conference.localhost");
//! let bus = Bus::new(
//!     "timon",
//!     Arc::new(RoomTransport::new("timon", hub)),
//!     Arc::new(BusPersistence::in_memory(1000)),
//! );
//! bus.start().await?;
//!
//! bus.publish("timon", agentbus::protocol::payload_from_value(json!({"message": "hi"})))
//!     .await?;
//!
//! // Subscribers attaching later still receive stored events
//! let (handler, mut events) = ChannelHandler::channel();
//! bus.subscribe("timon", "late-reader", handler).await?;
//! let event = events.recv().await.ok_or("no replay")?;
//! assert_eq!(event.payload["message"], "hi");
//! # bus.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod bus;
pub mod config;
pub mod error;
pub mod history;
pub mod observability;
pub mod persistence;
pub mod protocol;
pub mod rules;
pub mod testing;
pub mod transport;
pub mod workflow;

pub use agent::AgentRuntime;
pub use bus::{Bus, BusError, EventHandler};
pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, AgentResult};
pub use protocol::{BusEvent, Payload};
pub use workflow::{WorkflowEngine, WorkflowTemplate};
