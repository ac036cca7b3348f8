//! MQTT v5 broker transport
//!
//! Pure decisions are kept apart from I/O:
//!
//! - [`connection`] - broker options, reconnection policy and topic mapping
//! - [`message_handler`] - classification of broker events
//! - [`supervision`] - reconnection policy and state transitions
//! - [`client`] - the rumqttc client, supervisor task and subscriptions
//!
//! ```rust,no_run
//! use agentbus::config::AgentConfig;
//! use agentbus::transport::{MqttTransport, Transport};
//!
//! # async fn run(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let transport = MqttTransport::new(&config.agent.name, config.bus.clone())?;
//! transport.connect().await?;
//! let mut inbound = transport.subscribe("timon").await?;
//! while let Some(message) = inbound.recv().await {
//!     println!("{} bytes on {}", message.payload.len(), message.topic);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod supervision;

pub use client::MqttTransport;
pub use connection::{ReconnectConfig, TopicMapper};
pub use message_handler::{EventRoute, MessageHandler};
pub use supervision::{BrokerSignal, ReconnectStep};
