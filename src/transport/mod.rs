//! Transport layer for bus communication
//!
//! This module provides the transport abstraction used by the bus router and
//! its two variants: a broker transport over MQTT v5 and a group-chat style
//! room transport where every topic is a shared room.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub mod local;
pub mod mqtt;

pub use local::{RoomHub, RoomTransport};
pub use mqtt::MqttTransport;

/// Capacity of each inbound subscription channel
pub const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Connection state shared by every transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}

impl TransportError {
    /// True for errors meaning the transport is unreachable rather than
    /// rejecting this particular operation
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_) | TransportError::NotConnected { .. }
        )
    }
}

/// Receipt returned by a successful publish
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryHandle {
    /// Transport-level address the bytes were sent to
    pub address: String,
    pub bytes: usize,
    /// Delivery guarantee level (MQTT QoS semantics, 1 = at least once)
    pub qos: u8,
    pub sent_at: DateTime<Utc>,
}

/// A raw message received on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Bus topic, without any transport prefix or room domain
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Stream of messages for one subscription
///
/// Messages arrive only once the subscription is acknowledged. The stream
/// survives reconnections and ends on unsubscribe or disconnect.
pub type Inbound = mpsc::Receiver<InboundMessage>;

/// Transport trait for bus communication
///
/// Implementations own exactly one live session and handle reconnection on
/// their own, re-subscribing every known topic once connected again.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Connect and wait for the session to be acknowledged
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the session
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Publish raw bytes on a concrete topic
    async fn publish(&self, topic: &str, payload: Vec<u8>)
        -> Result<DeliveryHandle, TransportError>;

    /// Subscribe to a topic filter
    async fn subscribe(&self, topic: &str) -> Result<Inbound, TransportError>;

    /// Drop a subscription, closing its inbound stream
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Watch connection state transitions
    fn state_changes(&self) -> watch::Receiver<ConnectionState>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }
}
