//! Bus message types
//!
//! This module defines the event envelope exchanged over the bus and the
//! delivery bookkeeping attached to it by the persistence store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Ordered key/value mapping carried by events and shared by workflow tasks
pub type Payload = Map<String, Value>;

/// Event envelope published on the bus
///
/// Events are immutable once built. The `seq` number is assigned by the
/// publishing agent's router and increases monotonically per topic within one
/// `epoch`, the id a router draws when it is created. Subscribers keep their
/// per-topic FIFO ordering on `(source, epoch, topic)`, so a restarted
/// publisher starting over at 1 is not mistaken for a replay.
///
/// # Examples
/// ```
/// use agentbus::protocol::BusEvent;
/// use serde_json::json;
///
/// let payload = json!({"message": "hi"}).as_object().unwrap().clone();
/// let event = BusEvent::new("timon", "timon", 1, payload);
/// assert_eq!(event.payload["message"], "hi");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusEvent {
    /// UUID v4 generated at publish time, the idempotency key for consumers
    pub id: Uuid,
    /// Name of the publishing agent
    pub source: String,
    /// Canonical topic the event was published to
    pub topic: String,
    /// Router instance of the publisher, nil for envelopes without one
    #[serde(default)]
    pub epoch: Uuid,
    /// Per-topic sequence number assigned by the publisher
    pub seq: u64,
    pub payload: Payload,
    pub published_at: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(source: &str, topic: &str, seq: u64, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            topic: topic.to_string(),
            epoch: Uuid::nil(),
            seq,
            payload,
            published_at: Utc::now(),
        }
    }

    pub fn with_epoch(mut self, epoch: Uuid) -> Self {
        self.epoch = epoch;
        self
    }

    /// Serialize to the JSON wire envelope
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a JSON wire envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Delivery status of a stored event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Handed to a connected transport
    Sent,
    /// Transport rejected the publish after retry
    Failed,
    /// Transport was down when the event was published
    NotConnected,
}

impl EventStatus {
    /// Statuses that make an event eligible for republishing
    pub fn undelivered() -> [EventStatus; 2] {
        [EventStatus::Failed, EventStatus::NotConnected]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Sent => "SENT",
            EventStatus::Failed => "FAILED",
            EventStatus::NotConnected => "NOT_CONNECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SENT" => Some(EventStatus::Sent),
            "FAILED" => Some(EventStatus::Failed),
            "NOT_CONNECTED" => Some(EventStatus::NotConnected),
            _ => None,
        }
    }
}

/// An event as held by the persistence store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub event: BusEvent,
    pub status: EventStatus,
    pub stored_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn new(event: BusEvent, status: EventStatus) -> Self {
        Self {
            event,
            status,
            stored_at: Utc::now(),
        }
    }
}

/// Build a payload from a JSON value, wrapping non-objects under `data`
pub fn payload_from_value(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    }
}
