//! Mock implementations for testing
//!
//! Provides a scriptable [`Transport`] and persistence/history backends that
//! fail on demand, so the reliability paths can be exercised without a broker
//! or a database.

use crate::history::{HistoryError, HistoryPage, HistoryQuery, HistoryStore, InstanceRecord};
use crate::persistence::{DeliveryError, MemoryBackend, PersistenceBackend};
use crate::protocol::{canonicalize_topic, topic_matches, EventStatus, StoredEvent};
use crate::transport::{
    ConnectionState, DeliveryHandle, Inbound, InboundMessage, Transport, TransportError,
    INBOUND_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

pub type PublishedMessage = (String, Vec<u8>);

/// How a scripted publish failure looks to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishFailure {
    /// The transport refused this message
    Rejected,
    /// The session dropped during the call
    ConnectionLost,
}

/// Mock transport for testing
pub struct MockTransport {
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    published: Mutex<Vec<PublishedMessage>>,
    publish_attempts: AtomicUsize,
    failures: Mutex<VecDeque<PublishFailure>>,
    subscriptions: Mutex<HashMap<String, mpsc::Sender<InboundMessage>>>,
    refuse_connect: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("Not connected".to_string()));
        Self {
            state_tx,
            state_rx,
            published: Mutex::new(Vec::new()),
            publish_attempts: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            subscriptions: Mutex::new(HashMap::new()),
            refuse_connect: AtomicBool::new(false),
        }
    }

    /// Transport whose `connect` always fails
    pub fn unreachable() -> Self {
        let transport = Self::new();
        transport.refuse_connect.store(true, Ordering::SeqCst);
        transport
    }

    /// Drop or restore the session without touching subscriptions
    pub fn set_connected(&self, connected: bool) {
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected("Mock connection lost".to_string())
        };
        self.state_tx.send_replace(state);
    }

    /// Make the next `count` publishes fail
    pub async fn fail_next_publishes(&self, count: usize, failure: PublishFailure) {
        let mut failures = self.failures.lock().await;
        for _ in 0..count {
            failures.push_back(failure);
        }
    }

    /// Deliver raw bytes to every subscription matching `topic`
    pub async fn inject(&self, topic: &str, payload: Vec<u8>) {
        let topic = canonicalize_topic(topic);
        let senders: Vec<mpsc::Sender<InboundMessage>> = self
            .subscriptions
            .lock()
            .await
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &topic))
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(InboundMessage::new(topic.clone(), payload.clone())).await;
        }
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
        self.publish_attempts.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            self.state_tx
                .send_replace(ConnectionState::Disconnected("Mock connection refused".to_string()));
            return Err(TransportError::ConnectionFailed(
                "Mock connection refused".to_string(),
            ));
        }
        self.state_tx.send_replace(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.subscriptions.lock().await.clear();
        self.state_tx
            .send_replace(ConnectionState::Disconnected("Client disconnected".to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<DeliveryHandle, TransportError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = self.failures.lock().await.pop_front() {
            return Err(match failure {
                PublishFailure::Rejected => {
                    TransportError::PublishFailed("Mock publish failure".into())
                }
                PublishFailure::ConnectionLost => {
                    TransportError::ConnectionFailed("Mock connection lost".to_string())
                }
            });
        }

        let state = self.connection_state();
        if !state.is_connected() {
            return Err(TransportError::NotConnected { state });
        }

        let bytes = payload.len();
        self.published.lock().await.push((topic.to_string(), payload));
        Ok(DeliveryHandle {
            address: topic.to_string(),
            bytes,
            qos: 1,
            sent_at: Utc::now(),
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Inbound, TransportError> {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        self.subscriptions
            .lock()
            .await
            .insert(canonicalize_topic(topic), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions
            .lock()
            .await
            .remove(&canonicalize_topic(topic));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

/// Persistence backend that is unreachable until told otherwise
///
/// Clones share availability and the records written once available.
#[derive(Clone)]
pub struct FailingBackend {
    available: Arc<AtomicBool>,
    hang: bool,
    inner: MemoryBackend,
}

impl Default for FailingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FailingBackend {
    /// Backend refusing every call
    pub fn new() -> Self {
        Self {
            available: Arc::new(AtomicBool::new(false)),
            hang: false,
            inner: MemoryBackend::new(),
        }
    }

    /// Backend never answering while unavailable
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Records stored while available
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    async fn check(&self) -> Result<(), DeliveryError> {
        if self.available.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        Err(DeliveryError::Unavailable("Mock backend down".to_string()))
    }
}

#[async_trait]
impl PersistenceBackend for FailingBackend {
    async fn ping(&self) -> bool {
        self.check().await.is_ok()
    }

    async fn store(
        &self,
        record: &StoredEvent,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        self.check().await?;
        self.inner.store(record, expires_at).await
    }

    async fn update_status(&self, id: Uuid, status: EventStatus) -> Result<bool, DeliveryError> {
        self.check().await?;
        self.inner.update_status(id, status).await
    }

    async fn read_since(
        &self,
        filter: &str,
        source: Option<&str>,
        after_seq: u64,
    ) -> Result<Vec<StoredEvent>, DeliveryError> {
        self.check().await?;
        self.inner.read_since(filter, source, after_seq).await
    }

    async fn retrieve(
        &self,
        since: Option<DateTime<Utc>>,
        statuses: &[EventStatus],
    ) -> Result<Vec<StoredEvent>, DeliveryError> {
        self.check().await?;
        self.inner.retrieve(since, statuses).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DeliveryError> {
        self.check().await?;
        self.inner.purge_expired(now).await
    }
}

/// History store rejecting every write, for degraded-history tests
#[derive(Debug, Default)]
pub struct FailingHistoryStore;

#[async_trait]
impl HistoryStore for FailingHistoryStore {
    async fn upsert(&self, _record: &InstanceRecord) -> Result<(), HistoryError> {
        Err(HistoryError::Store("Mock history store down".to_string()))
    }

    async fn get_one(&self, _id: Uuid, _full: bool) -> Result<Option<InstanceRecord>, HistoryError> {
        Err(HistoryError::Store("Mock history store down".to_string()))
    }

    async fn query(&self, _query: &HistoryQuery) -> Result<HistoryPage, HistoryError> {
        Err(HistoryError::Store("Mock history store down".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BusEvent, Payload};

    #[tokio::test]
    async fn test_mock_transport_publish_requires_connection() {
        let transport = MockTransport::new();
        assert!(matches!(
            transport.publish("timon", vec![1]).await,
            Err(TransportError::NotConnected { .. })
        ));

        transport.connect().await.unwrap();
        transport.publish("timon", vec![1]).await.unwrap();
        assert_eq!(transport.published().await, vec![("timon".to_string(), vec![1])]);
        assert_eq!(transport.publish_attempts(), 2);
    }

    #[tokio::test]
    async fn test_mock_transport_scripted_failures() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();
        transport.fail_next_publishes(1, PublishFailure::Rejected).await;
        transport.fail_next_publishes(1, PublishFailure::ConnectionLost).await;

        let first = transport.publish("timon", vec![]).await.unwrap_err();
        assert!(!first.is_connection_error());
        let second = transport.publish("timon", vec![]).await.unwrap_err();
        assert!(second.is_connection_error());
        assert!(transport.publish("timon", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_transport_inject_matches_filters() {
        let transport = MockTransport::new();
        let mut all = transport.subscribe("workflow/#").await.unwrap();
        let mut other = transport.subscribe("timon").await.unwrap();

        transport.inject("workflow/instances/1", b"x".to_vec()).await;
        assert_eq!(all.recv().await.unwrap().topic, "workflow/instances/1");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_backend_recovers() {
        let backend = FailingBackend::new();
        let record = StoredEvent::new(BusEvent::new("a", "t", 1, Payload::new()), EventStatus::Sent);
        let expires = Utc::now() + chrono::Duration::minutes(1);

        assert!(!backend.ping().await);
        assert!(backend.store(&record, expires).await.is_err());

        backend.clone().set_available(true);
        assert!(backend.ping().await);
        backend.store(&record, expires).await.unwrap();
        assert_eq!(backend.inner().len().await, 1);
    }
}
