//! Publish/subscribe router
//!
//! The [`Bus`] sits between agents' code and a [`Transport`]. Publishing
//! assigns a per-topic sequence number, stores the event in
//! [`BusPersistence`], hands it to local subscribers and sends the JSON
//! envelope through the transport. Subscribing registers a handler, asks the
//! transport for the topic stream once per filter and first replays stored
//! events the handler has not seen yet.
//!
//! Every subscriber owns a worker task draining its own queue, so a slow
//! handler never holds back other subscribers. Events reach a worker in
//! per-topic order; the worker keeps a cursor per `(source, epoch, topic)`
//! and drops anything it already delivered, which absorbs the overlap between
//! replayed and live events as well as republished duplicates. Sequence
//! numbers skipped over stay open on the cursor so that a late copy of a
//! missed event is still delivered.
//!
//! Events published while the transport is down are kept with the
//! `NOT_CONNECTED` status and republished, with the same id and sequence
//! number, as soon as the transport reports `Connected` again. Events
//! received from other agents are stored too. After losing its session the
//! router posts a [`CatchUpRequest`] on [`CATCH_UP_TOPIC`]; every other
//! router answers by republishing its own events on the requested topics
//! since the session was lost.

use crate::observability::metrics::metrics;
use crate::persistence::{BusPersistence, Persisted};
use crate::protocol::{
    canonicalize_topic, topic_matches, validate_publish_topic, validate_topic_filter, BusEvent,
    EventStatus, Payload, ValidationError,
};
use crate::transport::{DeliveryHandle, Inbound, Transport, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

/// Delay before the single retry of a failed publish
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Control topic routers use to ask each other for missed events
pub const CATCH_UP_TOPIC: &str = "bus/catch_up";

/// Subtracted from the time a session was lost when asking for missed
/// events, to absorb clock drift between agents
const CATCH_UP_SLACK_SECS: i64 = 5;

/// Skipped sequence numbers remembered per stream
const MAX_OPEN_GAPS: usize = 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] ValidationError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Subscriber '{subscriber}' already subscribed to '{filter}'")]
    DuplicateSubscriber { filter: String, subscriber: String },
}

/// Receives events for one subscription
///
/// Handlers must be idempotent on `event.id`: delivery is at least once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &BusEvent);
}

/// Handler forwarding every event into a channel
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<BusEvent>,
}

impl ChannelHandler {
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, event: &BusEvent) {
        if self.tx.send(event.clone()).is_err() {
            trace!(event_id = %event.id, "Channel handler receiver dropped");
        }
    }
}

/// Outcome of a publish
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub event: BusEvent,
    /// Transport receipt, `None` when the event waits for a reconnection
    pub delivered: Option<DeliveryHandle>,
    pub persisted: Persisted,
}

#[derive(Debug, Clone)]
pub struct BusOptions {
    pub retry_delay: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Events of one publisher's router instance on one topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    source: String,
    epoch: Uuid,
    topic: String,
}

impl StreamKey {
    fn of(event: &BusEvent) -> Self {
        Self {
            source: event.source.clone(),
            epoch: event.epoch,
            topic: event.topic.clone(),
        }
    }
}

/// Highest sequence number delivered on a stream, with the numbers skipped
/// below it
#[derive(Debug, Clone, Default)]
struct StreamCursor {
    high: u64,
    gaps: BTreeSet<u64>,
}

impl StreamCursor {
    fn is_unseen(&self, seq: u64) -> bool {
        seq > self.high || self.gaps.contains(&seq)
    }

    /// Record a delivery, false if `seq` was already delivered
    fn advance(&mut self, seq: u64) -> bool {
        if seq <= self.high {
            return self.gaps.remove(&seq);
        }
        let skipped_from = (self.high + 1).max(seq.saturating_sub(MAX_OPEN_GAPS as u64));
        self.gaps.extend(skipped_from..seq);
        while self.gaps.len() > MAX_OPEN_GAPS {
            self.gaps.pop_first();
        }
        self.high = seq;
        true
    }
}

/// Delivery cursors per subscriber, then per stream
type Cursors = Arc<std::sync::Mutex<HashMap<String, HashMap<StreamKey, StreamCursor>>>>;

/// Body of a message on [`CATCH_UP_TOPIC`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatchUpRequest {
    pub requester: String,
    /// Topic filters the requester is subscribed to
    pub filters: Vec<String>,
    /// Events stored at or after this instant are republished
    pub since: DateTime<Utc>,
}

/// Queue of one subscriber's worker; dropping it stops the worker once drained
struct Subscriber {
    queue: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Default)]
struct FilterEntry {
    pump: Option<JoinHandle<()>>,
    subscribers: HashMap<String, Subscriber>,
}

/// Next sequence number of one topic, seeded lazily from the store
#[derive(Default)]
struct TopicSeq {
    last: Option<u64>,
}

struct BusInner {
    agent_name: String,
    epoch: Uuid,
    transport: Arc<dyn Transport>,
    persistence: Arc<BusPersistence>,
    options: BusOptions,
    topics: Mutex<HashMap<String, Arc<Mutex<TopicSeq>>>>,
    table: Mutex<HashMap<String, FilterEntry>>,
    cursors: Cursors,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    control: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Reliable pub/sub router, cheap to clone
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(
        agent_name: &str,
        transport: Arc<dyn Transport>,
        persistence: Arc<BusPersistence>,
    ) -> Self {
        Self::with_options(agent_name, transport, persistence, BusOptions::default())
    }

    pub fn with_options(
        agent_name: &str,
        transport: Arc<dyn Transport>,
        persistence: Arc<BusPersistence>,
        options: BusOptions,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                agent_name: agent_name.to_string(),
                epoch: Uuid::new_v4(),
                transport,
                persistence,
                options,
                topics: Mutex::new(HashMap::new()),
                table: Mutex::new(HashMap::new()),
                cursors: Arc::new(std::sync::Mutex::new(HashMap::new())),
                watcher: std::sync::Mutex::new(None),
                control: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.inner.agent_name
    }

    /// Id of this router instance, stamped on every event it publishes
    pub fn epoch(&self) -> Uuid {
        self.inner.epoch
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn persistence(&self) -> &Arc<BusPersistence> {
        &self.inner.persistence
    }

    /// Connect the transport and start watching its state
    ///
    /// A connection error is returned but the watcher is started anyway: the
    /// transport keeps retrying and queued events go out once it succeeds.
    pub async fn start(&self) -> Result<(), BusError> {
        self.spawn_control().await?;
        self.spawn_watcher();
        self.inner.transport.connect().await?;
        info!(agent = %self.inner.agent_name, "Bus started");
        Ok(())
    }

    fn spawn_watcher(&self) {
        let mut watcher = self.inner.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let mut states = self.inner.transport.state_changes();
        let mut was_connected = states.borrow_and_update().is_connected();
        let mut lost_at: Option<DateTime<Utc>> = None;

        *watcher = Some(tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let connected = states.borrow_and_update().is_connected();
                if was_connected && !connected {
                    lost_at.get_or_insert_with(Utc::now);
                }
                if connected && !was_connected {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let bus = Bus { inner };
                    info!(agent = %bus.agent_name(), "Transport connected, replaying undelivered events");
                    match bus.replay(None).await {
                        Ok(count) if count > 0 => info!(count, "Republished undelivered events"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Replay after reconnection failed"),
                    }
                    bus.catch_up().await;
                    if let Some(lost_at) = lost_at.take() {
                        let since = lost_at - chrono::Duration::seconds(CATCH_UP_SLACK_SECS);
                        bus.request_catch_up(since).await;
                    }
                }
                was_connected = connected;
            }
            debug!("Bus state watcher stopped");
        }));
    }

    /// Listen for catch-up requests of other routers
    async fn spawn_control(&self) -> Result<(), BusError> {
        if self
            .inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
        {
            return Ok(());
        }

        let mut inbound = self.inner.transport.subscribe(CATCH_UP_TOPIC).await?;
        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let request: CatchUpRequest = match serde_json::from_slice(&message.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed catch-up request");
                        continue;
                    }
                };
                if request.requester == inner.agent_name {
                    continue;
                }
                let bus = Bus { inner };
                match bus.answer_catch_up(&request).await {
                    Ok(count) if count > 0 => {
                        info!(requester = %request.requester, count, "Republished events for catch-up")
                    }
                    Ok(_) => {}
                    Err(e) => warn!(requester = %request.requester, error = %e, "Catch-up answer failed"),
                }
            }
            debug!("Catch-up listener stopped");
        });
        *self
            .inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Ask the other routers for events published on our subscriptions since
    /// `since`
    async fn request_catch_up(&self, since: DateTime<Utc>) {
        let filters = self.subscriptions().await;
        if filters.is_empty() {
            return;
        }
        let request = CatchUpRequest {
            requester: self.inner.agent_name.clone(),
            filters,
            since,
        };
        let bytes = match serde_json::to_vec(&request) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Cannot encode catch-up request");
                return;
            }
        };
        match self.inner.transport.publish(CATCH_UP_TOPIC, bytes).await {
            Ok(_) => debug!(since = %since, filters = ?request.filters, "Catch-up requested"),
            Err(e) => warn!(error = %e, "Catch-up request not sent"),
        }
    }

    /// Republish this agent's stored events matching the request, keeping
    /// their id, epoch and sequence number
    pub async fn answer_catch_up(&self, request: &CatchUpRequest) -> Result<usize, BusError> {
        let inner = &self.inner;
        let events: Vec<BusEvent> = inner
            .persistence
            .retrieve(Some(request.since), &[])
            .await
            .into_iter()
            .map(|r| r.event)
            .filter(|e| e.source == inner.agent_name)
            .filter(|e| request.filters.iter().any(|f| topic_matches(f, &e.topic)))
            .collect();

        let mut republished = 0;
        for event in events {
            match inner.transport.publish(&event.topic, event.to_bytes()?).await {
                Ok(_) => {
                    metrics().event_republished();
                    republished += 1;
                }
                Err(e) if e.is_connection_error() => {
                    warn!(error = %e, "Connection lost while answering catch-up");
                    break;
                }
                Err(e) => warn!(event_id = %event.id, error = %e, "Catch-up republish failed"),
            }
        }
        Ok(republished)
    }

    /// Stop background tasks, drop every subscription and disconnect
    pub async fn shutdown(&self) -> Result<(), BusError> {
        if let Some(watcher) = self
            .inner
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        if let Some(control) = self
            .inner
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            control.abort();
        }

        let entries: Vec<(String, FilterEntry)> = self.inner.table.lock().await.drain().collect();
        for (filter, entry) in entries {
            if let Some(pump) = entry.pump {
                pump.abort();
            }
            drop(entry.subscribers);
            debug!(topic = %filter, "Subscription dropped on shutdown");
        }

        self.inner.transport.disconnect().await?;
        info!(agent = %self.inner.agent_name, "Bus stopped");
        Ok(())
    }

    /// Publish a payload on a concrete topic
    pub async fn publish(&self, topic: &str, payload: Payload) -> Result<PublishReceipt, BusError> {
        validate_publish_topic(topic)?;
        let topic = canonicalize_topic(topic);
        let span = crate::bus_span!(operation = "publish", topic = %topic);
        self.publish_inner(topic, payload).instrument(span).await
    }

    async fn publish_inner(&self, topic: String, payload: Payload) -> Result<PublishReceipt, BusError> {
        let inner = &self.inner;

        // Held until the transport call returns to keep per-topic order
        let topic_lock = self.topic_lock(&topic).await;
        let mut topic_seq = topic_lock.lock().await;
        let seq = self.next_seq(&topic, &mut topic_seq).await;

        let event = BusEvent::new(&inner.agent_name, &topic, seq, payload).with_epoch(inner.epoch);
        let bytes = event.to_bytes()?;

        let status = if inner.transport.is_connected() {
            EventStatus::Sent
        } else {
            EventStatus::NotConnected
        };
        let persisted = inner.persistence.append(event.clone(), status).await;
        metrics().event_published();
        self.fan_out_local(&event).await;

        if !inner.transport.is_connected() {
            info!(event_id = %event.id, seq, "Transport down, event kept for republish");
            metrics().event_queued();
            return Ok(PublishReceipt {
                event,
                delivered: None,
                persisted,
            });
        }

        match self.send_with_retry(&topic, bytes).await {
            Ok(handle) => {
                if status != EventStatus::Sent {
                    inner.persistence.update_status(event.id, EventStatus::Sent).await;
                }
                debug!(event_id = %event.id, seq, address = %handle.address, "Event published");
                Ok(PublishReceipt {
                    event,
                    delivered: Some(handle),
                    persisted,
                })
            }
            Err(e) if e.is_connection_error() => {
                warn!(event_id = %event.id, error = %e, "Connection lost while publishing, event kept for republish");
                inner
                    .persistence
                    .update_status(event.id, EventStatus::NotConnected)
                    .await;
                metrics().event_queued();
                Ok(PublishReceipt {
                    event,
                    delivered: None,
                    persisted,
                })
            }
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Publish failed after retry");
                inner.persistence.update_status(event.id, EventStatus::Failed).await;
                metrics().publish_failed();
                Err(BusError::Transport(e))
            }
        }
    }

    async fn topic_lock(&self, topic: &str) -> Arc<Mutex<TopicSeq>> {
        self.inner
            .topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .clone()
    }

    /// Continue after the highest sequence number already stored for this
    /// agent, so a restart does not reuse numbers remote cursors have seen
    async fn next_seq(&self, topic: &str, state: &mut TopicSeq) -> u64 {
        let last = match state.last {
            Some(last) => last,
            None => self
                .inner
                .persistence
                .read_since(topic, Some(&self.inner.agent_name), 0)
                .await
                .iter()
                .filter(|r| r.event.topic == topic)
                .map(|r| r.event.seq)
                .max()
                .unwrap_or(0),
        };
        let next = last + 1;
        state.last = Some(next);
        next
    }

    async fn send_with_retry(
        &self,
        topic: &str,
        bytes: Vec<u8>,
    ) -> Result<DeliveryHandle, TransportError> {
        match self.inner.transport.publish(topic, bytes.clone()).await {
            Ok(handle) => Ok(handle),
            Err(e) if e.is_connection_error() => Err(e),
            Err(e) => {
                warn!(topic, error = %e, delay = ?self.inner.options.retry_delay, "Publish failed, retrying once");
                tokio::time::sleep(self.inner.options.retry_delay).await;
                self.inner.transport.publish(topic, bytes).await
            }
        }
    }

    /// Own events are not echoed back by the bus; local subscribers get
    /// them directly
    async fn fan_out_local(&self, event: &BusEvent) {
        let table = self.inner.table.lock().await;
        for (filter, entry) in table.iter() {
            if topic_matches(filter, &event.topic) {
                for subscriber in entry.subscribers.values() {
                    let _ = subscriber.queue.send(event.clone());
                }
            }
        }
    }

    /// Register `handler` on `filter` under `subscriber_id`
    ///
    /// Stored events on matching topics that the subscriber has not seen are
    /// delivered first, oldest first, followed by live events.
    pub async fn subscribe(
        &self,
        filter: &str,
        subscriber_id: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        validate_topic_filter(filter)?;
        let filter = canonicalize_topic(filter);
        let inner = &self.inner;

        let mut table = inner.table.lock().await;
        if table
            .get(&filter)
            .is_some_and(|entry| entry.subscribers.contains_key(subscriber_id))
        {
            return Err(BusError::DuplicateSubscriber {
                filter,
                subscriber: subscriber_id.to_string(),
            });
        }

        if !table.contains_key(&filter) {
            let inbound = inner.transport.subscribe(&filter).await?;
            let entry = FilterEntry {
                pump: Some(self.spawn_pump(filter.clone(), inbound)),
                subscribers: HashMap::new(),
            };
            table.insert(filter.clone(), entry);
            info!(topic = %filter, "Subscribed to topic");
        }

        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(
            subscriber_id.to_string(),
            handler,
            inner.cursors.clone(),
            rx,
        ));

        // Replay is queued before the table lock is released so that no live
        // event can overtake it
        let replay = self.unseen_records(&filter, subscriber_id).await;
        if !replay.is_empty() {
            debug!(topic = %filter, subscriber = subscriber_id, count = replay.len(), "Replaying stored events");
            metrics().events_replayed(replay.len() as u64);
        }
        for event in replay {
            let _ = queue.send(event);
        }

        if let Some(entry) = table.get_mut(&filter) {
            entry
                .subscribers
                .insert(subscriber_id.to_string(), Subscriber { queue });
        }
        Ok(())
    }

    /// Remove one subscriber, dropping the transport subscription with the
    /// last one; returns false if it was not subscribed
    pub async fn unsubscribe(&self, filter: &str, subscriber_id: &str) -> Result<bool, BusError> {
        let filter = canonicalize_topic(filter);
        let mut table = self.inner.table.lock().await;

        let Some(entry) = table.get_mut(&filter) else {
            return Ok(false);
        };
        if entry.subscribers.remove(subscriber_id).is_none() {
            return Ok(false);
        }

        if entry.subscribers.is_empty() {
            if let Some(entry) = table.remove(&filter) {
                if let Some(pump) = entry.pump {
                    pump.abort();
                }
            }
            drop(table);
            self.inner.transport.unsubscribe(&filter).await?;
            info!(topic = %filter, "Unsubscribed from topic");
        }
        Ok(true)
    }

    /// Filters with at least one subscriber
    pub async fn subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.inner.table.lock().await.keys().cloned().collect();
        filters.sort();
        filters
    }

    /// Republish this agent's events stored since `since` that were not
    /// delivered, keeping their id and sequence number
    ///
    /// Stops at the first connection error; the remaining events go out on
    /// the next reconnection.
    pub async fn replay(&self, since: Option<DateTime<Utc>>) -> Result<usize, BusError> {
        let inner = &self.inner;
        let pending: Vec<BusEvent> = inner
            .persistence
            .retrieve(since, &EventStatus::undelivered())
            .await
            .into_iter()
            .filter(|r| r.event.source == inner.agent_name)
            .map(|r| r.event)
            .collect();

        let mut republished = 0;
        for event in pending {
            let bytes = event.to_bytes()?;
            match inner.transport.publish(&event.topic, bytes).await {
                Ok(_) => {
                    inner.persistence.update_status(event.id, EventStatus::Sent).await;
                    metrics().event_republished();
                    republished += 1;
                    debug!(event_id = %event.id, topic = %event.topic, seq = event.seq, "Event republished");
                }
                Err(e) if e.is_connection_error() => {
                    warn!(error = %e, "Connection lost during replay");
                    break;
                }
                Err(e) => {
                    error!(event_id = %event.id, error = %e, "Republish failed");
                    inner.persistence.update_status(event.id, EventStatus::Failed).await;
                    metrics().publish_failed();
                }
            }
        }
        Ok(republished)
    }

    /// Queue stored events each subscriber has not seen yet, used after a
    /// reconnection to pick up what other agents published meanwhile
    async fn catch_up(&self) {
        let table = self.inner.table.lock().await;
        for (filter, entry) in table.iter() {
            for (subscriber_id, subscriber) in &entry.subscribers {
                let records = self.unseen_records(filter, subscriber_id).await;
                if !records.is_empty() {
                    metrics().events_replayed(records.len() as u64);
                }
                for event in records {
                    let _ = subscriber.queue.send(event);
                }
            }
        }
    }

    async fn unseen_records(&self, filter: &str, subscriber_id: &str) -> Vec<BusEvent> {
        let seen: HashMap<StreamKey, StreamCursor> = self
            .inner
            .cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscriber_id)
            .cloned()
            .unwrap_or_default();

        self.inner
            .persistence
            .read_since(filter, None, 0)
            .await
            .into_iter()
            .map(|r| r.event)
            .filter(|e| {
                seen.get(&StreamKey::of(e))
                    .map_or(true, |cursor| cursor.is_unseen(e.seq))
            })
            .collect()
    }

    fn spawn_pump(&self, filter: String, mut inbound: Inbound) -> JoinHandle<()> {
        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if message.topic == CATCH_UP_TOPIC {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let event = match BusEvent::from_bytes(&message.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(topic = %message.topic, error = %e, "Dropping malformed bus envelope");
                        continue;
                    }
                };
                if event.source == inner.agent_name {
                    trace!(event_id = %event.id, "Ignoring own echoed event");
                    continue;
                }

                metrics().event_received();
                inner.persistence.append_received(event.clone()).await;
                let table = inner.table.lock().await;
                if let Some(entry) = table.get(&filter) {
                    for subscriber in entry.subscribers.values() {
                        let _ = subscriber.queue.send(event.clone());
                    }
                }
            }
            debug!(topic = %filter, "Inbound stream closed");
        })
    }
}

async fn run_worker(
    subscriber_id: String,
    handler: Arc<dyn EventHandler>,
    cursors: Cursors,
    mut queue: mpsc::UnboundedReceiver<BusEvent>,
) {
    while let Some(event) = queue.recv().await {
        if !advance_cursor(&cursors, &subscriber_id, &event) {
            trace!(subscriber = %subscriber_id, event_id = %event.id, seq = event.seq, "Dropping already seen event");
            continue;
        }
        handler.handle(&event).await;
    }
    debug!(subscriber = %subscriber_id, "Subscriber worker stopped");
}

/// Move the cursor forward, false if the event was already delivered
fn advance_cursor(cursors: &Cursors, subscriber_id: &str, event: &BusEvent) -> bool {
    let mut cursors = cursors.lock().unwrap_or_else(PoisonError::into_inner);
    cursors
        .entry(subscriber_id.to_string())
        .or_default()
        .entry(StreamKey::of(event))
        .or_default()
        .advance(event.seq)
}
