//! Delivery persistence store
//!
//! Every published event is kept in a bounded in-memory ring buffer and, when
//! a durable backend is configured, written through to it with an expiry of
//! `ttl` minutes. The buffer keeps working when the backend is unreachable:
//! such events are flagged as memory-only and flushed to the backend by the
//! sweeper once it answers again.

use crate::observability::metrics::metrics;
use crate::protocol::{topic_matches, BusEvent, EventStatus, StoredEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub mod backend;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use backend::MemoryBackend;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

/// Bound applied to every backend call
pub const BACKEND_TIMEOUT: Duration = Duration::from_secs(2);
/// Default delay between two sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Persistence backend failures
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Backend query failed: {0}")]
    Query(String),
    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

/// Where an appended event ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    /// Written to memory and to the durable backend
    Durable,
    /// Held in memory only
    MemoryOnly,
}

/// Durable storage for bus events
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Prepare storage (tables, indexes)
    async fn init(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    /// Connection check
    async fn ping(&self) -> bool {
        true
    }

    /// Store or overwrite a record, dropped by the backend after `expires_at`
    async fn store(
        &self,
        record: &StoredEvent,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DeliveryError>;

    /// Update the delivery status, returns false if the record is unknown
    async fn update_status(&self, id: Uuid, status: EventStatus) -> Result<bool, DeliveryError>;

    /// Records whose topic matches `filter`, optionally from one source, with
    /// a sequence number above `after_seq`, oldest first
    async fn read_since(
        &self,
        filter: &str,
        source: Option<&str>,
        after_seq: u64,
    ) -> Result<Vec<StoredEvent>, DeliveryError>;

    /// Records stored at or after `since` whose status is in `statuses`
    /// (any status when empty), oldest first
    async fn retrieve(
        &self,
        since: Option<DateTime<Utc>>,
        statuses: &[EventStatus],
    ) -> Result<Vec<StoredEvent>, DeliveryError>;

    /// Remove records expired at `now`, returns how many were removed
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DeliveryError>;
}

/// Bounded FIFO queue dropping its oldest item when full
#[derive(Debug, Clone)]
pub struct FifoSizedQueue<T> {
    items: VecDeque<T>,
    size: usize,
}

impl<T> FifoSizedQueue<T> {
    pub fn new(size: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(size.min(1024)),
            size: size.max(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.size
    }

    /// Append an item, returning the items popped to make room
    pub fn put(&mut self, item: T) -> Vec<T> {
        let mut popped = Vec::new();
        while self.is_full() {
            if let Some(oldest) = self.items.pop_front() {
                popped.push(oldest);
            }
        }
        self.items.push_back(item);
        popped
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
    }
}

#[derive(Debug, Clone)]
struct BufferedEvent {
    record: StoredEvent,
    durable: bool,
}

/// Result of one eviction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub memory_expired: usize,
    pub backend_purged: u64,
}

/// Bus persistence options
#[derive(Debug, Clone)]
pub struct PersistenceOptions {
    pub memory_size: usize,
    /// Retention in minutes
    pub ttl_minutes: u64,
    pub backend_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            memory_size: 10_000,
            ttl_minutes: 60,
            backend_timeout: BACKEND_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// In-memory ring buffer plus optional durable backend
pub struct BusPersistence {
    buffer: Mutex<FifoSizedQueue<BufferedEvent>>,
    backend: Option<Arc<dyn PersistenceBackend>>,
    options: PersistenceOptions,
    last_eviction: Mutex<tokio::time::Instant>,
}

impl BusPersistence {
    pub fn new(options: PersistenceOptions, backend: Option<Arc<dyn PersistenceBackend>>) -> Self {
        if backend.is_none() {
            info!("No persistence backend selected, in-memory only");
        }
        Self {
            buffer: Mutex::new(FifoSizedQueue::new(options.memory_size)),
            backend,
            options,
            last_eviction: Mutex::new(tokio::time::Instant::now()),
        }
    }

    /// Memory-only store with default options
    pub fn in_memory(memory_size: usize) -> Self {
        Self::new(
            PersistenceOptions {
                memory_size,
                ..PersistenceOptions::default()
            },
            None,
        )
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.options.ttl_minutes as i64)
    }

    /// Number of events currently held in memory
    pub async fn memory_len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Initialize the backend, bounded by the backend timeout
    pub async fn init(&self) -> Result<(), DeliveryError> {
        match &self.backend {
            Some(backend) => self.bounded(backend.init()).await,
            None => Ok(()),
        }
    }

    /// Backend connection check, false without backend
    pub async fn ping(&self) -> bool {
        match &self.backend {
            Some(backend) => tokio::time::timeout(self.options.backend_timeout, backend.ping())
                .await
                .unwrap_or_else(|_| {
                    error!("Timeout pinging persistence backend");
                    false
                }),
            None => false,
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, DeliveryError>>,
    ) -> Result<T, DeliveryError> {
        tokio::time::timeout(self.options.backend_timeout, call)
            .await
            .map_err(|_| DeliveryError::Timeout(self.options.backend_timeout))?
    }

    /// Keep an event, in memory always and durably when possible
    pub async fn append(&self, event: BusEvent, status: EventStatus) -> Persisted {
        let record = StoredEvent::new(event, status);
        debug!(event_id = %record.event.id, topic = %record.event.topic, "New event stored");
        Self::buffer_record(&mut *self.buffer.lock().await, &record);
        self.write_through(record).await
    }

    /// Keep an event received from another agent, unless it is already held
    ///
    /// Returns `None` for an event already in memory.
    pub async fn append_received(&self, event: BusEvent) -> Option<Persisted> {
        let record = StoredEvent::new(event, EventStatus::Sent);
        {
            let mut buffer = self.buffer.lock().await;
            if buffer.iter().any(|e| e.record.event.id == record.event.id) {
                return None;
            }
            Self::buffer_record(&mut buffer, &record);
        }
        trace!(event_id = %record.event.id, source = %record.event.source, "Received event stored");
        Some(self.write_through(record).await)
    }

    fn buffer_record(buffer: &mut FifoSizedQueue<BufferedEvent>, record: &StoredEvent) {
        let popped = buffer.put(BufferedEvent {
            record: record.clone(),
            durable: false,
        });
        if !popped.is_empty() {
            debug!(count = popped.len(), "Memory buffer full, dropped oldest events");
            metrics().record_buffer_overflow(popped.len() as u64);
        }
    }

    async fn write_through(&self, record: StoredEvent) -> Persisted {
        let id = record.event.id;
        self.maybe_evict().await;

        let Some(backend) = &self.backend else {
            return Persisted::MemoryOnly;
        };

        let expires_at = record.stored_at + self.ttl();
        match self.bounded(backend.store(&record, expires_at)).await {
            Ok(()) => {
                self.mark_durable(&[id]).await;
                Persisted::Durable
            }
            Err(e) => {
                error!(event_id = %id, error = %e, "Failed to persist event, keeping it in memory");
                metrics().record_persistence_degraded();
                Persisted::MemoryOnly
            }
        }
    }

    async fn mark_durable(&self, ids: &[Uuid]) {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        for entry in self.buffer.lock().await.iter_mut() {
            if ids.contains(&entry.record.event.id) {
                entry.durable = true;
            }
        }
    }

    /// Update the delivery status of a stored event
    pub async fn update_status(&self, id: Uuid, status: EventStatus) -> bool {
        debug!(event_id = %id, status = status.as_str(), "Updating event status");
        let mut found = false;
        {
            let mut buffer = self.buffer.lock().await;
            if let Some(entry) = buffer.iter_mut().find(|e| e.record.event.id == id) {
                entry.record.status = status;
                found = true;
            };
        }

        if let Some(backend) = &self.backend {
            match self.bounded(backend.update_status(id, status)).await {
                Ok(updated) => found |= updated,
                Err(e) => warn!(event_id = %id, error = %e, "Failed to update event status in backend"),
            }
        }

        found
    }

    /// Stored events on topics matching `filter`, above `after_seq`, oldest first
    pub async fn read_since(
        &self,
        filter: &str,
        source: Option<&str>,
        after_seq: u64,
    ) -> Vec<StoredEvent> {
        let in_memory: Vec<StoredEvent> = self
            .buffer
            .lock()
            .await
            .iter()
            .map(|e| &e.record)
            .filter(|r| topic_matches(filter, &r.event.topic))
            .filter(|r| source.map_or(true, |s| r.event.source == s))
            .filter(|r| r.event.seq > after_seq)
            .cloned()
            .collect();

        let in_backend = match &self.backend {
            Some(backend) => self
                .bounded(backend.read_since(filter, source, after_seq))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Backend unavailable for replay, using memory only");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        merge_records(in_backend, in_memory)
    }

    /// Stored events since a date with one of the given statuses
    pub async fn retrieve(
        &self,
        since: Option<DateTime<Utc>>,
        statuses: &[EventStatus],
    ) -> Vec<StoredEvent> {
        let in_memory: Vec<StoredEvent> = self
            .buffer
            .lock()
            .await
            .iter()
            .map(|e| &e.record)
            .filter(|r| since.map_or(true, |since| r.stored_at >= since))
            .filter(|r| statuses.is_empty() || statuses.contains(&r.status))
            .cloned()
            .collect();

        let in_backend = match &self.backend {
            Some(backend) => self
                .bounded(backend.retrieve(since, statuses))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Backend unavailable for retrieve, using memory only");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        merge_records(in_backend, in_memory)
    }

    /// Drop expired events from memory and from the backend
    pub async fn evict(&self) -> EvictionReport {
        *self.last_eviction.lock().await = tokio::time::Instant::now();
        let cutoff = Utc::now() - self.ttl();

        let memory_expired = {
            let mut buffer = self.buffer.lock().await;
            let before = buffer.len();
            buffer.retain(|e| e.record.stored_at >= cutoff);
            before - buffer.len()
        };

        let backend_purged = match &self.backend {
            Some(backend) => self
                .bounded(backend.purge_expired(Utc::now()))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Failed to purge expired events from backend");
                    0
                }),
            None => 0,
        };

        if memory_expired > 0 || backend_purged > 0 {
            info!(memory_expired, backend_purged, "Evicted expired events");
        }
        EvictionReport {
            memory_expired,
            backend_purged,
        }
    }

    /// Memory part of eviction, run from `append` at most once per sweep
    /// interval; the backend purge is left to the sweeper
    async fn maybe_evict(&self) {
        let mut last = self.last_eviction.lock().await;
        if last.elapsed() < self.options.sweep_interval {
            return;
        }
        *last = tokio::time::Instant::now();
        drop(last);

        let cutoff = Utc::now() - self.ttl();
        let mut buffer = self.buffer.lock().await;
        while buffer.front().is_some_and(|e| e.record.stored_at < cutoff) {
            buffer.pop();
        }
    }

    /// Write memory-only events to the backend once it answers again
    pub async fn flush(&self) -> usize {
        let Some(backend) = &self.backend else {
            return 0;
        };

        let pending: Vec<StoredEvent> = self
            .buffer
            .lock()
            .await
            .iter()
            .filter(|e| !e.durable)
            .map(|e| e.record.clone())
            .collect();
        if pending.is_empty() {
            return 0;
        }

        if !self.ping().await {
            warn!(pending = pending.len(), "No connection to backend to flush in-memory events");
            return 0;
        }

        let mut flushed = Vec::new();
        for record in &pending {
            let expires_at = record.stored_at + self.ttl();
            match self.bounded(backend.store(record, expires_at)).await {
                Ok(()) => flushed.push(record.event.id),
                Err(e) => {
                    warn!(error = %e, "Backend failed while flushing in-memory events");
                    break;
                }
            }
        }

        self.mark_durable(&flushed).await;
        if !flushed.is_empty() {
            info!(count = flushed.len(), "Flushed in-memory events to backend");
        }
        flushed.len()
    }

    /// Periodically evict expired events and flush memory-only ones
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Persistence sweeper stopped");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.flush().await;
                        self.evict().await;
                    }
                }
            }
        })
    }
}

/// Backend records first, then memory-only ones, deduplicated by id and
/// ordered by publication
fn merge_records(in_backend: Vec<StoredEvent>, in_memory: Vec<StoredEvent>) -> Vec<StoredEvent> {
    let mut seen = HashSet::new();
    let mut merged: Vec<StoredEvent> = Vec::with_capacity(in_backend.len() + in_memory.len());

    // Memory first so its status wins over a stale backend copy
    for record in in_memory.into_iter().chain(in_backend) {
        if seen.insert(record.event.id) {
            merged.push(record);
        }
    }

    merged.sort_by(|a, b| {
        a.event
            .published_at
            .cmp(&b.event.published_at)
            .then(a.event.seq.cmp(&b.event.seq))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::FailingBackend;
    use proptest::prelude::*;
    use serde_json::json;

    fn event(topic: &str, seq: u64) -> BusEvent {
        BusEvent::new(
            "timon",
            topic,
            seq,
            json!({"seq": seq}).as_object().cloned().unwrap_or_default(),
        )
    }

    fn with_backend(backend: Arc<dyn PersistenceBackend>) -> BusPersistence {
        BusPersistence::new(PersistenceOptions::default(), Some(backend))
    }

    proptest! {
        #[test]
        fn fifo_never_exceeds_size(size in 1usize..50, items in 0usize..200) {
            let mut queue = FifoSizedQueue::new(size);
            for i in 0..items {
                queue.put(i);
                prop_assert!(queue.len() <= size);
            }
            if items > 0 {
                let newest: Vec<usize> = queue.iter().copied().collect();
                let expected: Vec<usize> = (items.saturating_sub(size)..items).collect();
                prop_assert_eq!(newest, expected);
            }
        }
    }

    #[test]
    fn test_fifo_put_reports_popped() {
        let mut queue = FifoSizedQueue::new(2);
        assert!(queue.put(1).is_empty());
        assert!(queue.put(2).is_empty());
        assert!(queue.is_full());
        assert_eq!(queue.put(3), vec![1]);
        assert_eq!(queue.pop(), Some(2));
        assert!(!queue.is_full());
    }

    #[tokio::test]
    async fn test_memory_only_append_and_read() {
        let store = BusPersistence::in_memory(100);
        for seq in 1..=3 {
            assert_eq!(
                store.append(event("timon", seq), EventStatus::Sent).await,
                Persisted::MemoryOnly
            );
        }
        store.append(event("pumbaa", 1), EventStatus::Sent).await;

        let replay = store.read_since("timon", None, 1).await;
        let seqs: Vec<u64> = replay.iter().map(|r| r.event.seq).collect();
        assert_eq!(seqs, vec![2, 3]);

        assert_eq!(store.read_since("#", None, 0).await.len(), 4);
        assert!(store.read_since("timon", Some("pumbaa"), 0).await.is_empty());
    }

    #[tokio::test]
    async fn test_received_events_stored_once() {
        let store = BusPersistence::in_memory(10);
        let remote = BusEvent::new("pumbaa", "pumbaa", 1, Default::default());

        assert_eq!(
            store.append_received(remote.clone()).await,
            Some(Persisted::MemoryOnly)
        );
        assert_eq!(store.append_received(remote.clone()).await, None);

        let stored = store.read_since("pumbaa", Some("pumbaa"), 0).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event.id, remote.id);
        assert_eq!(stored[0].status, EventStatus::Sent);
    }

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let store = BusPersistence::in_memory(5);
        for seq in 1..=12 {
            store.append(event("timon", seq), EventStatus::Sent).await;
        }
        assert_eq!(store.memory_len().await, 5);
        let seqs: Vec<u64> = store
            .read_since("timon", None, 0)
            .await
            .iter()
            .map(|r| r.event.seq)
            .collect();
        assert_eq!(seqs, vec![8, 9, 10, 11, 12]);
    }

    #[tokio::test]
    async fn test_durable_append() {
        let backend = MemoryBackend::new();
        let store = with_backend(Arc::new(backend.clone()));
        let result = store.append(event("timon", 1), EventStatus::Sent).await;
        assert_eq!(result, Persisted::Durable);
        assert_eq!(backend.len().await, 1);

        // Deduplicated between memory and backend
        assert_eq!(store.read_since("timon", None, 0).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades_to_memory() {
        let store = with_backend(Arc::new(FailingBackend::new()));
        let result = store.append(event("timon", 1), EventStatus::Sent).await;
        assert_eq!(result, Persisted::MemoryOnly);
        assert_eq!(store.read_since("timon", None, 0).await.len(), 1);
        assert_eq!(store.flush().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_backend_is_bounded() {
        let store = with_backend(Arc::new(FailingBackend::hanging()));
        let result = store.append(event("timon", 1), EventStatus::Sent).await;
        assert_eq!(result, Persisted::MemoryOnly);
        assert!(!store.ping().await);
    }

    #[tokio::test]
    async fn test_flush_after_backend_recovers() {
        let failing = FailingBackend::new();
        let store = with_backend(Arc::new(failing.clone()));
        store.append(event("timon", 1), EventStatus::NotConnected).await;
        store.append(event("timon", 2), EventStatus::Sent).await;

        failing.set_available(true);
        assert_eq!(store.flush().await, 2);
        assert_eq!(failing.inner().len().await, 2);
        assert_eq!(store.flush().await, 0);
    }

    #[tokio::test]
    async fn test_update_status_and_retrieve() {
        let store = BusPersistence::in_memory(10);
        let first = event("timon", 1);
        let first_id = first.id;
        store.append(first, EventStatus::Sent).await;
        store.append(event("timon", 2), EventStatus::NotConnected).await;

        assert!(store.update_status(first_id, EventStatus::Failed).await);
        assert!(!store.update_status(Uuid::new_v4(), EventStatus::Sent).await);

        let undelivered = store.retrieve(None, &EventStatus::undelivered()).await;
        assert_eq!(undelivered.len(), 2);
        assert_eq!(undelivered[0].status, EventStatus::Failed);

        let future = Utc::now() + chrono::Duration::minutes(1);
        assert!(store.retrieve(Some(future), &[]).await.is_empty());
        assert_eq!(store.retrieve(None, &[EventStatus::Sent]).await.len(), 0);
    }

    #[tokio::test]
    async fn test_update_status_reaches_backend() {
        let backend = MemoryBackend::new();
        let store = with_backend(Arc::new(backend.clone()));
        let pending = event("timon", 1);
        let id = pending.id;
        store.append(pending, EventStatus::NotConnected).await;

        assert!(store.update_status(id, EventStatus::Sent).await);
        let stored = backend.retrieve(None, &[EventStatus::Sent]).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].event.id, id);
        assert!(store
            .retrieve(None, &EventStatus::undelivered())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_evict_drops_expired_events() {
        let backend = MemoryBackend::new();
        let store = BusPersistence::new(
            PersistenceOptions {
                ttl_minutes: 1,
                ..PersistenceOptions::default()
            },
            Some(Arc::new(backend.clone())),
        );

        let mut old = StoredEvent::new(event("timon", 1), EventStatus::Sent);
        old.stored_at = Utc::now() - chrono::Duration::minutes(5);
        backend
            .store(&old, old.stored_at + chrono::Duration::minutes(1))
            .await
            .unwrap();
        store
            .buffer
            .lock()
            .await
            .put(BufferedEvent {
                record: old,
                durable: true,
            });
        store.append(event("timon", 2), EventStatus::Sent).await;

        let report = store.evict().await;
        assert_eq!(report.memory_expired, 1);
        assert_eq!(report.backend_purged, 1);

        let seqs: Vec<u64> = store
            .read_since("timon", None, 0)
            .await
            .iter()
            .map(|r| r.event.seq)
            .collect();
        assert_eq!(seqs, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_and_stops() {
        let failing = FailingBackend::new();
        let store = Arc::new(with_backend(Arc::new(failing.clone())));
        store.append(event("timon", 1), EventStatus::Sent).await;
        failing.set_available(true);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = store.clone().spawn_sweeper(Duration::from_secs(5), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(failing.inner().len().await, 1);

        shutdown_tx.send_replace(true);
        sweeper.await.unwrap();
    }

    #[test]
    fn test_merge_prefers_memory_status() {
        let record = StoredEvent::new(event("timon", 1), EventStatus::Sent);
        let mut stale = record.clone();
        stale.status = EventStatus::NotConnected;
        let merged = merge_records(vec![stale], vec![record]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, EventStatus::Sent);
    }
}
