//! In-process durable backend
//!
//! Cloning a [`MemoryBackend`] shares its records, so several agents in one
//! process can use it as a common store the way they would share a database.

use super::{DeliveryError, PersistenceBackend};
use crate::protocol::{topic_matches, EventStatus, StoredEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Row {
    record: StoredEvent,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    rows: Arc<RwLock<Vec<Row>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn store(
        &self,
        record: &StoredEvent,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        let mut rows = self.rows.write().await;
        let row = Row {
            record: record.clone(),
            expires_at,
        };
        match rows.iter_mut().find(|r| r.record.event.id == record.event.id) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: EventStatus) -> Result<bool, DeliveryError> {
        let mut rows = self.rows.write().await;
        Ok(rows
            .iter_mut()
            .find(|r| r.record.event.id == id)
            .map(|r| r.record.status = status)
            .is_some())
    }

    async fn read_since(
        &self,
        filter: &str,
        source: Option<&str>,
        after_seq: u64,
    ) -> Result<Vec<StoredEvent>, DeliveryError> {
        let now = Utc::now();
        let rows = self.rows.read().await;
        let mut records: Vec<StoredEvent> = rows
            .iter()
            .filter(|r| r.expires_at > now)
            .map(|r| &r.record)
            .filter(|r| topic_matches(filter, &r.event.topic))
            .filter(|r| source.map_or(true, |s| r.event.source == s))
            .filter(|r| r.event.seq > after_seq)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.event.published_at.cmp(&b.event.published_at));
        Ok(records)
    }

    async fn retrieve(
        &self,
        since: Option<DateTime<Utc>>,
        statuses: &[EventStatus],
    ) -> Result<Vec<StoredEvent>, DeliveryError> {
        let now = Utc::now();
        let rows = self.rows.read().await;
        let mut records: Vec<StoredEvent> = rows
            .iter()
            .filter(|r| r.expires_at > now)
            .map(|r| &r.record)
            .filter(|r| since.map_or(true, |since| r.stored_at >= since))
            .filter(|r| statuses.is_empty() || statuses.contains(&r.status))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.stored_at.cmp(&b.stored_at));
        Ok(records)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DeliveryError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|r| r.expires_at > now);
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BusEvent, Payload};
    use chrono::Duration;

    fn record(source: &str, topic: &str, seq: u64) -> StoredEvent {
        StoredEvent::new(BusEvent::new(source, topic, seq, Payload::new()), EventStatus::Sent)
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let backend = MemoryBackend::new();
        let other = backend.clone();
        backend
            .store(&record("timon", "timon", 1), Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(other.len().await, 1);
    }

    #[tokio::test]
    async fn test_store_overwrites_same_id() {
        let backend = MemoryBackend::new();
        let mut r = record("timon", "timon", 1);
        let expires = Utc::now() + Duration::minutes(1);
        backend.store(&r, expires).await.unwrap();
        r.status = EventStatus::Failed;
        backend.store(&r, expires).await.unwrap();

        let all = backend.retrieve(None, &[]).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, EventStatus::Failed);
    }

    #[tokio::test]
    async fn test_read_since_filters() {
        let backend = MemoryBackend::new();
        let expires = Utc::now() + Duration::minutes(1);
        for (source, topic, seq) in [
            ("timon", "timon", 1),
            ("timon", "timon", 2),
            ("pumbaa", "timon", 1),
            ("timon", "workflow/instances/1", 1),
        ] {
            backend.store(&record(source, topic, seq), expires).await.unwrap();
        }

        assert_eq!(backend.read_since("timon", None, 0).await.unwrap().len(), 3);
        assert_eq!(backend.read_since("timon", Some("timon"), 1).await.unwrap().len(), 1);
        assert_eq!(backend.read_since("workflow/#", None, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_records_are_hidden_and_purged() {
        let backend = MemoryBackend::new();
        let past = Utc::now() - Duration::seconds(1);
        backend.store(&record("timon", "timon", 1), past).await.unwrap();
        backend
            .store(&record("timon", "timon", 2), Utc::now() + Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(backend.read_since("timon", None, 0).await.unwrap().len(), 1);
        assert_eq!(backend.purge_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_status() {
        let backend = MemoryBackend::new();
        assert!(!backend.update_status(Uuid::new_v4(), EventStatus::Sent).await.unwrap());
    }
}
