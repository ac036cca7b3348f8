//! Workflow execution history
//!
//! Every instance is written here when it is created and again whenever its
//! state changes. Stores answer the filtered, sorted and paginated queries of
//! the history API.

pub mod api;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod query;

pub use api::HistoryServer;
#[cfg(feature = "postgres")]
pub use postgres::PostgresHistoryStore;
pub use query::{HistoryOrdering, HistoryQuery};

use crate::workflow::{Edge, TaskDefinition, TaskExecution, WorkflowInstance, WorkflowTemplate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History store error: {0}")]
    Store(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Corrupted history record: {0}")]
    Corrupted(String),
}

/// Task graph of the template an instance was created from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskGraph {
    pub tasks: Vec<TaskDefinition>,
    pub edges: Vec<Edge>,
}

/// History document for one instance
///
/// `graph` and `executions` are only returned for `full` lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    #[serde(flatten)]
    pub instance: WorkflowInstance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<TaskGraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executions: Option<Vec<TaskExecution>>,
}

impl InstanceRecord {
    pub fn full(
        instance: WorkflowInstance,
        template: &WorkflowTemplate,
        executions: Vec<TaskExecution>,
    ) -> Self {
        Self {
            instance,
            graph: Some(TaskGraph {
                tasks: template.tasks.clone(),
                edges: template.edges.clone(),
            }),
            executions: Some(executions),
        }
    }

    pub fn summary(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            graph: None,
            executions: None,
        }
    }

    fn shaped(&self, full: bool) -> Self {
        if full {
            self.clone()
        } else {
            self.summary()
        }
    }
}

/// One page of query results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryPage {
    /// Matches before pagination
    pub count: usize,
    pub data: Vec<InstanceRecord>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Prepare the store (create tables, etc.)
    async fn init(&self) -> Result<(), HistoryError> {
        Ok(())
    }

    /// Insert or replace the record of `record.instance.id`
    async fn upsert(&self, record: &InstanceRecord) -> Result<(), HistoryError>;

    async fn get_one(&self, id: Uuid, full: bool) -> Result<Option<InstanceRecord>, HistoryError>;

    async fn query(&self, query: &HistoryQuery) -> Result<HistoryPage, HistoryError>;
}

/// History kept in process memory
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: RwLock<HashMap<Uuid, InstanceRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn upsert(&self, record: &InstanceRecord) -> Result<(), HistoryError> {
        self.records
            .write()
            .await
            .insert(record.instance.id, record.clone());
        Ok(())
    }

    async fn get_one(&self, id: Uuid, full: bool) -> Result<Option<InstanceRecord>, HistoryError> {
        Ok(self
            .records
            .read()
            .await
            .get(&id)
            .map(|record| record.shaped(full)))
    }

    async fn query(&self, query: &HistoryQuery) -> Result<HistoryPage, HistoryError> {
        let records = self.records.read().await;
        let mut matches: Vec<&InstanceRecord> = records
            .values()
            .filter(|record| query.matches(&record.instance))
            .collect();
        matches.sort_by(|a, b| query.ordering.compare(&a.instance, &b.instance));

        let count = matches.len();
        let data = query
            .page(matches)
            .into_iter()
            .map(|record| record.shaped(query.full))
            .collect();
        Ok(HistoryPage { count, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;
    use crate::workflow::InstanceState;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn record(title: &str, root: bool, state: InstanceState, end_minute: Option<u32>) -> InstanceRecord {
        let mut instance = WorkflowInstance::new("wf", title, root, Payload::new());
        instance.start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        instance.state = state;
        instance.end = end_minute.map(|m| instance.start + Duration::minutes(m as i64));
        let template: WorkflowTemplate = serde_json::from_value(json!({
            "id": "wf",
            "tasks": [{"id": "a", "type": "sleep"}]
        }))
        .unwrap();
        InstanceRecord::full(instance, &template, Vec::new())
    }

    fn query(params: &[(&str, &str)]) -> HistoryQuery {
        let params: HashMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HistoryQuery::from_params(&params).unwrap()
    }

    #[tokio::test]
    async fn test_end_desc_with_limit() {
        let store = MemoryHistoryStore::new();
        for (title, end) in [("t1", 1), ("t3", 3), ("t2", 2)] {
            store
                .upsert(&record(title, true, InstanceState::Finished, Some(end)))
                .await
                .unwrap();
        }

        let page = store
            .query(&query(&[("ordering", "end_desc"), ("limit", "2")]))
            .await
            .unwrap();
        assert_eq!(page.count, 3);
        let titles: Vec<&str> = page.data.iter().map(|r| r.instance.title.as_str()).collect();
        assert_eq!(titles, vec!["t3", "t2"]);
        assert!(page.data[0].graph.is_none());
    }

    #[tokio::test]
    async fn test_state_and_root_filter() {
        let store = MemoryHistoryStore::new();
        store.upsert(&record("a", true, InstanceState::Finished, Some(1))).await.unwrap();
        store.upsert(&record("b", false, InstanceState::Finished, Some(2))).await.unwrap();
        store.upsert(&record("c", true, InstanceState::Exception, Some(3))).await.unwrap();
        store.upsert(&record("d", true, InstanceState::Running, None)).await.unwrap();

        let page = store
            .query(&query(&[("state", "finished"), ("root", "1")]))
            .await
            .unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.data[0].instance.title, "a");
    }

    #[tokio::test]
    async fn test_null_end_sorts_lowest() {
        let store = MemoryHistoryStore::new();
        store.upsert(&record("running", true, InstanceState::Running, None)).await.unwrap();
        store.upsert(&record("done", true, InstanceState::Finished, Some(5))).await.unwrap();

        let desc = store.query(&query(&[])).await.unwrap();
        assert_eq!(desc.data[0].instance.title, "done");
        assert_eq!(desc.data[1].instance.title, "running");

        let asc = store.query(&query(&[("ordering", "end_asc")])).await.unwrap();
        assert_eq!(asc.data[0].instance.title, "running");
    }

    /// Finished instance started `minute` minutes after 10:00
    fn started(title: &str, minute: i64) -> InstanceRecord {
        let mut stored = record(title, true, InstanceState::Finished, Some(1));
        stored.instance.start += Duration::minutes(minute);
        stored.instance.end = Some(stored.instance.start + Duration::minutes(1));
        stored
    }

    async fn titles(store: &MemoryHistoryStore, params: &[(&str, &str)]) -> (usize, Vec<String>) {
        let page = store.query(&query(params)).await.unwrap();
        let titles = page.data.iter().map(|r| r.instance.title.clone()).collect();
        (page.count, titles)
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_substring() {
        let store = MemoryHistoryStore::new();
        for (title, minute) in [("Greet Timon", 0), ("re-greeting pumbaa", 10), ("Audit", 20)] {
            store.upsert(&started(title, minute)).await.unwrap();
        }

        let (count, found) = titles(&store, &[("search", "GREET"), ("ordering", "start_asc")]).await;
        assert_eq!(count, 2);
        assert_eq!(found, vec!["Greet Timon", "re-greeting pumbaa"]);

        let (count, _) = titles(&store, &[("search", "zazu")]).await;
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_since_keeps_later_starts() {
        let store = MemoryHistoryStore::new();
        for (title, minute) in [("early", 0), ("mid", 30), ("late", 60)] {
            store.upsert(&started(title, minute)).await.unwrap();
        }

        let (count, found) = titles(
            &store,
            &[("since", "2024-01-01T10:30:00Z"), ("ordering", "start_asc")],
        )
        .await;
        assert_eq!(count, 2);
        assert_eq!(found, vec!["mid", "late"]);

        let (count, _) = titles(&store, &[("since", "2024-01-01")]).await;
        assert_eq!(count, 3);
        let (count, _) = titles(&store, &[("since", "2024-01-02")]).await;
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_start_ordering_both_ways() {
        let store = MemoryHistoryStore::new();
        for (title, minute) in [("b", 20), ("c", 0), ("a", 10)] {
            store.upsert(&started(title, minute)).await.unwrap();
        }

        let (_, asc) = titles(&store, &[("ordering", "start_asc")]).await;
        assert_eq!(asc, vec!["c", "a", "b"]);
        let (_, desc) = titles(&store, &[("ordering", "start_desc")]).await;
        assert_eq!(desc, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_offset_pages_through_sorted_records() {
        let store = MemoryHistoryStore::new();
        for (title, minute) in [("first", 0), ("second", 10), ("third", 20)] {
            store.upsert(&started(title, minute)).await.unwrap();
        }

        let (count, page) = titles(
            &store,
            &[("ordering", "start_asc"), ("offset", "1"), ("limit", "1")],
        )
        .await;
        assert_eq!(count, 3);
        assert_eq!(page, vec!["second"]);

        let (_, rest) = titles(&store, &[("ordering", "start_asc"), ("offset", "1")]).await;
        assert_eq!(rest, vec!["second", "third"]);

        let (count, past_end) = titles(&store, &[("offset", "5")]).await;
        assert_eq!(count, 3);
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_get_one_full_and_summary() {
        let store = MemoryHistoryStore::new();
        let stored = record("a", true, InstanceState::Finished, Some(1));
        store.upsert(&stored).await.unwrap();

        let full = store.get_one(stored.instance.id, true).await.unwrap().unwrap();
        assert_eq!(full, stored);
        let summary = store.get_one(stored.instance.id, false).await.unwrap().unwrap();
        assert!(summary.graph.is_none() && summary.executions.is_none());
        assert!(store.get_one(Uuid::new_v4(), true).await.unwrap().is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let stored = record("a", true, InstanceState::Finished, Some(1));
        let value = serde_json::to_value(stored.summary()).unwrap();
        assert_eq!(value["title"], "a");
        assert_eq!(value["template"], "wf");
        assert_eq!(value["state"], "finished");
        assert!(value.get("graph").is_none());

        let full = serde_json::to_value(&stored).unwrap();
        assert_eq!(full["graph"]["tasks"][0]["type"], "sleep");
        let back: InstanceRecord = serde_json::from_value(full).unwrap();
        assert_eq!(back, stored);
    }
}
