//! PostgreSQL history store

use super::{HistoryError, HistoryPage, HistoryQuery, HistoryStore, InstanceRecord, TaskGraph};
use crate::config::TlsSection;
use crate::persistence::postgres::connect_pool;
use crate::protocol::payload_from_value;
use crate::workflow::{InstanceState, TaskExecution, WorkflowInstance};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn store_error(e: sqlx::Error) -> HistoryError {
    HistoryError::Store(e.to_string())
}

fn json_error(e: serde_json::Error) -> HistoryError {
    HistoryError::Corrupted(e.to_string())
}

/// Escape `LIKE` metacharacters in user input
fn like_pattern(search: &str) -> String {
    let escaped = search
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

const COLUMNS: &str = "id, template, title, root, state, start_at, end_at, payload";
const FULL_COLUMNS: &str =
    "id, template, title, root, state, start_at, end_at, payload, graph, executions";

/// Shared `WHERE` clause, binds $1..$4
const FILTER: &str = r#"
    WHERE ($1::BOOLEAN = FALSE OR root)
      AND ($2::TEXT IS NULL OR title ILIKE $2 ESCAPE '\')
      AND ($3::TIMESTAMPTZ IS NULL OR start_at >= $3)
      AND ($4::TEXT IS NULL OR state = $4)
"#;

fn row_to_record(row: &PgRow, full: bool) -> Result<InstanceRecord, HistoryError> {
    let state: String = row.get("state");
    let state = InstanceState::parse(&state)
        .ok_or_else(|| HistoryError::Corrupted(format!("unknown state '{state}'")))?;
    let payload: Value = row.get("payload");

    let instance = WorkflowInstance {
        id: row.get("id"),
        template_id: row.get("template"),
        title: row.get("title"),
        root: row.get("root"),
        state,
        start: row.get("start_at"),
        end: row.get("end_at"),
        payload: payload_from_value(payload),
    };

    if !full {
        return Ok(InstanceRecord {
            instance,
            graph: None,
            executions: None,
        });
    }

    let graph: Option<Value> = row.get("graph");
    let executions: Option<Value> = row.get("executions");
    Ok(InstanceRecord {
        instance,
        graph: graph
            .map(serde_json::from_value::<TaskGraph>)
            .transpose()
            .map_err(json_error)?,
        executions: executions
            .map(serde_json::from_value::<Vec<TaskExecution>>)
            .transpose()
            .map_err(json_error)?,
    })
}

/// Instances stored in a `workflow_instances` table
#[derive(Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, database: &str, tls: &TlsSection) -> Result<Self, HistoryError> {
        let pool = connect_pool(url, Some(database), tls)
            .await
            .map_err(store_error)?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    async fn init(&self) -> Result<(), HistoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id UUID PRIMARY KEY,
                template TEXT NOT NULL,
                title TEXT NOT NULL,
                root BOOLEAN NOT NULL,
                state TEXT NOT NULL,
                start_at TIMESTAMPTZ NOT NULL,
                end_at TIMESTAMPTZ,
                payload JSONB NOT NULL,
                graph JSONB,
                executions JSONB
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS workflow_instances_end ON workflow_instances (end_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn upsert(&self, record: &InstanceRecord) -> Result<(), HistoryError> {
        let instance = &record.instance;
        let graph = record
            .graph
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(json_error)?;
        let executions = record
            .executions
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(json_error)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_instances
                (id, template, title, root, state, start_at, end_at, payload, graph, executions)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                end_at = EXCLUDED.end_at,
                payload = EXCLUDED.payload,
                graph = COALESCE(EXCLUDED.graph, workflow_instances.graph),
                executions = COALESCE(EXCLUDED.executions, workflow_instances.executions)
            "#,
        )
        .bind(instance.id)
        .bind(&instance.template_id)
        .bind(&instance.title)
        .bind(instance.root)
        .bind(instance.state.as_str())
        .bind(instance.start)
        .bind(instance.end)
        .bind(Value::Object(instance.payload.clone()))
        .bind(graph)
        .bind(executions)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn get_one(&self, id: Uuid, full: bool) -> Result<Option<InstanceRecord>, HistoryError> {
        let sql = format!("SELECT {FULL_COLUMNS} FROM workflow_instances WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.map(|row| row_to_record(&row, full)).transpose()
    }

    async fn query(&self, query: &HistoryQuery) -> Result<HistoryPage, HistoryError> {
        let search = query.search.as_deref().map(like_pattern);
        let state = query.state.map(|s| s.as_str());

        let count_sql = format!("SELECT COUNT(*) AS count FROM workflow_instances {FILTER}");
        let count: i64 = sqlx::query(&count_sql)
            .bind(query.root_only)
            .bind(&search)
            .bind(query.since)
            .bind(state)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?
            .get("count");

        let columns = if query.full { FULL_COLUMNS } else { COLUMNS };
        // LIMIT NULL is LIMIT ALL
        let data_sql = format!(
            "SELECT {columns} FROM workflow_instances {FILTER} ORDER BY {} LIMIT $5 OFFSET $6",
            query.ordering.order_by()
        );
        let rows = sqlx::query(&data_sql)
            .bind(query.root_only)
            .bind(&search)
            .bind(query.since)
            .bind(state)
            .bind(query.limit.map(|limit| limit as i64))
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        let data = rows
            .iter()
            .map(|row| row_to_record(row, query.full))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HistoryPage {
            count: count.max(0) as usize,
            data,
        })
    }
}
