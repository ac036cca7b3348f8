//! PostgreSQL persistence backend

use super::{DeliveryError, PersistenceBackend};
use crate::config::TlsSection;
use crate::protocol::{is_wildcard, topic_matches, BusEvent, EventStatus, StoredEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Open a connection pool, optionally on another database than the URL's
pub async fn connect_pool(
    url: &str,
    database: Option<&str>,
    tls: &TlsSection,
) -> Result<PgPool, sqlx::Error> {
    let mut options = PgConnectOptions::from_str(url)?;
    if let Some(database) = database {
        options = options.database(database);
    }
    if tls.require {
        options = options.ssl_mode(PgSslMode::VerifyFull);
    }
    if let Some(ca_file) = &tls.ca_file {
        options = options.ssl_root_cert(ca_file.as_str());
    }

    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(2))
        .connect_with(options)
        .await
}

fn query_error(e: sqlx::Error) -> DeliveryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            DeliveryError::Unavailable(e.to_string())
        }
        other => DeliveryError::Query(other.to_string()),
    }
}

fn row_to_record(row: &PgRow) -> Result<StoredEvent, DeliveryError> {
    let status: String = row.get("status");
    let status = EventStatus::parse(&status)
        .ok_or_else(|| DeliveryError::Corrupted(format!("unknown status '{status}'")))?;
    let payload: serde_json::Value = row.get("payload");
    let seq: i64 = row.get("seq");

    Ok(StoredEvent {
        event: BusEvent {
            id: row.get("id"),
            source: row.get("source"),
            topic: row.get("topic"),
            epoch: row.get("epoch"),
            seq: seq.max(0) as u64,
            payload: crate::protocol::payload_from_value(payload),
            published_at: row.get("published_at"),
        },
        status,
        stored_at: row.get("stored_at"),
    })
}

/// Bus events stored in a `bus_events` table
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, tls: &TlsSection) -> Result<Self, DeliveryError> {
        let pool = connect_pool(url, None, tls).await.map_err(query_error)?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl PersistenceBackend for PostgresBackend {
    async fn init(&self) -> Result<(), DeliveryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bus_events (
                id UUID PRIMARY KEY,
                source TEXT NOT NULL,
                topic TEXT NOT NULL,
                epoch UUID NOT NULL,
                seq BIGINT NOT NULL,
                payload JSONB NOT NULL,
                published_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                stored_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        sqlx::query(
            "ALTER TABLE bus_events ADD COLUMN IF NOT EXISTS epoch UUID NOT NULL \
             DEFAULT '00000000-0000-0000-0000-000000000000'",
        )
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS bus_events_topic ON bus_events (topic, seq)")
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS bus_events_expiry ON bus_events (expires_at)")
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn store(
        &self,
        record: &StoredEvent,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        let event = &record.event;
        sqlx::query(
            r#"
            INSERT INTO bus_events
                (id, source, topic, epoch, seq, payload, published_at, status, stored_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(event.id)
        .bind(&event.source)
        .bind(&event.topic)
        .bind(event.epoch)
        .bind(event.seq as i64)
        .bind(serde_json::Value::Object(event.payload.clone()))
        .bind(event.published_at)
        .bind(record.status.as_str())
        .bind(record.stored_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: EventStatus) -> Result<bool, DeliveryError> {
        let result = sqlx::query("UPDATE bus_events SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn read_since(
        &self,
        filter: &str,
        source: Option<&str>,
        after_seq: u64,
    ) -> Result<Vec<StoredEvent>, DeliveryError> {
        // Wildcard filters are narrowed in SQL by their literal prefix and
        // matched exactly here
        let pattern = if is_wildcard(filter) {
            let literal: Vec<&str> = filter
                .split('/')
                .take_while(|level| *level != "+" && *level != "#")
                .collect();
            format!("{}%", literal.join("/").replace('%', "\\%").replace('_', "\\_"))
        } else {
            filter.replace('%', "\\%").replace('_', "\\_")
        };

        let rows = sqlx::query(
            r#"
            SELECT id, source, topic, epoch, seq, payload, published_at, status, stored_at
            FROM bus_events
            WHERE topic LIKE $1
              AND ($2::TEXT IS NULL OR source = $2)
              AND seq > $3
              AND expires_at > NOW()
            ORDER BY published_at, seq
            "#,
        )
        .bind(pattern)
        .bind(source)
        .bind(after_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = row_to_record(row)?;
            if topic_matches(filter, &record.event.topic) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn retrieve(
        &self,
        since: Option<DateTime<Utc>>,
        statuses: &[EventStatus],
    ) -> Result<Vec<StoredEvent>, DeliveryError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, source, topic, epoch, seq, payload, published_at, status, stored_at
            FROM bus_events
            WHERE ($1::TIMESTAMPTZ IS NULL OR stored_at >= $1)
              AND (cardinality($2::TEXT[]) = 0 OR status = ANY($2))
              AND expires_at > NOW()
            ORDER BY stored_at
            "#,
        )
        .bind(since)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DeliveryError> {
        let result = sqlx::query("DELETE FROM bus_events WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected())
    }
}
