//! Raw-event store: the system's recovery log.
//!
//! Rows are written exclusively by the gateway through `upsert`; every other
//! component only reads. Uniqueness on `message_id` is what turns broker
//! redeliveries into idempotent no-ops downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RawEvent {
    pub id: i64,
    pub message_id: String,
    pub event_type: String,
    pub event_time: Option<DateTime<Utc>>,
    pub payload: JsonValue,
    pub checksum: String,
    pub processed_at: DateTime<Utc>,
}

/// Row to persist; the id is assigned by the database.
#[derive(Debug, Clone)]
pub struct NewRawEvent {
    pub message_id: String,
    pub event_type: String,
    pub event_time: Option<DateTime<Utc>>,
    pub payload: JsonValue,
    pub checksum: String,
    pub processed_at: DateTime<Utc>,
}

/// Search criteria for the control-plane queries; all fields optional, ANDed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub message_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RawEventStore {
    pool: PgPool,
}

impl RawEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert the row, or on conflict by `message_id` overwrite everything
    /// but the id. Returns only after the row is durable.
    pub async fn upsert(&self, event: &NewRawEvent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO evt_raw_events
                (message_id, event_type, event_time, payload, checksum, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (message_id) DO UPDATE
            SET event_type = EXCLUDED.event_type,
                event_time = EXCLUDED.event_time,
                payload = EXCLUDED.payload,
                checksum = EXCLUDED.checksum,
                processed_at = EXCLUDED.processed_at
            "#,
        )
        .bind(&event.message_id)
        .bind(&event.event_type)
        .bind(event.event_time)
        .bind(&event.payload)
        .bind(&event.checksum)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            message_id = %event.message_id,
            event_type = %event.event_type,
            "Raw event upserted"
        );

        Ok(())
    }

    pub async fn find_by_filter(
        &self,
        filter: &EventFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RawEvent>, sqlx::Error> {
        sqlx::query_as::<_, RawEvent>(
            r#"
            SELECT id, message_id, event_type, event_time, payload, checksum, processed_at
            FROM evt_raw_events
            WHERE ($1::text IS NULL OR event_type = $1)
              AND ($2::text IS NULL OR message_id = $2)
              AND ($3::timestamptz IS NULL OR processed_at >= $3)
              AND ($4::timestamptz IS NULL OR processed_at < $4)
            ORDER BY processed_at DESC, id DESC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(&filter.event_type)
        .bind(&filter.message_id)
        .bind(filter.from)
        .bind(filter.to)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn count_by_filter(&self, filter: &EventFilter) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM evt_raw_events
            WHERE ($1::text IS NULL OR event_type = $1)
              AND ($2::text IS NULL OR message_id = $2)
              AND ($3::timestamptz IS NULL OR processed_at >= $3)
              AND ($4::timestamptz IS NULL OR processed_at < $4)
            "#,
        )
        .bind(&filter.event_type)
        .bind(&filter.message_id)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_one(&self.pool)
        .await
    }

    /// Fetch rows for resend, in id order.
    pub async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<RawEvent>, sqlx::Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, RawEvent>(
            r#"
            SELECT id, message_id, event_type, event_time, payload, checksum, processed_at
            FROM evt_raw_events
            WHERE id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
    }
}
