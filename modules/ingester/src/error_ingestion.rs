//! Error-ingestion rows: the operator-visible record of failed processing.
//!
//! Writes are strictly best-effort: a failure to record an error must never
//! mask the processing failure that caused it, so every store error here is
//! logged and swallowed.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Mutex;

/// Longest error text persisted; anything beyond is truncated.
pub const MAX_ERROR_LENGTH: usize = 4000;

#[async_trait]
pub trait ErrorIngestion: Send + Sync {
    /// Record a processing failure for a message.
    async fn record(&self, message_id: &str, error: &str);
    /// Remove every error row for a message (called after a successful
    /// resend).
    async fn clear(&self, message_id: &str);
}

pub fn truncate_error(error: &str) -> String {
    if error.chars().count() <= MAX_ERROR_LENGTH {
        error.to_string()
    } else {
        error.chars().take(MAX_ERROR_LENGTH).collect()
    }
}

#[derive(Clone)]
pub struct ErrorIngestionStore {
    pool: PgPool,
}

impl ErrorIngestionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ErrorIngestion for ErrorIngestionStore {
    async fn record(&self, message_id: &str, error: &str) {
        let result = sqlx::query(
            r#"
            INSERT INTO evt_error_ingestion (message_id, ingestion_time, error_message)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(message_id)
        .bind(Utc::now())
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                message_id = %message_id,
                error = %e,
                "Failed to persist error-ingestion row"
            );
        }
    }

    async fn clear(&self, message_id: &str) {
        match sqlx::query("DELETE FROM evt_error_ingestion WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
        {
            Ok(done) if done.rows_affected() > 0 => {
                tracing::info!(
                    message_id = %message_id,
                    cleared = done.rows_affected(),
                    "Cleared error-ingestion rows after successful reprocess"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    message_id = %message_id,
                    error = %e,
                    "Failed to clear error-ingestion rows"
                );
            }
        }
    }
}

/// In-process error sink for dev and tests.
#[derive(Default)]
pub struct InMemoryErrorIngestion {
    rows: Mutex<Vec<(String, String)>>,
}

impl InMemoryErrorIngestion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_for(&self, message_id: &str) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == message_id)
            .map(|(_, error)| error.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ErrorIngestion for InMemoryErrorIngestion {
    async fn record(&self, message_id: &str, error: &str) {
        self.rows
            .lock()
            .unwrap()
            .push((message_id.to_string(), truncate_error(error)));
    }

    async fn clear(&self, message_id: &str) {
        self.rows.lock().unwrap().retain(|(id, _)| id != message_id);
    }
}
