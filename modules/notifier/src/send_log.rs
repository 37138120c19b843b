//! The audited send log. Every outgoing email gets a row in PENDING before
//! submission; the status then follows the linear lifecycle
//! PENDING -> SENT | FAILED, with RETRY -> SENT | RETRY for the sweep.

use crate::NotifyError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Pending,
    Sent,
    Failed,
    Retry,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Pending => "PENDING",
            SendStatus::Sent => "SENT",
            SendStatus::Failed => "FAILED",
            SendStatus::Retry => "RETRY",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(SendStatus::Pending),
            "SENT" => Some(SendStatus::Sent),
            "FAILED" => Some(SendStatus::Failed),
            "RETRY" => Some(SendStatus::Retry),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSendLog {
    pub template_id: Option<i64>,
    pub template_code: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub variables: Option<JsonValue>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub sent_by: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SendLogEntry {
    pub id: i64,
    pub template_id: Option<i64>,
    pub template_code: Option<String>,
    pub to_json: JsonValue,
    pub cc_json: JsonValue,
    pub bcc_json: JsonValue,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub status: String,
    pub message_id: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SendLogEntry {
    fn addresses(value: &JsonValue) -> Vec<String> {
        value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn to_addresses(&self) -> Vec<String> {
        Self::addresses(&self.to_json)
    }

    pub fn cc_addresses(&self) -> Vec<String> {
        Self::addresses(&self.cc_json)
    }

    pub fn bcc_addresses(&self) -> Vec<String> {
        Self::addresses(&self.bcc_json)
    }
}

#[async_trait]
pub trait SendLog: Send + Sync {
    async fn create_pending(&self, entry: NewSendLog) -> Result<i64, NotifyError>;
    async fn mark_sent(&self, id: i64, smtp_message_id: &str) -> Result<(), NotifyError>;
    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), NotifyError>;
    async fn mark_retry(&self, id: i64, error: &str) -> Result<(), NotifyError>;
    /// RETRY rows that have not exhausted their attempts.
    async fn find_retryable(&self, max_retries: i32) -> Result<Vec<SendLogEntry>, NotifyError>;
}

#[derive(Clone)]
pub struct PgSendLog {
    pool: PgPool,
}

impl PgSendLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SendLog for PgSendLog {
    async fn create_pending(&self, entry: NewSendLog) -> Result<i64, NotifyError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO email_send_log
                (template_id, template_code, to_json, cc_json, bcc_json, subject, body,
                 is_html, variables, entity_type, entity_id, sent_by, status, attempts,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'PENDING', 0,
                    NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(entry.template_id)
        .bind(&entry.template_code)
        .bind(serde_json::json!(entry.to))
        .bind(serde_json::json!(entry.cc))
        .bind(serde_json::json!(entry.bcc))
        .bind(&entry.subject)
        .bind(&entry.body)
        .bind(entry.is_html)
        .bind(&entry.variables)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.sent_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark_sent(&self, id: i64, smtp_message_id: &str) -> Result<(), NotifyError> {
        sqlx::query(
            r#"
            UPDATE email_send_log
            SET status = 'SENT', message_id = $2, attempts = attempts + 1,
                last_error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(smtp_message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), NotifyError> {
        sqlx::query(
            r#"
            UPDATE email_send_log
            SET status = 'FAILED', attempts = attempts + 1, last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retry(&self, id: i64, error: &str) -> Result<(), NotifyError> {
        sqlx::query(
            r#"
            UPDATE email_send_log
            SET status = 'RETRY', attempts = attempts + 1, last_error = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_retryable(&self, max_retries: i32) -> Result<Vec<SendLogEntry>, NotifyError> {
        Ok(sqlx::query_as::<_, SendLogEntry>(
            r#"
            SELECT id, template_id, template_code, to_json, cc_json, bcc_json, subject,
                   body, is_html, status, message_id, attempts, last_error,
                   created_at, updated_at
            FROM email_send_log
            WHERE status = 'RETRY' AND attempts < $1
            ORDER BY updated_at
            "#,
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?)
    }
}

/// In-process send log for dev and tests.
#[derive(Default)]
pub struct InMemorySendLog {
    entries: Mutex<Vec<SendLogEntry>>,
}

impl InMemorySendLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, id: i64) -> Option<SendLogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    pub fn status_of(&self, id: i64) -> Option<SendStatus> {
        self.entry(id).and_then(|e| SendStatus::parse(&e.status))
    }

    pub fn seed_retry(&self, entry: NewSendLog, attempts: i32, error: &str) -> i64 {
        let mut entries = self.entries.lock().unwrap();
        let id = entries.len() as i64 + 1;
        entries.push(SendLogEntry {
            id,
            template_id: entry.template_id,
            template_code: entry.template_code,
            to_json: serde_json::json!(entry.to),
            cc_json: serde_json::json!(entry.cc),
            bcc_json: serde_json::json!(entry.bcc),
            subject: entry.subject,
            body: entry.body,
            is_html: entry.is_html,
            status: SendStatus::Retry.as_str().to_string(),
            message_id: None,
            attempts,
            last_error: Some(error.to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        id
    }

    fn update(&self, id: i64, f: impl FnOnce(&mut SendLogEntry)) -> Result<(), NotifyError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                f(entry);
                entry.updated_at = Utc::now();
                Ok(())
            }
            None => Err(NotifyError::Configuration(format!(
                "send log entry {id} not found"
            ))),
        }
    }
}

#[async_trait]
impl SendLog for InMemorySendLog {
    async fn create_pending(&self, entry: NewSendLog) -> Result<i64, NotifyError> {
        let mut entries = self.entries.lock().unwrap();
        let id = entries.len() as i64 + 1;
        entries.push(SendLogEntry {
            id,
            template_id: entry.template_id,
            template_code: entry.template_code,
            to_json: serde_json::json!(entry.to),
            cc_json: serde_json::json!(entry.cc),
            bcc_json: serde_json::json!(entry.bcc),
            subject: entry.subject,
            body: entry.body,
            is_html: entry.is_html,
            status: SendStatus::Pending.as_str().to_string(),
            message_id: None,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        Ok(id)
    }

    async fn mark_sent(&self, id: i64, smtp_message_id: &str) -> Result<(), NotifyError> {
        self.update(id, |entry| {
            entry.status = SendStatus::Sent.as_str().to_string();
            entry.message_id = Some(smtp_message_id.to_string());
            entry.attempts += 1;
            entry.last_error = None;
        })
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<(), NotifyError> {
        self.update(id, |entry| {
            entry.status = SendStatus::Failed.as_str().to_string();
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        })
    }

    async fn mark_retry(&self, id: i64, error: &str) -> Result<(), NotifyError> {
        self.update(id, |entry| {
            entry.status = SendStatus::Retry.as_str().to_string();
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        })
    }

    async fn find_retryable(&self, max_retries: i32) -> Result<Vec<SendLogEntry>, NotifyError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.status == SendStatus::Retry.as_str() && e.attempts < max_retries)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            SendStatus::Pending,
            SendStatus::Sent,
            SendStatus::Failed,
            SendStatus::Retry,
        ] {
            assert_eq!(SendStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SendStatus::parse("UNKNOWN"), None);
    }

    #[tokio::test]
    async fn test_in_memory_lifecycle() {
        let log = InMemorySendLog::new();
        let id = log
            .create_pending(NewSendLog {
                template_id: Some(1),
                template_code: Some("PO_CREATED".to_string()),
                to: vec!["ops@example.com".to_string()],
                cc: vec![],
                bcc: vec![],
                subject: "s".to_string(),
                body: "b".to_string(),
                is_html: false,
                variables: None,
                entity_type: None,
                entity_id: None,
                sent_by: Some("notifier".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(log.status_of(id), Some(SendStatus::Pending));
        log.mark_sent(id, "smtp-250-ok").await.unwrap();
        let entry = log.entry(id).unwrap();
        assert_eq!(entry.status, "SENT");
        assert_eq!(entry.message_id.as_deref(), Some("smtp-250-ok"));
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn test_find_retryable_respects_attempt_cap() {
        let log = InMemorySendLog::new();
        let fresh = log.seed_retry(sample("a@example.com"), 1, "boom");
        let exhausted = log.seed_retry(sample("b@example.com"), 5, "boom");

        let retryable = log.find_retryable(3).await.unwrap();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].id, fresh);
        assert_ne!(retryable[0].id, exhausted);
    }

    fn sample(to: &str) -> NewSendLog {
        NewSendLog {
            template_id: None,
            template_code: None,
            to: vec![to.to_string()],
            cc: vec![],
            bcc: vec![],
            subject: "s".to_string(),
            body: "b".to_string(),
            is_html: false,
            variables: None,
            entity_type: None,
            entity_id: None,
            sent_by: None,
        }
    }
}
