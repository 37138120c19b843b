//! Processor framework: the shared skeleton every stream processor runs.
//!
//! The skeleton is a template method over a small capability set. A
//! processor supplies row building and persistence; the pipeline owns
//! dedup, resend handling, payload parsing, enrichment and error clearing.

use crate::enrichment::{Enrichment, EnrichmentLookup};
use crate::error_ingestion::ErrorIngestion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

pub use stream_bus::parse_resend_flag;

/// Errors raised while processing one stream entry.
///
/// Anything returned from [`run_pipeline`] reaches the orchestrator and
/// prevents acknowledgement; data problems (bad payloads, missing ids) are
/// handled inside the pipeline and acknowledged.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("{0}")]
    Other(String),
}

/// Identity of the entry being processed.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub message_id: String,
    pub event_type: String,
    pub is_resend: bool,
}

/// What the orchestrator sees of a processor.
#[async_trait]
pub trait StreamProcessor: Send + Sync {
    fn stream_key(&self) -> &str;
    fn consumer_group(&self) -> &str;
    fn processor_name(&self) -> &str;
    async fn process(&self, fields: &HashMap<String, String>) -> Result<(), ProcessError>;
}

/// Capability set the shared pipeline runs over.
#[async_trait]
pub trait ProcessorOps: Send + Sync {
    type Model: Send;

    fn processor_name(&self) -> &str;

    async fn exists_by_message_id(&self, message_id: &str) -> Result<bool, ProcessError>;

    /// Delete prior rows for the message, children first. Returns the number
    /// of parent rows removed.
    async fn delete_by_message_id(&self, message_id: &str) -> Result<u64, ProcessError>;

    /// Project the payload into rows to persist, in save order.
    fn build_models(
        &self,
        message: &EventMessage,
        payload: &JsonValue,
    ) -> Result<Vec<Self::Model>, ProcessError>;

    /// Copy the catalogue ids onto a row (applied to the first model only).
    fn apply_enrichment(&self, model: &mut Self::Model, enrichment: &Enrichment);

    async fn save_models(&self, models: Vec<Self::Model>) -> Result<(), ProcessError>;

    /// Identifier handed to the catalogue lookup; the default reads the
    /// fixed field, processors override to map alternative payloads.
    fn unit_number_from_payload(&self, payload: &JsonValue) -> Option<String> {
        get_string(payload, "unitNumber")
    }

    fn unit_type_code_from_payload(&self, payload: &JsonValue) -> Option<String> {
        get_string(payload, "unitTypeCode")
    }
}

/// The template method: dedup -> resend -> parse -> build -> enrich -> save.
///
/// Returns `Ok` for data problems (the entry is acknowledged) and an error
/// for persistence problems (the entry stays pending).
pub async fn run_pipeline<O: ProcessorOps>(
    ops: &O,
    enrichment: &dyn EnrichmentLookup,
    errors: &dyn ErrorIngestion,
    fields: &HashMap<String, String>,
) -> Result<(), ProcessError> {
    let name = ops.processor_name();
    let message_id = fields
        .get("message_id")
        .map(String::as_str)
        .unwrap_or("")
        .trim();
    if message_id.is_empty() {
        tracing::warn!(processor = %name, "Stream entry without message_id, nothing to deduplicate, skipping");
        return Ok(());
    }

    let event_type = fields.get("event_type").cloned().unwrap_or_default();
    let is_resend = parse_resend_flag(fields.get("metadata").map(String::as_str));

    if ops.exists_by_message_id(message_id).await? {
        if is_resend {
            let deleted = ops.delete_by_message_id(message_id).await?;
            tracing::info!(
                processor = %name,
                message_id = %message_id,
                deleted = deleted,
                "Resend requested, prior rows deleted"
            );
        } else {
            tracing::debug!(
                processor = %name,
                message_id = %message_id,
                "Message already ingested, skipping"
            );
            return Ok(());
        }
    }

    let payload_raw = fields.get("payload").map(String::as_str).unwrap_or("");
    let payload: JsonValue = match serde_json::from_str(payload_raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                processor = %name,
                message_id = %message_id,
                error = %e,
                "Unparseable payload, acknowledging without ingestion"
            );
            return Ok(());
        }
    };

    let message = EventMessage {
        message_id: message_id.to_string(),
        event_type,
        is_resend,
    };
    let mut models = match ops.build_models(&message, &payload) {
        Ok(models) => models,
        Err(ProcessError::Payload(reason)) => {
            tracing::warn!(
                processor = %name,
                message_id = %message_id,
                reason = %reason,
                "Payload rejected by processor, acknowledging without ingestion"
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if models.is_empty() {
        tracing::warn!(
            processor = %name,
            message_id = %message_id,
            "Payload produced no rows, acknowledging"
        );
        return Ok(());
    }

    if let Some(identifier) = ops.unit_number_from_payload(&payload) {
        let type_code = ops.unit_type_code_from_payload(&payload);
        let resolved = enrichment.lookup(&identifier, type_code.as_deref()).await;
        ops.apply_enrichment(&mut models[0], &resolved);
    }

    ops.save_models(models).await?;

    if is_resend {
        errors.clear(message_id).await;
    }

    tracing::info!(
        processor = %name,
        message_id = %message_id,
        resend = is_resend,
        "Message ingested"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Payload helpers. Missing or mistyped fields are `None`, never errors.
// ---------------------------------------------------------------------------

pub fn get_string(payload: &JsonValue, field: &str) -> Option<String> {
    match payload.get(field)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn get_i64(payload: &JsonValue, field: &str) -> Option<i64> {
    match payload.get(field)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn get_i32(payload: &JsonValue, field: &str) -> Option<i32> {
    get_i64(payload, field).and_then(|v| i32::try_from(v).ok())
}

pub fn get_f64(payload: &JsonValue, field: &str) -> Option<f64> {
    match payload.get(field)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn get_bool(payload: &JsonValue, field: &str) -> Option<bool> {
    match payload.get(field)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// ISO-8601 timestamp field, normalized to UTC.
pub fn parse_timestamp(payload: &JsonValue, field: &str) -> Option<DateTime<Utc>> {
    let raw = payload.get(field)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Decimal field accepted as a JSON number or a numeric string.
pub fn parse_decimal(payload: &JsonValue, field: &str) -> Option<f64> {
    get_f64(payload, field)
}
