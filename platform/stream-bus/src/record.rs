//! The flat-field record shape shared by the gateway publisher and every
//! stream consumer.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

pub const FIELD_MESSAGE_ID: &str = "message_id";
pub const FIELD_EVENT_TYPE: &str = "event_type";
pub const FIELD_EVENT_TIME: &str = "event_time";
pub const FIELD_PAYLOAD: &str = "payload";
pub const FIELD_METADATA: &str = "metadata";

/// Metadata key that marks an operator-triggered re-injection.
pub const RESEND_METADATA_KEY: &str = "resend";

/// A record written to a named stream.
///
/// `payload` carries the original JSON body untouched; `metadata` is an
/// optional JSON string (`{"resend":"true"}` requests re-ingestion).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub message_id: String,
    pub event_type: String,
    pub event_time: Option<DateTime<Utc>>,
    pub payload: String,
    pub metadata: Option<String>,
}

impl StreamRecord {
    pub fn new(message_id: String, event_type: String, payload: String) -> Self {
        Self {
            message_id,
            event_type,
            event_time: None,
            payload,
            metadata: None,
        }
    }

    pub fn with_event_time(mut self, event_time: Option<DateTime<Utc>>) -> Self {
        self.event_time = event_time;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Flatten into the field list accepted by [`crate::StreamBus::publish`].
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (FIELD_MESSAGE_ID.to_string(), self.message_id.clone()),
            (FIELD_EVENT_TYPE.to_string(), self.event_type.clone()),
            (FIELD_PAYLOAD.to_string(), self.payload.clone()),
        ];
        if let Some(ts) = self.event_time {
            fields.push((
                FIELD_EVENT_TIME.to_string(),
                ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        if let Some(meta) = &self.metadata {
            fields.push((FIELD_METADATA.to_string(), meta.clone()));
        }
        fields
    }

    /// Rebuild a record from consumer-side fields. Returns `None` when the
    /// mandatory identifiers are absent.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let message_id = fields.get(FIELD_MESSAGE_ID)?.clone();
        let event_type = fields.get(FIELD_EVENT_TYPE)?.clone();
        let event_time = fields
            .get(FIELD_EVENT_TIME)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Some(Self {
            message_id,
            event_type,
            event_time,
            payload: fields.get(FIELD_PAYLOAD).cloned().unwrap_or_default(),
            metadata: fields.get(FIELD_METADATA).cloned(),
        })
    }
}

/// Strip JSON-string quoting from a field value.
///
/// When a value starts and ends with `"` and the stripped body does not open
/// a JSON object or array, the standard string escapes are unescaped.
/// Anything else is returned intact.
pub fn unquote_field(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'"' || bytes[bytes.len() - 1] != b'"' {
        return value.to_string();
    }
    let inner = &value[1..value.len() - 1];
    let trimmed = inner.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return value.to_string();
    }
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// True when the metadata JSON marks the record as a re-injection.
///
/// Accepts both the boolean form `{"resend":true}` and the string form
/// `{"resend":"true"}` that the resend API writes.
pub fn parse_resend_flag(metadata: Option<&str>) -> bool {
    let Some(raw) = metadata else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return false;
    };
    match value.get(RESEND_METADATA_KEY) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
