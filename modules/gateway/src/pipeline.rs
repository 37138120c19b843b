//! Per-message handling: raw-event persistence then stream publish.

use crate::digest;
use crate::publisher::StreamPublisher;
use crate::raw_events::{NewRawEvent, RawEventStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::time::Duration;
use stream_bus::StreamRecord;

/// Explicit settlement decision for one delivery.
///
/// Replaces throw-to-rollback control flow: the listener translates the
/// variant into broker operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Processed; acknowledge the delivery.
    Acked,
    /// Unprocessable; drop without redelivery.
    Rejected(String),
    /// Processing failed or acknowledgement is suppressed; return the
    /// delivery to the broker for redelivery.
    RollbackForRedelivery,
}

/// What a listener does with each delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, address: &str, message_id: Option<&str>, body: &str) -> ProcessOutcome;
}

/// The gateway pipeline: synthesize a message id when the broker gave none,
/// upsert the raw event (with bounded in-listener retry), then fire-and-forget
/// publish to the mapped stream.
pub struct EventPipeline {
    raw_events: RawEventStore,
    publisher: StreamPublisher,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl EventPipeline {
    pub fn new(
        raw_events: RawEventStore,
        publisher: StreamPublisher,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            raw_events,
            publisher,
            retry_attempts,
            retry_delay,
        }
    }

    fn parse_payload(body: &str) -> JsonValue {
        serde_json::from_str(body).unwrap_or_else(|_| JsonValue::String(body.to_string()))
    }

    fn extract_event_time(payload: &JsonValue) -> Option<DateTime<Utc>> {
        payload
            .get("eventTime")
            .and_then(JsonValue::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

#[async_trait]
impl DeliveryHandler for EventPipeline {
    async fn handle(&self, address: &str, message_id: Option<&str>, body: &str) -> ProcessOutcome {
        let message_id = match message_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => digest::fingerprint(address, body),
        };
        let payload = Self::parse_payload(body);
        let event_time = Self::extract_event_time(&payload);

        let event = NewRawEvent {
            message_id: message_id.clone(),
            event_type: address.to_string(),
            event_time,
            payload,
            checksum: digest::checksum(body),
            processed_at: Utc::now(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.raw_events.upsert(&event).await {
                Ok(()) => break,
                Err(e) if attempt < self.retry_attempts => {
                    tracing::warn!(
                        message_id = %message_id,
                        address = %address,
                        attempt = attempt,
                        error = %e,
                        "Raw event upsert failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        message_id = %message_id,
                        address = %address,
                        attempts = attempt,
                        error = %e,
                        "Raw event upsert failed, returning message for redelivery"
                    );
                    return ProcessOutcome::RollbackForRedelivery;
                }
            }
        }

        let record = StreamRecord::new(message_id, address.to_string(), body.to_string())
            .with_event_time(event_time);
        self.publisher.publish(&record).await;

        ProcessOutcome::Acked
    }
}
