//! Fire-and-forget publisher from raw events to their mapped streams.

use std::collections::HashMap;
use std::sync::Arc;
use stream_bus::{StreamBus, StreamRecord};

/// Resolves an event type (source address) to its stream and appends the
/// record. Publish failures never propagate: the raw event is already
/// durable and the operator can resend.
#[derive(Clone)]
pub struct StreamPublisher {
    bus: Arc<dyn StreamBus>,
    mapping: HashMap<String, String>,
}

impl StreamPublisher {
    pub fn new(bus: Arc<dyn StreamBus>, mapping: HashMap<String, String>) -> Self {
        Self { bus, mapping }
    }

    pub fn stream_for(&self, event_type: &str) -> Option<&str> {
        self.mapping.get(event_type).map(String::as_str)
    }

    /// Publish the record to its mapped stream. Unmapped event types are
    /// skipped with a debug log; store failures are downgraded to warnings.
    pub async fn publish(&self, record: &StreamRecord) {
        let Some(stream) = self.stream_for(&record.event_type) else {
            tracing::debug!(
                event_type = %record.event_type,
                message_id = %record.message_id,
                "No stream mapping for event type, skipping publish"
            );
            return;
        };

        match self.bus.publish(stream, &record.to_fields()).await {
            Ok(entry_id) => {
                tracing::debug!(
                    message_id = %record.message_id,
                    stream = %stream,
                    entry_id = %entry_id,
                    "Event published to stream"
                );
            }
            Err(e) => {
                tracing::warn!(
                    message_id = %record.message_id,
                    stream = %stream,
                    error = %e,
                    "Failed to publish event to stream, raw event remains resendable"
                );
            }
        }
    }
}
