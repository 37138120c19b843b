//! Programmatic control plane: lifecycle, raw-event queries and resend.

use crate::config::{parse_stream_mapping, ConcurrencyBand, ListenerSettings};
use crate::listener::{GatewayStatus, ListenerManager};
use crate::publisher::StreamPublisher;
use crate::raw_events::{EventFilter, RawEvent, RawEventStore};
use crate::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use stream_bus::{StreamBus, StreamRecord};

/// Partial settings override accepted by `reconfigure`; unset fields keep
/// their current values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReconfigureRequest {
    pub addresses: Option<Vec<String>>,
    pub subscriber_name: Option<String>,
    /// "min-max" band.
    pub concurrency: Option<String>,
    pub stream_mapping: Option<HashMap<String, String>>,
    pub acknowledge_messages: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResendOutcome {
    pub requested: usize,
    pub matched: usize,
    pub published: usize,
}

pub struct GatewayControl {
    manager: Arc<ListenerManager>,
    raw_events: RawEventStore,
    stream_bus: Arc<dyn StreamBus>,
}

impl GatewayControl {
    pub fn new(
        manager: Arc<ListenerManager>,
        raw_events: RawEventStore,
        stream_bus: Arc<dyn StreamBus>,
    ) -> Self {
        Self {
            manager,
            raw_events,
            stream_bus,
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.manager.status()
    }

    pub async fn start_all(&self) -> Result<(), GatewayError> {
        self.manager.start().await
    }

    pub async fn stop_all(&self) {
        self.manager.stop().await;
    }

    pub async fn reconfigure(&self, request: ReconfigureRequest) -> Result<(), GatewayError> {
        let mut settings = self.manager.current_settings().await;
        if let Some(addresses) = request.addresses {
            if addresses.is_empty() {
                return Err(GatewayError::Configuration(
                    "addresses must not be empty".to_string(),
                ));
            }
            settings.addresses = addresses;
        }
        if let Some(name) = request.subscriber_name {
            settings.subscriber_name = name;
        }
        if let Some(band) = request.concurrency {
            settings.concurrency =
                ConcurrencyBand::parse(&band).map_err(GatewayError::Configuration)?;
        }
        if let Some(mapping) = request.stream_mapping {
            // Re-validate through the same parser used at startup.
            let joined = mapping
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            settings.stream_mapping =
                parse_stream_mapping(&joined).map_err(GatewayError::Configuration)?;
        }
        if let Some(ack) = request.acknowledge_messages {
            settings.acknowledge_messages = ack;
        }
        self.manager.reconfigure(settings).await
    }

    pub async fn search_events(
        &self,
        filter: &EventFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RawEvent>, GatewayError> {
        Ok(self.raw_events.find_by_filter(filter, limit, offset).await?)
    }

    pub async fn count_events(&self, filter: &EventFilter) -> Result<i64, GatewayError> {
        Ok(self.raw_events.count_by_filter(filter).await?)
    }

    /// Republish raw-event rows into their mapped streams. With
    /// `force_message_id` the records carry `metadata.resend=true`, telling
    /// processors to overwrite their prior rows.
    pub async fn resend_events(
        &self,
        ids: &[i64],
        force_message_id: bool,
    ) -> Result<ResendOutcome, GatewayError> {
        let events = self.raw_events.find_by_ids(ids).await?;
        let published = self.republish(&events, force_message_id).await;
        Ok(ResendOutcome {
            requested: ids.len(),
            matched: events.len(),
            published,
        })
    }

    /// Resend every raw event matching the filter, paging through the store.
    pub async fn resend_all_by_filter(
        &self,
        filter: &EventFilter,
        force_message_id: bool,
    ) -> Result<ResendOutcome, GatewayError> {
        const PAGE: i64 = 500;
        let mut offset = 0;
        let mut matched = 0;
        let mut published = 0;
        loop {
            let page = self.raw_events.find_by_filter(filter, PAGE, offset).await?;
            if page.is_empty() {
                break;
            }
            matched += page.len();
            published += self.republish(&page, force_message_id).await;
            if (page.len() as i64) < PAGE {
                break;
            }
            offset += PAGE;
        }
        Ok(ResendOutcome {
            requested: matched,
            matched,
            published,
        })
    }

    async fn republish(&self, events: &[RawEvent], force_message_id: bool) -> usize {
        let settings = self.manager.current_settings().await;
        let publisher = StreamPublisher::new(self.stream_bus.clone(), settings.stream_mapping);

        let mut published = 0;
        for event in events {
            let payload = match &event.payload {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            let metadata = force_message_id.then(|| r#"{"resend":"true"}"#.to_string());
            let record =
                StreamRecord::new(event.message_id.clone(), event.event_type.clone(), payload)
                    .with_event_time(event.event_time)
                    .with_metadata(metadata);
            if publisher.stream_for(&event.event_type).is_some() {
                publisher.publish(&record).await;
                published += 1;
                tracing::info!(
                    message_id = %event.message_id,
                    event_type = %event.event_type,
                    resend = force_message_id,
                    "Raw event resent to stream"
                );
            } else {
                tracing::warn!(
                    message_id = %event.message_id,
                    event_type = %event.event_type,
                    "Cannot resend: no stream mapping for event type"
                );
            }
        }
        published
    }
}
