//! Mapping-driven dispatch from stream events to email sends.

use crate::email::{DirectEmailRequest, EmailSender};
use crate::templates::TemplateRepository;
use crate::NotifyError;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

fn default_event_type_field() -> String {
    "event_type".to_string()
}

fn default_true() -> bool {
    true
}

/// One configured route from a stream event to an email action.
#[derive(Debug, Clone, Deserialize)]
pub struct EventMapping {
    pub stream: String,
    pub event_type: String,
    #[serde(default)]
    pub template_code: Option<String>,
    pub consumer_group: String,
    #[serde(default = "default_event_type_field")]
    pub event_type_field: String,
    #[serde(default = "default_true")]
    pub auto_ack: bool,
    #[serde(default)]
    pub single_mail: bool,
    #[serde(default)]
    pub email_list_specified: bool,
    #[serde(default)]
    pub email_sender_name: Option<String>,
    #[serde(default)]
    pub direct_email: bool,
}

/// Normalize the event's `parameters` value.
///
/// Producers send either a nested object or a JSON-quoted string; quoted
/// strings are unescaped once, and once more when the first pass still
/// yields a string.
pub fn parse_parameters(value: &JsonValue) -> Option<JsonValue> {
    match value {
        JsonValue::Object(_) | JsonValue::Array(_) => Some(value.clone()),
        JsonValue::String(raw) => {
            let once: JsonValue = serde_json::from_str(raw).ok()?;
            match once {
                JsonValue::Object(_) | JsonValue::Array(_) => Some(once),
                JsonValue::String(inner) => serde_json::from_str(&inner).ok(),
                _ => None,
            }
        }
        _ => None,
    }
}

pub struct NotificationDispatcher {
    mappings: Vec<EventMapping>,
    templates: Arc<dyn TemplateRepository>,
    sender: Arc<EmailSender>,
}

impl NotificationDispatcher {
    pub fn new(
        mappings: Vec<EventMapping>,
        templates: Arc<dyn TemplateRepository>,
        sender: Arc<EmailSender>,
    ) -> Self {
        Self {
            mappings,
            templates,
            sender,
        }
    }

    pub fn mappings(&self) -> &[EventMapping] {
        &self.mappings
    }

    /// Distinct (stream, group) pairs the consumer layer must subscribe.
    pub fn consumer_bindings(&self) -> Vec<(String, String)> {
        let mut bindings: Vec<(String, String)> = Vec::new();
        for mapping in &self.mappings {
            let binding = (mapping.stream.clone(), mapping.consumer_group.clone());
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }
        bindings
    }

    /// First mapping whose stream matches and whose event-type field carries
    /// the mapped value.
    pub fn find_mapping(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
    ) -> Option<&EventMapping> {
        self.mappings.iter().find(|mapping| {
            mapping.stream == stream
                && fields.get(&mapping.event_type_field).map(String::as_str)
                    == Some(mapping.event_type.as_str())
        })
    }

    /// Handle one stream entry. Returns whether the entry should be
    /// acknowledged; failures are logged, never rethrown, so delivery
    /// problems cannot wedge the stream.
    pub async fn dispatch(&self, stream: &str, fields: &HashMap<String, String>) -> bool {
        let Some(mapping) = self.find_mapping(stream, fields) else {
            tracing::debug!(
                stream = %stream,
                event_type = fields.get("event_type").map(String::as_str).unwrap_or(""),
                "No mapping for event, skipping"
            );
            return true;
        };

        let message_id = fields.get("message_id").cloned().unwrap_or_default();
        if let Err(e) = self.handle_mapping(mapping, &message_id, fields).await {
            tracing::error!(
                stream = %stream,
                event_type = %mapping.event_type,
                message_id = %message_id,
                error = %e,
                "Notification dispatch failed"
            );
        }
        mapping.auto_ack
    }

    async fn handle_mapping(
        &self,
        mapping: &EventMapping,
        message_id: &str,
        fields: &HashMap<String, String>,
    ) -> Result<(), NotifyError> {
        let payload: JsonValue = fields
            .get("payload")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(JsonValue::Null);

        if mapping.direct_email {
            let parameters = payload
                .get("parameters")
                .and_then(parse_parameters)
                .ok_or_else(|| {
                    NotifyError::Configuration(
                        "direct-email event without parameters".to_string(),
                    )
                })?;
            let request = DirectEmailRequest::from_parameters(&parameters)?;
            self.sender
                .send_direct(&request, Some(message_id), "notifier")
                .await?;
            return Ok(());
        }

        let code = mapping.template_code.as_deref().ok_or_else(|| {
            NotifyError::Configuration(format!(
                "mapping for '{}' has neither template_code nor direct_email",
                mapping.event_type
            ))
        })?;
        let template = self
            .templates
            .find_by_code(code)
            .await?
            .ok_or_else(|| NotifyError::Template(format!("template '{code}' not found")))?;
        if !template.active {
            return Err(NotifyError::Template(format!("template '{code}' is inactive")));
        }

        // The payload tree, arrays and objects intact, is the render context.
        self.sender
            .send_from_template(
                template.id,
                mapping,
                &payload,
                Some(mapping.event_type.as_str()),
                Some(message_id),
                "notifier",
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::InMemoryAttachmentStore;
    use crate::email::StubMailer;
    use crate::renderer::TemplateRenderer;
    use crate::send_log::{InMemorySendLog, SendStatus};
    use crate::templates::{EmailTemplate, InMemoryTemplateRepository, Recipients};
    use serde_json::json;

    fn mapping(event_type: &str) -> EventMapping {
        EventMapping {
            stream: "tfp-order-events-stream".to_string(),
            event_type: event_type.to_string(),
            template_code: Some("PO_CREATED".to_string()),
            consumer_group: "notifier".to_string(),
            event_type_field: "event_type".to_string(),
            auto_ack: true,
            single_mail: false,
            email_list_specified: false,
            email_sender_name: None,
            direct_email: false,
        }
    }

    struct Fixture {
        mailer: Arc<StubMailer>,
        attachments: Arc<InMemoryAttachmentStore>,
        send_log: Arc<InMemorySendLog>,
        dispatcher: NotificationDispatcher,
    }

    fn fixture(mappings: Vec<EventMapping>) -> Fixture {
        let mailer = Arc::new(StubMailer::new());
        let attachments = Arc::new(InMemoryAttachmentStore::new());
        let templates = Arc::new(InMemoryTemplateRepository::new());
        let send_log = Arc::new(InMemorySendLog::new());

        templates.add_template(EmailTemplate {
            id: 1,
            code: "PO_CREATED".to_string(),
            subject: "Purchase order {{data.id_purchase_order}}".to_string(),
            body: "Order {{data.id_purchase_order}} from {{data.supplier_name}}".to_string(),
            is_html: false,
            active: true,
        });
        templates.add_list("purchasing", Recipients::single("buyer@example.com".to_string()));
        templates.attach_list(1, "purchasing");

        let sender = Arc::new(EmailSender::new(
            mailer.clone(),
            attachments.clone(),
            Arc::new(TemplateRenderer::new()),
            templates.clone(),
            send_log.clone(),
            String::new(),
            String::new(),
            "noreply@example.com".to_string(),
            "TFP Notifier".to_string(),
        ));
        let dispatcher = NotificationDispatcher::new(mappings, templates, sender);
        Fixture {
            mailer,
            attachments,
            send_log,
            dispatcher,
        }
    }

    fn fields(event_type: &str, payload: JsonValue) -> HashMap<String, String> {
        HashMap::from([
            ("message_id".to_string(), "ID:evt-1".to_string()),
            ("event_type".to_string(), event_type.to_string()),
            ("payload".to_string(), payload.to_string()),
        ])
    }

    #[test]
    fn test_parse_parameters_accepts_object_and_quoted_string() {
        let object = json!({"email": "a@example.com"});
        assert_eq!(parse_parameters(&object), Some(object.clone()));

        let quoted = JsonValue::String(r#"{"email":"a@example.com"}"#.to_string());
        assert_eq!(parse_parameters(&quoted), Some(object.clone()));

        // doubly escaped: a JSON string whose content is a JSON string
        let doubly = JsonValue::String(r#""{\"email\":\"a@example.com\"}""#.to_string());
        assert_eq!(parse_parameters(&doubly), Some(object));

        assert_eq!(parse_parameters(&json!(12)), None);
        assert_eq!(parse_parameters(&JsonValue::String("not json".to_string())), None);
    }

    #[test]
    fn test_find_mapping_first_match_and_custom_field() {
        let mut custom = mapping("ORDER_SHIPPED");
        custom.event_type_field = "kind".to_string();
        let fx = fixture(vec![mapping("PURCHASE_ORDER_CREATED"), custom]);

        let by_default = fx.dispatcher.find_mapping(
            "tfp-order-events-stream",
            &fields("PURCHASE_ORDER_CREATED", json!({})),
        );
        assert!(by_default.is_some());

        let mut with_kind = fields("other", json!({}));
        with_kind.insert("kind".to_string(), "ORDER_SHIPPED".to_string());
        let by_custom = fx
            .dispatcher
            .find_mapping("tfp-order-events-stream", &with_kind);
        assert_eq!(by_custom.unwrap().event_type, "ORDER_SHIPPED");

        assert!(fx
            .dispatcher
            .find_mapping("unknown-stream", &fields("PURCHASE_ORDER_CREATED", json!({})))
            .is_none());
    }

    #[test]
    fn test_consumer_bindings_deduplicate() {
        let fx = fixture(vec![
            mapping("A"),
            mapping("B"),
            EventMapping {
                consumer_group: "other-group".to_string(),
                ..mapping("C")
            },
        ]);
        let bindings = fx.dispatcher.consumer_bindings();
        assert_eq!(bindings.len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_template_mapping_sends_email() {
        let fx = fixture(vec![mapping("PURCHASE_ORDER_CREATED")]);
        let payload = json!({"data": {"id_purchase_order": 1021, "supplier_name": "ACME"}});
        let ack = fx
            .dispatcher
            .dispatch("tfp-order-events-stream", &fields("PURCHASE_ORDER_CREATED", payload))
            .await;

        assert!(ack);
        let sent = fx.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.starts_with("Order 1021 from ACME"));
        assert_eq!(fx.send_log.status_of(1), Some(SendStatus::Sent));
    }

    #[tokio::test]
    async fn test_dispatch_without_mapping_acks_and_skips() {
        let fx = fixture(vec![mapping("PURCHASE_ORDER_CREATED")]);
        let ack = fx
            .dispatcher
            .dispatch("tfp-order-events-stream", &fields("UNMAPPED", json!({})))
            .await;
        assert!(ack);
        assert!(fx.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_failure_still_acks() {
        // Template is referenced by the mapping but missing from the store.
        let mut broken = mapping("PURCHASE_ORDER_CREATED");
        broken.template_code = Some("NOT_THERE".to_string());
        let fx = fixture(vec![broken]);
        let ack = fx
            .dispatcher
            .dispatch(
                "tfp-order-events-stream",
                &fields("PURCHASE_ORDER_CREATED", json!({})),
            )
            .await;
        assert!(ack);
        assert!(fx.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_honours_auto_ack_false() {
        let mut manual = mapping("PURCHASE_ORDER_CREATED");
        manual.auto_ack = false;
        let fx = fixture(vec![manual]);
        let payload = json!({"data": {"id_purchase_order": 1, "supplier_name": "X"}});
        let ack = fx
            .dispatcher
            .dispatch("tfp-order-events-stream", &fields("PURCHASE_ORDER_CREATED", payload))
            .await;
        assert!(!ack);
    }

    #[tokio::test]
    async fn test_dispatch_direct_email_with_escaped_parameters() {
        let mut direct = mapping("SEND_DOCUMENT");
        direct.direct_email = true;
        direct.template_code = None;
        let fx = fixture(vec![direct]);
        fx.attachments.put(10, "a.pdf", b"aa");
        fx.attachments.put(11, "b.pdf", b"bb");

        // parameters arrive as a JSON-escaped string
        let parameters = json!({
            "to": ["ops@example.com"],
            "subject": "Docs",
            "body": "attached",
            "attachments": [10, 11],
            "delete_attachments": true
        })
        .to_string();
        let payload = json!({ "parameters": parameters });

        let ack = fx
            .dispatcher
            .dispatch("tfp-order-events-stream", &fields("SEND_DOCUMENT", payload))
            .await;

        assert!(ack);
        let sent = fx.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attachments.len(), 2);
        assert_eq!(fx.attachments.deleted_ids(), vec![10, 11]);
        assert_eq!(fx.send_log.status_of(1), Some(SendStatus::Sent));
    }

    #[tokio::test]
    async fn test_direct_email_attachment_failure_no_send_no_delete() {
        let mut direct = mapping("SEND_DOCUMENT");
        direct.direct_email = true;
        direct.template_code = None;
        let fx = fixture(vec![direct]);
        fx.attachments.put(10, "a.pdf", b"aa");
        // attachment 11 missing

        let payload = json!({"parameters": {
            "to": ["ops@example.com"],
            "subject": "Docs",
            "body": "attached",
            "attachments": [10, 11],
            "delete_attachments": true
        }});
        let ack = fx
            .dispatcher
            .dispatch("tfp-order-events-stream", &fields("SEND_DOCUMENT", payload))
            .await;

        assert!(ack);
        assert!(fx.mailer.sent().is_empty());
        assert!(fx.attachments.deleted_ids().is_empty());
        assert_eq!(fx.send_log.status_of(1), Some(SendStatus::Failed));
    }
}
