//! Email submission with audited delivery.
//!
//! Every send is logged PENDING before submission and moved to SENT or
//! FAILED afterwards. Direct-mode attachments are all-or-nothing: a single
//! failed download aborts the send before any SMTP traffic.

use crate::attachments::{AttachmentStore, FetchedAttachment};
use crate::dispatcher::{parse_parameters, EventMapping};
use crate::renderer::TemplateRenderer;
use crate::send_log::{NewSendLog, SendLog};
use crate::templates::{Recipients, TemplateRepository};
use crate::NotifyError;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::Value as JsonValue;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub from_address: String,
    pub sender_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<FetchedAttachment>,
}

/// SMTP submission seam; returns the server message id.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, NotifyError>;
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub starttls: bool,
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self, NotifyError> {
        let mut builder = if settings.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
        }
        .map_err(|e| NotifyError::Smtp(e.to_string()))?
        .port(settings.port);

        if !settings.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
        })
    }

    fn mailbox(address: &str, name: Option<&str>) -> Result<Mailbox, NotifyError> {
        let parsed = address
            .parse()
            .map_err(|_| NotifyError::Address(address.to_string()))?;
        Ok(Mailbox::new(name.map(str::to_string), parsed))
    }

    fn build_message(email: &OutgoingEmail) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(Self::mailbox(
                &email.from_address,
                email.sender_name.as_deref(),
            )?)
            .subject(email.subject.clone());
        for to in &email.to {
            builder = builder.to(Self::mailbox(to, None)?);
        }
        for cc in &email.cc {
            builder = builder.cc(Self::mailbox(cc, None)?);
        }
        for bcc in &email.bcc {
            builder = builder.bcc(Self::mailbox(bcc, None)?);
        }

        let body_type = if email.is_html {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        let message = if email.attachments.is_empty() {
            builder
                .header(body_type)
                .body(email.body.clone())
                .map_err(|e| NotifyError::Smtp(e.to_string()))?
        } else {
            let mut multipart = MultiPart::mixed().singlepart(
                SinglePart::builder()
                    .header(body_type)
                    .body(email.body.clone()),
            );
            for attachment in &email.attachments {
                let content_type = ContentType::parse(&attachment.content_type)
                    .unwrap_or(ContentType::parse("application/octet-stream").unwrap());
                multipart = multipart.singlepart(
                    Attachment::new(attachment.filename.clone())
                        .body(attachment.bytes.clone(), content_type),
                );
            }
            builder
                .multipart(multipart)
                .map_err(|e| NotifyError::Smtp(e.to_string()))?
        };
        Ok(message)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, NotifyError> {
        let message = Self::build_message(email)?;
        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;
        Ok(response.message().collect::<Vec<_>>().join(" "))
    }
}

/// Recording mailer for dev and tests.
#[derive(Default)]
pub struct StubMailer {
    sent: std::sync::Mutex<Vec<OutgoingEmail>>,
    fail: std::sync::atomic::AtomicBool,
}

impl StubMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let stub = Self::default();
        stub.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        stub
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for StubMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, NotifyError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError::Smtp("stub transport failure".to_string()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(format!("stub-{}", self.sent.lock().unwrap().len()))
    }
}

/// Direct-mode request parsed from the event's `parameters`.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectEmailRequest {
    pub from: Option<String>,
    pub sender_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub ccn: Vec<String>,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<i64>,
    pub delete_attachments: bool,
}

impl DirectEmailRequest {
    fn addresses(value: Option<&JsonValue>) -> Vec<String> {
        match value {
            Some(JsonValue::String(s)) => s
                .split([',', ';'])
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect(),
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn from_parameters(parameters: &JsonValue) -> Result<Self, NotifyError> {
        let to = Self::addresses(parameters.get("to"));
        if to.is_empty() {
            return Err(NotifyError::Configuration(
                "direct email without recipients".to_string(),
            ));
        }
        let attachments = parameters
            .get("attachments")
            .and_then(JsonValue::as_array)
            .map(|items| items.iter().filter_map(JsonValue::as_i64).collect())
            .unwrap_or_default();

        Ok(Self {
            from: parameters
                .get("from")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            sender_name: parameters
                .get("sender_name")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            to,
            cc: Self::addresses(parameters.get("cc")),
            ccn: Self::addresses(parameters.get("ccn")),
            subject: parameters
                .get("subject")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            body: parameters
                .get("body")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            is_html: parameters
                .get("is_html")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
            attachments,
            delete_attachments: parameters
                .get("delete_attachments")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Append the configured footer. HTML footers land before `</body>` when the
/// tag is present; plain footers are separated by a blank line.
pub fn apply_footer(body: &str, is_html: bool, footer_html: &str, footer_plain: &str) -> String {
    if is_html {
        if footer_html.is_empty() {
            return body.to_string();
        }
        match body.rfind("</body>") {
            Some(index) => {
                let mut out = String::with_capacity(body.len() + footer_html.len());
                out.push_str(&body[..index]);
                out.push_str(footer_html);
                out.push_str(&body[index..]);
                out
            }
            None => format!("{body}{footer_html}"),
        }
    } else if footer_plain.is_empty() {
        body.to_string()
    } else {
        format!("{body}\n\n{footer_plain}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetrySummary {
    pub scanned: usize,
    pub sent: usize,
    pub still_failing: usize,
}

pub struct EmailSender {
    mailer: Arc<dyn Mailer>,
    attachments: Arc<dyn AttachmentStore>,
    renderer: Arc<TemplateRenderer>,
    templates: Arc<dyn TemplateRepository>,
    send_log: Arc<dyn SendLog>,
    footer_html: String,
    footer_plain: String,
    default_from: String,
    default_sender_name: String,
}

impl EmailSender {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        attachments: Arc<dyn AttachmentStore>,
        renderer: Arc<TemplateRenderer>,
        templates: Arc<dyn TemplateRepository>,
        send_log: Arc<dyn SendLog>,
        footer_html: String,
        footer_plain: String,
        default_from: String,
        default_sender_name: String,
    ) -> Self {
        Self {
            mailer,
            attachments,
            renderer,
            templates,
            send_log,
            footer_html,
            footer_plain,
            default_from,
            default_sender_name,
        }
    }

    async fn resolve_recipients(
        &self,
        template_id: i64,
        mapping: &EventMapping,
        parameters: Option<&JsonValue>,
    ) -> Result<Recipients, NotifyError> {
        if mapping.single_mail {
            let address = parameters
                .and_then(|p| p.get("email"))
                .and_then(JsonValue::as_str)
                .filter(|a| !a.is_empty())
                .ok_or_else(|| {
                    NotifyError::Configuration(
                        "single-mail mapping without parameters.email".to_string(),
                    )
                })?;
            return Ok(Recipients::single(address.to_string()));
        }
        if mapping.email_list_specified {
            let list_name = parameters
                .and_then(|p| p.get("email_list"))
                .and_then(JsonValue::as_str)
                .ok_or_else(|| {
                    NotifyError::Configuration(
                        "list mapping without parameters.email_list".to_string(),
                    )
                })?;
            let recipients = self.templates.recipients_for_list(list_name).await?;
            if recipients.is_empty() {
                return Err(NotifyError::Configuration(format!(
                    "recipient list '{list_name}' is empty"
                )));
            }
            return Ok(recipients);
        }
        let recipients = self.templates.recipients_for_template(template_id).await?;
        if recipients.is_empty() {
            return Err(NotifyError::Configuration(format!(
                "template {template_id} has no recipients"
            )));
        }
        Ok(recipients)
    }

    /// Render a stored template and submit it. Returns the send-log id; the
    /// log row carries the outcome.
    pub async fn send_from_template(
        &self,
        template_id: i64,
        mapping: &EventMapping,
        variables: &JsonValue,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
        sent_by: &str,
    ) -> Result<i64, NotifyError> {
        let template = self
            .templates
            .find_by_id(template_id)
            .await?
            .ok_or_else(|| NotifyError::Template(format!("template {template_id} not found")))?;
        if !template.active {
            return Err(NotifyError::Template(format!(
                "template '{}' is inactive",
                template.code
            )));
        }

        let parameters = variables.get("parameters").and_then(parse_parameters);
        let recipients = self
            .resolve_recipients(template.id, mapping, parameters.as_ref())
            .await?;

        let subject = self.renderer.render(&template.subject, variables);
        let body = apply_footer(
            &self.renderer.render(&template.body, variables),
            template.is_html,
            &self.footer_html,
            &self.footer_plain,
        );

        // Template mode carries at most one optional attachment, fetched
        // best-effort: the mail still goes out without it.
        let mut fetched = Vec::new();
        let attachment_id = parameters
            .as_ref()
            .and_then(|p| p.get("attachment_id"))
            .and_then(JsonValue::as_i64);
        if let Some(id) = attachment_id {
            match self.attachments.fetch(id).await {
                Ok(attachment) => fetched.push(attachment),
                Err(e) => tracing::warn!(
                    attachment_id = id,
                    error = %e,
                    "Optional attachment unavailable, sending without it"
                ),
            }
        }

        let log_id = self
            .send_log
            .create_pending(NewSendLog {
                template_id: Some(template.id),
                template_code: Some(template.code.clone()),
                to: recipients.to.clone(),
                cc: recipients.cc.clone(),
                bcc: recipients.bcc.clone(),
                subject: subject.clone(),
                body: body.clone(),
                is_html: template.is_html,
                variables: Some(variables.clone()),
                entity_type: entity_type.map(str::to_string),
                entity_id: entity_id.map(str::to_string),
                sent_by: Some(sent_by.to_string()),
            })
            .await?;

        let email = OutgoingEmail {
            from_address: self.default_from.clone(),
            sender_name: mapping
                .email_sender_name
                .clone()
                .or_else(|| Some(self.default_sender_name.clone())),
            to: recipients.to,
            cc: recipients.cc,
            bcc: recipients.bcc,
            subject,
            body,
            is_html: template.is_html,
            attachments: fetched,
        };

        match self.mailer.send(&email).await {
            Ok(message_id) => {
                self.send_log.mark_sent(log_id, &message_id).await?;
                tracing::info!(
                    log_id = log_id,
                    template = %template.code,
                    message_id = %message_id,
                    "Templated email sent"
                );
            }
            Err(e) => {
                tracing::error!(
                    log_id = log_id,
                    template = %template.code,
                    error = %e,
                    "Templated email failed"
                );
                self.send_log.mark_failed(log_id, &e.to_string()).await?;
            }
        }
        Ok(log_id)
    }

    /// Submit an email fully described by the request. Every attachment must
    /// download before any SMTP traffic; a single failure leaves the log
    /// FAILED with no submission.
    pub async fn send_direct(
        &self,
        request: &DirectEmailRequest,
        originating_message_id: Option<&str>,
        sent_by: &str,
    ) -> Result<i64, NotifyError> {
        let body = apply_footer(
            &request.body,
            request.is_html,
            &self.footer_html,
            &self.footer_plain,
        );
        let log_id = self
            .send_log
            .create_pending(NewSendLog {
                template_id: None,
                template_code: None,
                to: request.to.clone(),
                cc: request.cc.clone(),
                bcc: request.ccn.clone(),
                subject: request.subject.clone(),
                body: body.clone(),
                is_html: request.is_html,
                variables: None,
                entity_type: Some("direct_email".to_string()),
                entity_id: originating_message_id.map(str::to_string),
                sent_by: Some(sent_by.to_string()),
            })
            .await?;

        let mut fetched = Vec::with_capacity(request.attachments.len());
        for id in &request.attachments {
            match self.attachments.fetch(*id).await {
                Ok(attachment) => fetched.push(attachment),
                Err(e) => {
                    tracing::error!(
                        log_id = log_id,
                        attachment_id = id,
                        error = %e,
                        "Attachment download failed, aborting direct send"
                    );
                    self.send_log.mark_failed(log_id, &e.to_string()).await?;
                    return Ok(log_id);
                }
            }
        }

        let email = OutgoingEmail {
            from_address: request
                .from
                .clone()
                .unwrap_or_else(|| self.default_from.clone()),
            sender_name: request
                .sender_name
                .clone()
                .or_else(|| Some(self.default_sender_name.clone())),
            to: request.to.clone(),
            cc: request.cc.clone(),
            bcc: request.ccn.clone(),
            subject: request.subject.clone(),
            body,
            is_html: request.is_html,
            attachments: fetched,
        };

        match self.mailer.send(&email).await {
            Ok(message_id) => {
                self.send_log.mark_sent(log_id, &message_id).await?;
                tracing::info!(log_id = log_id, message_id = %message_id, "Direct email sent");
                if request.delete_attachments && !request.attachments.is_empty() {
                    self.attachments.delete(&request.attachments).await;
                }
            }
            Err(e) => {
                tracing::error!(log_id = log_id, error = %e, "Direct email failed");
                self.send_log.mark_failed(log_id, &e.to_string()).await?;
            }
        }
        Ok(log_id)
    }

    /// Sweep RETRY rows and attempt each once more.
    pub async fn retry_failed_emails(&self, max_retries: i32) -> Result<RetrySummary, NotifyError> {
        let entries = self.send_log.find_retryable(max_retries).await?;
        let mut summary = RetrySummary {
            scanned: entries.len(),
            ..RetrySummary::default()
        };

        for entry in entries {
            let email = OutgoingEmail {
                from_address: self.default_from.clone(),
                sender_name: Some(self.default_sender_name.clone()),
                to: entry.to_addresses(),
                cc: entry.cc_addresses(),
                bcc: entry.bcc_addresses(),
                subject: entry.subject.clone(),
                body: entry.body.clone(),
                is_html: entry.is_html,
                attachments: Vec::new(),
            };
            match self.mailer.send(&email).await {
                Ok(message_id) => {
                    self.send_log.mark_sent(entry.id, &message_id).await?;
                    summary.sent += 1;
                }
                Err(e) => {
                    tracing::warn!(log_id = entry.id, error = %e, "Retry attempt failed");
                    self.send_log.mark_retry(entry.id, &e.to_string()).await?;
                    summary.still_failing += 1;
                }
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::InMemoryAttachmentStore;
    use crate::send_log::{InMemorySendLog, SendStatus};
    use crate::templates::{EmailTemplate, InMemoryTemplateRepository, Recipients};
    use serde_json::json;

    struct Fixture {
        mailer: Arc<StubMailer>,
        attachments: Arc<InMemoryAttachmentStore>,
        templates: Arc<InMemoryTemplateRepository>,
        send_log: Arc<InMemorySendLog>,
        sender: EmailSender,
    }

    fn fixture() -> Fixture {
        let mailer = Arc::new(StubMailer::new());
        let attachments = Arc::new(InMemoryAttachmentStore::new());
        let templates = Arc::new(InMemoryTemplateRepository::new());
        let send_log = Arc::new(InMemorySendLog::new());
        let sender = EmailSender::new(
            mailer.clone(),
            attachments.clone(),
            Arc::new(TemplateRenderer::new()),
            templates.clone(),
            send_log.clone(),
            "<p>-- footer --</p>".to_string(),
            "-- footer --".to_string(),
            "noreply@example.com".to_string(),
            "TFP Notifier".to_string(),
        );
        Fixture {
            mailer,
            attachments,
            templates,
            send_log,
            sender,
        }
    }

    fn mapping() -> EventMapping {
        EventMapping {
            stream: "tfp-order-events-stream".to_string(),
            event_type: "PURCHASE_ORDER_CREATED".to_string(),
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

    fn po_template() -> EmailTemplate {
        EmailTemplate {
            id: 1,
            code: "PO_CREATED".to_string(),
            subject: "Purchase order {{data.id_purchase_order}}".to_string(),
            body: "Order {{data.id_purchase_order}} from {{data.supplier_name}}".to_string(),
            is_html: false,
            active: true,
        }
    }

    #[test]
    fn test_apply_footer_rules() {
        assert_eq!(
            apply_footer("<body>hi</body>", true, "<hr>", ""),
            "<body>hi<hr></body>"
        );
        assert_eq!(apply_footer("<p>hi</p>", true, "<hr>", ""), "<p>hi</p><hr>");
        assert_eq!(apply_footer("hi", false, "", "bye"), "hi\n\nbye");
        assert_eq!(apply_footer("hi", false, "", ""), "hi");
        assert_eq!(apply_footer("<body>hi</body>", true, "", ""), "<body>hi</body>");
    }

    #[test]
    fn test_direct_request_accepts_string_and_array_recipients() {
        let request = DirectEmailRequest::from_parameters(&json!({
            "to": "a@example.com; b@example.com",
            "cc": ["c@example.com"],
            "subject": "s",
            "body": "b"
        }))
        .unwrap();
        assert_eq!(request.to, vec!["a@example.com", "b@example.com"]);
        assert_eq!(request.cc, vec!["c@example.com"]);
        assert!(!request.is_html);
        assert!(!request.delete_attachments);

        assert!(DirectEmailRequest::from_parameters(&json!({"subject": "s"})).is_err());
    }

    #[tokio::test]
    async fn test_template_send_renders_and_logs_sent() {
        let fx = fixture();
        fx.templates.add_template(po_template());
        fx.templates.add_list(
            "purchasing",
            Recipients {
                to: vec!["buyer@example.com".to_string()],
                cc: vec![],
                bcc: vec![],
            },
        );
        fx.templates.attach_list(1, "purchasing");

        let variables = json!({
            "data": {"id_purchase_order": 1021, "supplier_name": "ACME"}
        });
        let log_id = fx
            .sender
            .send_from_template(1, &mapping(), &variables, Some("purchase_order"), Some("1021"), "notifier")
            .await
            .unwrap();

        assert_eq!(fx.send_log.status_of(log_id), Some(SendStatus::Sent));
        let sent = fx.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.starts_with("Order 1021 from ACME"));
        assert_eq!(sent[0].to, vec!["buyer@example.com"]);
        assert_eq!(sent[0].subject, "Purchase order 1021");
    }

    #[tokio::test]
    async fn test_inactive_template_is_rejected() {
        let fx = fixture();
        fx.templates.add_template(EmailTemplate {
            active: false,
            ..po_template()
        });
        let result = fx
            .sender
            .send_from_template(1, &mapping(), &json!({}), None, None, "notifier")
            .await;
        assert!(matches!(result, Err(NotifyError::Template(_))));
        assert!(fx.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_single_mail_uses_parameter_address_only() {
        let fx = fixture();
        fx.templates.add_template(po_template());
        // lists exist but must be ignored
        fx.templates.add_list(
            "purchasing",
            Recipients::single("ignored@example.com".to_string()),
        );
        fx.templates.attach_list(1, "purchasing");

        let mut mapping = mapping();
        mapping.single_mail = true;
        let variables = json!({"parameters": {"email": "direct@example.com"}});
        fx.sender
            .send_from_template(1, &mapping, &variables, None, None, "notifier")
            .await
            .unwrap();

        assert_eq!(fx.mailer.sent()[0].to, vec!["direct@example.com"]);
    }

    #[tokio::test]
    async fn test_empty_recipients_is_a_configuration_error() {
        let fx = fixture();
        fx.templates.add_template(po_template());
        let result = fx
            .sender
            .send_from_template(1, &mapping(), &json!({}), None, None, "notifier")
            .await;
        assert!(matches!(result, Err(NotifyError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_template_mode_attachment_is_best_effort() {
        let fx = fixture();
        fx.templates.add_template(po_template());
        fx.templates
            .add_list("l", Recipients::single("x@example.com".to_string()));
        fx.templates.attach_list(1, "l");

        // attachment 99 does not exist; the mail still goes out
        let variables = json!({"parameters": {"attachment_id": 99}, "data": {}});
        let log_id = fx
            .sender
            .send_from_template(1, &mapping(), &variables, None, None, "notifier")
            .await
            .unwrap();

        assert_eq!(fx.send_log.status_of(log_id), Some(SendStatus::Sent));
        assert!(fx.mailer.sent()[0].attachments.is_empty());
    }

    #[tokio::test]
    async fn test_direct_send_attachment_failure_aborts_before_smtp() {
        let fx = fixture();
        fx.attachments.put(10, "a.pdf", b"aa");
        // id 11 missing: the second download fails
        let request = DirectEmailRequest {
            from: None,
            sender_name: None,
            to: vec!["ops@example.com".to_string()],
            cc: vec![],
            ccn: vec![],
            subject: "s".to_string(),
            body: "b".to_string(),
            is_html: false,
            attachments: vec![10, 11, 12],
            delete_attachments: true,
        };
        let log_id = fx
            .sender
            .send_direct(&request, Some("ID:direct-1"), "notifier")
            .await
            .unwrap();

        assert_eq!(fx.send_log.status_of(log_id), Some(SendStatus::Failed));
        assert!(fx.mailer.sent().is_empty());
        assert!(fx.attachments.deleted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_direct_send_success_deletes_attachments() {
        let fx = fixture();
        fx.attachments.put(10, "a.pdf", b"aa");
        fx.attachments.put(11, "b.pdf", b"bb");
        let request = DirectEmailRequest {
            from: Some("sales@example.com".to_string()),
            sender_name: Some("Sales".to_string()),
            to: vec!["ops@example.com".to_string()],
            cc: vec![],
            ccn: vec![],
            subject: "s".to_string(),
            body: "b".to_string(),
            is_html: false,
            attachments: vec![10, 11],
            delete_attachments: true,
        };
        let log_id = fx
            .sender
            .send_direct(&request, None, "notifier")
            .await
            .unwrap();

        assert_eq!(fx.send_log.status_of(log_id), Some(SendStatus::Sent));
        let sent = fx.mailer.sent();
        assert_eq!(sent[0].from_address, "sales@example.com");
        assert_eq!(sent[0].attachments.len(), 2);
        assert_eq!(fx.attachments.deleted_ids(), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_direct_send_smtp_failure_marks_failed_and_keeps_attachments() {
        let fx = fixture();
        fx.mailer.set_failing(true);
        fx.attachments.put(10, "a.pdf", b"aa");
        let request = DirectEmailRequest {
            from: None,
            sender_name: None,
            to: vec!["ops@example.com".to_string()],
            cc: vec![],
            ccn: vec![],
            subject: "s".to_string(),
            body: "b".to_string(),
            is_html: false,
            attachments: vec![10],
            delete_attachments: true,
        };
        let log_id = fx
            .sender
            .send_direct(&request, None, "notifier")
            .await
            .unwrap();

        assert_eq!(fx.send_log.status_of(log_id), Some(SendStatus::Failed));
        assert!(fx.attachments.deleted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_retry_sweep_moves_rows_to_sent_or_back_to_retry() {
        let fx = fixture();
        let id = fx.send_log.seed_retry(
            NewSendLog {
                template_id: None,
                template_code: None,
                to: vec!["ops@example.com".to_string()],
                cc: vec![],
                bcc: vec![],
                subject: "s".to_string(),
                body: "b".to_string(),
                is_html: false,
                variables: None,
                entity_type: None,
                entity_id: None,
                sent_by: None,
            },
            1,
            "previous failure",
        );

        // First sweep with a failing transport: stays RETRY, attempts bumped.
        fx.mailer.set_failing(true);
        let summary = fx.sender.retry_failed_emails(5).await.unwrap();
        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.still_failing, 1);
        assert_eq!(fx.send_log.status_of(id), Some(SendStatus::Retry));
        assert_eq!(fx.send_log.entry(id).unwrap().attempts, 2);

        // Second sweep succeeds.
        fx.mailer.set_failing(false);
        let summary = fx.sender.retry_failed_emails(5).await.unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(fx.send_log.status_of(id), Some(SendStatus::Sent));
    }

    #[tokio::test]
    async fn test_retry_sweep_skips_exhausted_rows() {
        let fx = fixture();
        fx.send_log.seed_retry(
            NewSendLog {
                template_id: None,
                template_code: None,
                to: vec!["ops@example.com".to_string()],
                cc: vec![],
                bcc: vec![],
                subject: "s".to_string(),
                body: "b".to_string(),
                is_html: false,
                variables: None,
                entity_type: None,
                entity_id: None,
                sent_by: None,
            },
            5,
            "exhausted",
        );
        let summary = fx.sender.retry_failed_emails(3).await.unwrap();
        assert_eq!(summary.scanned, 0);
        assert!(fx.mailer.sent().is_empty());
    }
}
