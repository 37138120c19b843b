//! Email templates and their recipient lists.

use crate::NotifyError;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, FromRow)]
pub struct EmailTemplate {
    pub id: i64,
    pub code: String,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
    pub active: bool,
}

/// Resolved TO/CC/BCC addresses for one send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipients {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

impl Recipients {
    pub fn is_empty(&self) -> bool {
        self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty()
    }

    pub fn single(address: String) -> Self {
        Self {
            to: vec![address],
            ..Self::default()
        }
    }

    fn push(&mut self, kind: &str, address: String) {
        match kind {
            "TO" => self.to.push(address),
            "CC" => self.cc.push(address),
            "BCC" => self.bcc.push(address),
            other => tracing::warn!(kind = %other, "Unknown recipient kind, skipping"),
        }
    }
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn find_by_code(&self, code: &str) -> Result<Option<EmailTemplate>, NotifyError>;
    async fn find_by_id(&self, id: i64) -> Result<Option<EmailTemplate>, NotifyError>;
    /// Union of the template's associated recipient lists.
    async fn recipients_for_template(&self, template_id: i64) -> Result<Recipients, NotifyError>;
    /// One named list, for mappings that override the template's lists.
    async fn recipients_for_list(&self, list_name: &str) -> Result<Recipients, NotifyError>;
}

#[derive(Clone)]
pub struct PgTemplateRepository {
    pool: PgPool,
}

impl PgTemplateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for PgTemplateRepository {
    async fn find_by_code(&self, code: &str) -> Result<Option<EmailTemplate>, NotifyError> {
        Ok(sqlx::query_as::<_, EmailTemplate>(
            "SELECT id, code, subject, body, is_html, active FROM email_templates WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<EmailTemplate>, NotifyError> {
        Ok(sqlx::query_as::<_, EmailTemplate>(
            "SELECT id, code, subject, body, is_html, active FROM email_templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn recipients_for_template(&self, template_id: i64) -> Result<Recipients, NotifyError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT m.kind, m.address
            FROM email_template_lists tl
            JOIN email_recipient_list_members m ON m.list_id = tl.list_id
            WHERE tl.template_id = $1
            ORDER BY m.id
            "#,
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await?;

        let mut recipients = Recipients::default();
        for (kind, address) in rows {
            recipients.push(&kind, address);
        }
        Ok(recipients)
    }

    async fn recipients_for_list(&self, list_name: &str) -> Result<Recipients, NotifyError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT m.kind, m.address
            FROM email_recipient_lists l
            JOIN email_recipient_list_members m ON m.list_id = l.id
            WHERE l.name = $1
            ORDER BY m.id
            "#,
        )
        .bind(list_name)
        .fetch_all(&self.pool)
        .await?;

        let mut recipients = Recipients::default();
        for (kind, address) in rows {
            recipients.push(&kind, address);
        }
        Ok(recipients)
    }
}

/// In-process template catalogue for dev and tests.
#[derive(Default)]
pub struct InMemoryTemplateRepository {
    templates: Mutex<Vec<EmailTemplate>>,
    template_lists: Mutex<HashMap<i64, Vec<String>>>,
    lists: Mutex<HashMap<String, Recipients>>,
}

impl InMemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_template(&self, template: EmailTemplate) {
        self.templates.lock().unwrap().push(template);
    }

    pub fn add_list(&self, name: &str, recipients: Recipients) {
        self.lists
            .lock()
            .unwrap()
            .insert(name.to_string(), recipients);
    }

    pub fn attach_list(&self, template_id: i64, list_name: &str) {
        self.template_lists
            .lock()
            .unwrap()
            .entry(template_id)
            .or_default()
            .push(list_name.to_string());
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepository {
    async fn find_by_code(&self, code: &str) -> Result<Option<EmailTemplate>, NotifyError> {
        Ok(self
            .templates
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.code == code)
            .cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<EmailTemplate>, NotifyError> {
        Ok(self
            .templates
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn recipients_for_template(&self, template_id: i64) -> Result<Recipients, NotifyError> {
        let list_names = self
            .template_lists
            .lock()
            .unwrap()
            .get(&template_id)
            .cloned()
            .unwrap_or_default();
        let lists = self.lists.lock().unwrap();
        let mut recipients = Recipients::default();
        for name in list_names {
            if let Some(list) = lists.get(&name) {
                recipients.to.extend(list.to.iter().cloned());
                recipients.cc.extend(list.cc.iter().cloned());
                recipients.bcc.extend(list.bcc.iter().cloned());
            }
        }
        Ok(recipients)
    }

    async fn recipients_for_list(&self, list_name: &str) -> Result<Recipients, NotifyError> {
        Ok(self
            .lists
            .lock()
            .unwrap()
            .get(list_name)
            .cloned()
            .unwrap_or_default())
    }
}
