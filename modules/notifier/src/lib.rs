//! Notifier: event-driven template rendering and audited email dispatch.

pub mod attachments;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod email;
pub mod renderer;
pub mod send_log;
pub mod templates;

/// Errors raised across the notifier
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("template error: {0}")]
    Template(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("attachment error: {0}")]
    Attachment(String),

    #[error("smtp error: {0}")]
    Smtp(String),

    #[error("invalid address '{0}'")]
    Address(String),
}
