use crate::dispatcher::EventMapping;
use std::env;
use std::time::Duration;

/// Notifier configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub database_url: String,
    pub db_pool_size: u32,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    pub poll_timeout: Duration,
    /// Event mappings, provided as a JSON array in NOTIFIER_MAPPINGS.
    pub mappings: Vec<EventMapping>,
    pub smtp: SmtpConfig,
    pub backend: BackendConfig,
    /// RETRY-status sweep settings.
    pub retry_max_attempts: i32,
    pub retry_sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub starttls: bool,
    pub from_address: String,
    pub from_name: String,
    pub footer_html: String,
    pub footer_plain: String,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub download_path: String,
    pub api_key: String,
    pub timeout: Duration,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64_or(name: &str, default: u64) -> Result<u64, String> {
    match env::var(name) {
        Ok(v) => v.parse().map_err(|_| format!("{name} must be a number")),
        Err(_) => Ok(default),
    }
}

impl NotifierConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let mappings_json = env_or("NOTIFIER_MAPPINGS", "[]");
        let mappings: Vec<EventMapping> = serde_json::from_str(&mappings_json)
            .map_err(|e| format!("NOTIFIER_MAPPINGS is not a valid mapping list: {e}"))?;

        Ok(Self {
            database_url,
            db_pool_size: env_or("DB_POOL_SIZE", "5")
                .parse()
                .map_err(|_| "DB_POOL_SIZE must be a number".to_string())?,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            host: env_or("HOST", "0.0.0.0"),
            port: env_or("PORT", "8082")
                .parse()
                .map_err(|_| "PORT must be a valid u16".to_string())?,
            poll_timeout: Duration::from_secs(env_u64_or("POLL_TIMEOUT_SECONDS", 5)?),
            mappings,
            smtp: SmtpConfig {
                host: env_or("SMTP_HOST", "localhost"),
                port: env_or("SMTP_PORT", "587")
                    .parse()
                    .map_err(|_| "SMTP_PORT must be a valid u16".to_string())?,
                username: env_or("SMTP_USERNAME", ""),
                password: env_or("SMTP_PASSWORD", ""),
                starttls: env_or("SMTP_STARTTLS", "true")
                    .parse()
                    .map_err(|_| "SMTP_STARTTLS must be true or false".to_string())?,
                from_address: env_or("MAIL_FROM_ADDRESS", "noreply@localhost"),
                from_name: env_or("MAIL_FROM_NAME", "Notifier"),
                footer_html: env_or("MAIL_FOOTER_HTML", ""),
                footer_plain: env_or("MAIL_FOOTER_PLAIN", ""),
            },
            backend: BackendConfig {
                base_url: env_or("BACKEND_BASE_URL", ""),
                download_path: env_or(
                    "ATTACHMENT_DOWNLOAD_PATH",
                    "/api/attachments/{id}/download",
                ),
                api_key: env_or("BACKEND_API_KEY", ""),
                timeout: Duration::from_millis(env_u64_or("BACKEND_TIMEOUT_MS", 10_000)?),
            },
            retry_max_attempts: env_or("EMAIL_RETRY_MAX_ATTEMPTS", "5")
                .parse()
                .map_err(|_| "EMAIL_RETRY_MAX_ATTEMPTS must be a number".to_string())?,
            retry_sweep_interval: Duration::from_secs(env_u64_or(
                "EMAIL_RETRY_SWEEP_SECONDS",
                300,
            )?),
        })
    }
}
