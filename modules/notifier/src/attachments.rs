//! Attachment download and post-send cleanup against the backend store.

use crate::NotifyError;
use async_trait::async_trait;
use std::time::Duration;
use stream_bus::retry::{retry_with_backoff, RetryConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAttachment {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: String,
}

#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Download one attachment; any transport problem, non-2xx status or
    /// empty body is an error.
    async fn fetch(&self, id: i64) -> Result<FetchedAttachment, NotifyError>;

    /// Hard-delete attachments after a successful send. Per-id failures are
    /// logged and the iteration continues.
    async fn delete(&self, ids: &[i64]);
}

/// Pull the filename out of a Content-Disposition header value, stripping
/// surrounding quotes.
pub fn filename_from_content_disposition(header: &str) -> Option<String> {
    let marker = header.split(';').map(str::trim).find_map(|part| {
        part.strip_prefix("filename=")
            .or_else(|| part.strip_prefix("FILENAME="))
    })?;
    let trimmed = marker.trim().trim_matches('"');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub struct HttpAttachmentStore {
    http: reqwest::Client,
    base_url: String,
    download_path: String,
    api_key: String,
    retry: RetryConfig,
}

impl HttpAttachmentStore {
    pub fn new(
        base_url: String,
        download_path: String,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        Self::with_retry(base_url, download_path, api_key, timeout, RetryConfig::default())
    }

    pub fn with_retry(
        base_url: String,
        download_path: String,
        api_key: String,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Attachment(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            download_path,
            api_key,
            retry,
        })
    }

    fn download_url(&self, id: i64) -> String {
        format!(
            "{}{}",
            self.base_url,
            self.download_path.replace("{id}", &id.to_string())
        )
    }

    async fn fetch_once(&self, id: i64) -> Result<FetchedAttachment, NotifyError> {
        let response = self
            .http
            .get(self.download_url(id))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| NotifyError::Attachment(format!("attachment {id}: {e}")))?
            .error_for_status()
            .map_err(|e| NotifyError::Attachment(format!("attachment {id}: {e}")))?;

        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_content_disposition)
            .unwrap_or_else(|| format!("attachment_{id}"));
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| NotifyError::Attachment(format!("attachment {id}: {e}")))?;
        if bytes.is_empty() {
            return Err(NotifyError::Attachment(format!(
                "attachment {id}: empty body"
            )));
        }

        Ok(FetchedAttachment {
            bytes: bytes.to_vec(),
            filename,
            content_type,
        })
    }
}

#[async_trait]
impl AttachmentStore for HttpAttachmentStore {
    async fn fetch(&self, id: i64) -> Result<FetchedAttachment, NotifyError> {
        retry_with_backoff(|| self.fetch_once(id), &self.retry, "attachment_fetch").await
    }

    async fn delete(&self, ids: &[i64]) {
        for id in ids {
            let url = format!("{}/api/attachments/{id}?hard=true", self.base_url);
            let result = self
                .http
                .delete(&url)
                .header("X-API-Key", &self.api_key)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => tracing::debug!(attachment_id = id, "Attachment deleted"),
                Err(e) => tracing::warn!(
                    attachment_id = id,
                    error = %e,
                    "Failed to delete attachment, continuing"
                ),
            }
        }
    }
}

/// In-process attachment store for dev and tests.
#[derive(Default)]
pub struct InMemoryAttachmentStore {
    available: std::sync::Mutex<std::collections::HashMap<i64, FetchedAttachment>>,
    deleted: std::sync::Mutex<Vec<i64>>,
}

impl InMemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, id: i64, filename: &str, bytes: &[u8]) {
        self.available.lock().unwrap().insert(
            id,
            FetchedAttachment {
                bytes: bytes.to_vec(),
                filename: filename.to_string(),
                content_type: "application/octet-stream".to_string(),
            },
        );
    }

    pub fn deleted_ids(&self) -> Vec<i64> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttachmentStore for InMemoryAttachmentStore {
    async fn fetch(&self, id: i64) -> Result<FetchedAttachment, NotifyError> {
        self.available
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| NotifyError::Attachment(format!("attachment {id}: not found")))
    }

    async fn delete(&self, ids: &[i64]) {
        self.deleted.lock().unwrap().extend_from_slice(ids);
    }
}
