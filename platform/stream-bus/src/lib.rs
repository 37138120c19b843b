//! # Stream Store Abstraction
//!
//! A platform-level abstraction for the append-only stream store that links
//! the gateway to its downstream consumers.
//!
//! Records are flat string-field maps appended to named streams. Consumer
//! groups give each processor its own cursor and a pending-entry list (PEL):
//! an entry delivered to a consumer stays pending until acknowledged, and
//! unacknowledged entries are redelivered to the same consumer on its next
//! read. That PEL is the retry queue for the whole fabric.
//!
//! ## Implementations
//!
//! - **RedisStreamBus**: production implementation over Redis streams
//!   (XADD / XGROUP CREATE / XREADGROUP / XACK)
//! - **InMemoryStreamBus**: dev/test implementation with the same
//!   consumer-group and PEL semantics

mod inmemory_bus;
mod record;
mod redis_bus;
pub mod retry;

pub use inmemory_bus::InMemoryStreamBus;
pub use record::{parse_resend_flag, unquote_field, StreamRecord, RESEND_METADATA_KEY};
pub use redis_bus::RedisStreamBus;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// One entry read from a stream: the store-assigned id plus the flat fields.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Errors that can occur when talking to the stream store
#[derive(Debug, thiserror::Error)]
pub enum StreamBusError {
    #[error("stream connection error: {0}")]
    Connection(String),

    #[error("stream command error: {0}")]
    Command(String),

    #[error("consumer group error on '{group}': {message}")]
    GroupCreate { group: String, message: String },
}

pub type StreamResult<T> = Result<T, StreamBusError>;

/// Core stream-store abstraction.
///
/// All implementations must provide at-least-once delivery per consumer
/// group: an entry handed out by `read_group` is redelivered on subsequent
/// reads until `ack` is called for it.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Append a flat-field record to a stream and return the assigned id.
    async fn publish(&self, stream: &str, fields: &[(String, String)]) -> StreamResult<String>;

    /// Create the consumer group from the beginning of the stream if it does
    /// not exist yet. "Already exists" is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> StreamResult<()>;

    /// Read up to `count` entries for this consumer.
    ///
    /// Entries already pending for this consumer (delivered but never
    /// acknowledged) are returned before any new entry. When nothing is
    /// available, blocks up to `block` and then returns an empty vec.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamEntry>>;

    /// Acknowledge a delivered entry, removing it from the pending list.
    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> StreamResult<()>;
}
