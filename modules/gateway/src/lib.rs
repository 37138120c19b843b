//! Gateway: durable consumer of the source broker, idempotent raw-event
//! persister and publisher to the named streams.

pub mod config;
pub mod control;
pub mod digest;
pub mod listener;
pub mod pipeline;
pub mod publisher;
pub mod raw_events;
pub mod routes;

/// Errors surfaced by gateway operations
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("broker error: {0}")]
    Broker(#[from] broker::BrokerError),

    #[error("stream error: {0}")]
    Stream(#[from] stream_bus::StreamBusError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Configuration(String),
}
