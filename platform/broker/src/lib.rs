//! # Source Broker Abstraction
//!
//! A platform-level abstraction over the message broker the gateway ingests
//! from.
//!
//! Addresses are multicast endpoints: a durable shared subscription on an
//! address receives every message published to it, shared among the
//! subscription's consumers. An empty subscriber name degrades to a plain
//! anycast queue named after the address.
//!
//! ## Implementations
//!
//! - **AmqpBroker**: production implementation over AMQP 0.9.1 (an address
//!   maps to a fanout exchange, a durable shared subscription to a durable
//!   queue named `{subscriber}.{address}`)
//! - **InMemoryBroker**: dev/test implementation with redelivery semantics

mod amqp;
mod inmemory;
mod reconnect;

pub use amqp::AmqpBroker;
pub use inmemory::InMemoryBroker;
pub use reconnect::{ReconnectPolicy, ReconnectSchedule};

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Errors that can occur when using the source broker
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("consume error on '{address}': {message}")]
    Consume { address: String, message: String },

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("broker connection closed")]
    Closed,
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// How a listener settles deliveries after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge successfully processed messages (normal operation).
    Auto,
    /// Process but reject-with-requeue afterwards so the broker redelivers.
    /// Debug-only: every use is loudly logged.
    SuppressAndRedeliver,
}

/// Subscription parameters for one address.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Durable shared subscription name; `None` means a plain anycast queue.
    pub subscriber_name: Option<String>,
    /// Per-consumer unacknowledged-message window.
    pub prefetch: u16,
}

impl Subscription {
    /// The physical destination this subscription binds to.
    pub fn destination(&self, address: &str) -> String {
        match &self.subscriber_name {
            Some(name) if !name.is_empty() => format!("{name}.{address}"),
            _ => address.to_string(),
        }
    }
}

/// Settlement handle for one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> BrokerResult<()>;
    /// Reject the delivery; `requeue` asks the broker to redeliver it.
    async fn reject(self: Box<Self>, requeue: bool) -> BrokerResult<()>;
}

/// A message received from the broker, with its settlement handle.
pub struct BrokerDelivery {
    pub address: String,
    /// Broker-assigned message id, when the producer set one.
    pub message_id: Option<String>,
    pub body: String,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl BrokerDelivery {
    pub fn new(
        address: String,
        message_id: Option<String>,
        body: String,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            address,
            message_id,
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> BrokerResult<()> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for BrokerDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerDelivery")
            .field("address", &self.address)
            .field("message_id", &self.message_id)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Core source-broker abstraction.
#[async_trait]
pub trait SourceBroker: Send + Sync {
    /// Open a consumer on an address. The returned stream yields deliveries
    /// until the consumer is cancelled or the connection drops.
    async fn subscribe(
        &self,
        address: &str,
        subscription: &Subscription,
    ) -> BrokerResult<BoxStream<'static, BrokerDelivery>>;

    /// Close the underlying connection; outstanding streams terminate.
    async fn close(&self) -> BrokerResult<()>;
}
