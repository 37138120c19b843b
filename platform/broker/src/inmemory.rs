//! In-memory implementation of the [`SourceBroker`] trait.
//!
//! Models the semantics the gateway depends on: multicast fan-out to every
//! subscription on an address, shared consumption within a subscription, and
//! redelivery of rejected-with-requeue messages.

use crate::{
    Acknowledger, BrokerDelivery, BrokerError, BrokerResult, SourceBroker, Subscription,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct QueuedMessage {
    message_id: Option<String>,
    body: String,
    redelivered: bool,
}

#[derive(Default)]
struct SubscriptionQueue {
    entries: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
}

#[derive(Default)]
struct Inner {
    // address -> destination queue name -> queue
    addresses: HashMap<String, HashMap<String, Arc<SubscriptionQueue>>>,
}

/// Dev/test broker backed by in-process queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh logical connection to the in-process broker. Queues and
    /// their contents survive; only the closed flag is cleared, matching a
    /// real broker where durable subscriptions outlive connections.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Deliver a message to every subscription currently on the address
    /// (multicast). With no subscription, the message is dropped.
    pub fn publish(&self, address: &str, message_id: Option<&str>, body: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some(queues) = inner.addresses.get(address) {
            for queue in queues.values() {
                queue.entries.lock().unwrap().push_back(QueuedMessage {
                    message_id: message_id.map(str::to_string),
                    body: body.to_string(),
                    redelivered: false,
                });
                queue.notify.notify_waiters();
            }
        }
    }

    /// Messages still sitting in a destination queue (test inspection).
    pub fn queued(&self, address: &str, destination: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .addresses
            .get(address)
            .and_then(|q| q.get(destination))
            .map(|q| q.entries.lock().unwrap().len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SourceBroker for InMemoryBroker {
    async fn subscribe(
        &self,
        address: &str,
        subscription: &Subscription,
    ) -> BrokerResult<BoxStream<'static, BrokerDelivery>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let destination = subscription.destination(address);
        let queue = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .addresses
                .entry(address.to_string())
                .or_default()
                .entry(destination)
                .or_default()
                .clone()
        };

        let address = address.to_string();
        let closed = self.closed.clone();
        let stream = futures::stream::unfold((queue, address, closed), |state| async move {
            let (queue, address, closed) = state;
            loop {
                if closed.load(Ordering::SeqCst) {
                    return None;
                }
                let next = queue.entries.lock().unwrap().pop_front();
                if let Some(message) = next {
                    let delivery = BrokerDelivery::new(
                        address.clone(),
                        message.message_id.clone(),
                        message.body.clone(),
                        message.redelivered,
                        Box::new(InMemoryAcker {
                            queue: queue.clone(),
                            message,
                        }),
                    );
                    return Some((delivery, (queue, address, closed)));
                }
                let _ = tokio::time::timeout(Duration::from_millis(50), queue.notify.notified())
                    .await;
            }
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        for queues in inner.addresses.values() {
            for queue in queues.values() {
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

struct InMemoryAcker {
    queue: Arc<SubscriptionQueue>,
    message: QueuedMessage,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(self: Box<Self>) -> BrokerResult<()> {
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> BrokerResult<()> {
        if requeue {
            let mut message = self.message;
            message.redelivered = true;
            self.queue.entries.lock().unwrap().push_front(message);
            self.queue.notify.notify_waiters();
        }
        Ok(())
    }
}
