//! Stream consumption for the notifier: one consumer task per configured
//! (stream, consumer-group) pair, feeding the dispatcher.

use crate::dispatcher::NotificationDispatcher;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stream_bus::{unquote_field, StreamBus, StreamBusError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn consumer_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("notifier-{}", uuid::Uuid::new_v4()))
}

pub struct NotificationConsumer {
    bus: Arc<dyn StreamBus>,
    dispatcher: Arc<NotificationDispatcher>,
    consumer: String,
    poll_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl NotificationConsumer {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        dispatcher: Arc<NotificationDispatcher>,
        poll_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bus,
            dispatcher,
            consumer: consumer_name(),
            poll_timeout,
            shutdown_tx,
        }
    }

    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, StreamBusError> {
        let bindings = self.dispatcher.consumer_bindings();
        let mut handles = Vec::with_capacity(bindings.len());
        for (stream, group) in bindings {
            self.bus.ensure_group(&stream, &group).await?;
            handles.push(self.spawn_loop(stream, group));
        }
        tracing::info!(
            consumers = handles.len(),
            consumer = %self.consumer,
            "Notification consumers started"
        );
        Ok(handles)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_loop(&self, stream: String, group: String) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let dispatcher = self.dispatcher.clone();
        let consumer = self.consumer.clone();
        let poll_timeout = self.poll_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let entries = tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    read = bus.read_group(&stream, &group, &consumer, 1, poll_timeout) => {
                        match read {
                            Ok(entries) => entries,
                            Err(e) => {
                                tracing::warn!(
                                    stream = %stream,
                                    group = %group,
                                    error = %e,
                                    "Stream read failed, backing off"
                                );
                                tokio::time::sleep(Duration::from_secs(1)).await;
                                continue;
                            }
                        }
                    }
                };

                for entry in entries {
                    let fields: HashMap<String, String> = entry
                        .fields
                        .iter()
                        .map(|(k, v)| (k.clone(), unquote_field(v)))
                        .collect();

                    let should_ack = dispatcher.dispatch(&stream, &fields).await;
                    if should_ack {
                        if let Err(e) = bus.ack(&stream, &group, &entry.id).await {
                            tracing::warn!(
                                stream = %stream,
                                entry_id = %entry.id,
                                error = %e,
                                "Acknowledge failed, entry will be redelivered"
                            );
                        }
                    }
                }
            }
            tracing::info!(stream = %stream, group = %group, "Notification consumer stopped");
        })
    }
}
