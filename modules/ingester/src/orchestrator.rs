//! Stream listener orchestration: one consumer task per registered
//! processor, pulling serially from its group so each message is fully
//! handled before the next is claimed.

use crate::error_ingestion::ErrorIngestion;
use crate::processor::StreamProcessor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stream_bus::{unquote_field, StreamBus, StreamBusError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Consumer identity within the groups: the host name when available,
/// otherwise a synthesized id.
pub fn consumer_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::new_v4()))
}

pub struct StreamOrchestrator {
    bus: Arc<dyn StreamBus>,
    errors: Arc<dyn ErrorIngestion>,
    processors: Vec<Arc<dyn StreamProcessor>>,
    consumer: String,
    poll_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamOrchestrator {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        errors: Arc<dyn ErrorIngestion>,
        poll_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bus,
            errors,
            processors: Vec::new(),
            consumer: consumer_name(),
            poll_timeout,
            shutdown_tx,
        }
    }

    /// Explicit registration replaces container auto-discovery: every
    /// processor is handed in during startup.
    pub fn register(&mut self, processor: Arc<dyn StreamProcessor>) {
        tracing::info!(
            processor = %processor.processor_name(),
            stream = %processor.stream_key(),
            group = %processor.consumer_group(),
            "Processor registered"
        );
        self.processors.push(processor);
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Ensure every consumer group exists, then spawn one consumer loop per
    /// processor.
    pub async fn start(&self) -> Result<Vec<JoinHandle<()>>, StreamBusError> {
        let mut handles = Vec::with_capacity(self.processors.len());
        for processor in &self.processors {
            self.bus
                .ensure_group(processor.stream_key(), processor.consumer_group())
                .await?;
            handles.push(self.spawn_consumer(processor.clone()));
        }
        tracing::info!(
            processors = self.processors.len(),
            consumer = %self.consumer,
            "Stream orchestrator started"
        );
        Ok(handles)
    }

    /// Signal every consumer loop to stop after its in-flight message.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn spawn_consumer(&self, processor: Arc<dyn StreamProcessor>) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let errors = self.errors.clone();
        let consumer = self.consumer.clone();
        let poll_timeout = self.poll_timeout;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let stream = processor.stream_key().to_string();
            let group = processor.consumer_group().to_string();
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
                    let message_id = fields.get("message_id").cloned().unwrap_or_default();

                    match processor.process(&fields).await {
                        Ok(()) => {
                            if let Err(e) = bus.ack(&stream, &group, &entry.id).await {
                                tracing::warn!(
                                    stream = %stream,
                                    entry_id = %entry.id,
                                    message_id = %message_id,
                                    error = %e,
                                    "Acknowledge failed, entry will be redelivered"
                                );
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                processor = %processor.processor_name(),
                                stream = %stream,
                                message_id = %message_id,
                                error = %e,
                                "Processing failed, leaving entry pending for retry"
                            );
                            if !message_id.is_empty() {
                                // Best-effort; the sink logs its own failures.
                                errors.record(&message_id, &e.to_string()).await;
                            }
                            // No ack: the entry stays in the pending list.
                        }
                    }
                }
            }
            tracing::info!(
                processor = %processor.processor_name(),
                stream = %stream,
                "Consumer loop stopped"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_ingestion::InMemoryErrorIngestion;
    use crate::processor::ProcessError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use stream_bus::InMemoryStreamBus;

    struct FlakyProcessor {
        failures_left: AtomicUsize,
        processed: Mutex<Vec<String>>,
    }

    impl FlakyProcessor {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures_left: AtomicUsize::new(failures),
                processed: Mutex::new(Vec::new()),
            })
        }

        fn processed(&self) -> Vec<String> {
            self.processed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamProcessor for FlakyProcessor {
        fn stream_key(&self) -> &str {
            "tfp-unit-events-stream"
        }

        fn consumer_group(&self) -> &str {
            "unit-events-ingester"
        }

        fn processor_name(&self) -> &str {
            "flaky"
        }

        async fn process(&self, fields: &HashMap<String, String>) -> Result<(), ProcessError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProcessError::Other("transient failure".to_string()));
            }
            self.processed
                .lock()
                .unwrap()
                .push(fields.get("message_id").cloned().unwrap_or_default());
            Ok(())
        }
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn record_fields(message_id: &str) -> Vec<(String, String)> {
        vec![
            ("message_id".to_string(), message_id.to_string()),
            ("event_type".to_string(), "UNIT_EVENTS".to_string()),
            // quoted scalar: the orchestrator must unquote before dispatch
            ("payload".to_string(), "{}".to_string()),
            ("note".to_string(), "\"quoted \\\"value\\\"\"".to_string()),
        ]
    }

    #[tokio::test]
    async fn test_success_acknowledges_entry() {
        let bus = InMemoryStreamBus::new();
        let processor = FlakyProcessor::new(0);
        let errors = Arc::new(InMemoryErrorIngestion::new());
        let mut orchestrator = StreamOrchestrator::new(
            Arc::new(bus.clone()),
            errors.clone(),
            Duration::from_millis(50),
        );
        orchestrator.register(processor.clone());
        let handles = orchestrator.start().await.unwrap();

        bus.publish("tfp-unit-events-stream", &record_fields("m-1"))
            .await
            .unwrap();

        wait_until("message processed", || processor.processed().len() == 1).await;
        wait_until("entry acknowledged", || {
            bus.pending_count("tfp-unit-events-stream", "unit-events-ingester") == 0
        })
        .await;
        assert!(errors.is_empty());

        orchestrator.shutdown();
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn test_failure_records_error_and_leaves_entry_pending() {
        let bus = InMemoryStreamBus::new();
        let processor = FlakyProcessor::new(1);
        let errors = Arc::new(InMemoryErrorIngestion::new());
        let mut orchestrator = StreamOrchestrator::new(
            Arc::new(bus.clone()),
            errors.clone(),
            Duration::from_millis(50),
        );
        orchestrator.register(processor.clone());
        let _handles = orchestrator.start().await.unwrap();

        bus.publish("tfp-unit-events-stream", &record_fields("m-2"))
            .await
            .unwrap();

        // First delivery fails: error row recorded, entry redelivered from
        // the PEL, second delivery succeeds.
        wait_until("error recorded", || !errors.rows_for("m-2").is_empty()).await;
        wait_until("message eventually processed", || {
            processor.processed() == vec!["m-2".to_string()]
        })
        .await;
        wait_until("entry acknowledged after retry", || {
            bus.pending_count("tfp-unit-events-stream", "unit-events-ingester") == 0
        })
        .await;
        assert_eq!(errors.rows_for("m-2").len(), 1);

        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_fields_are_unquoted_before_dispatch() {
        struct AssertingProcessor;

        #[async_trait]
        impl StreamProcessor for AssertingProcessor {
            fn stream_key(&self) -> &str {
                "s"
            }
            fn consumer_group(&self) -> &str {
                "g"
            }
            fn processor_name(&self) -> &str {
                "asserting"
            }
            async fn process(&self, fields: &HashMap<String, String>) -> Result<(), ProcessError> {
                assert_eq!(fields.get("note").unwrap(), "quoted \"value\"");
                Ok(())
            }
        }

        let bus = InMemoryStreamBus::new();
        let errors = Arc::new(InMemoryErrorIngestion::new());
        let mut orchestrator = StreamOrchestrator::new(
            Arc::new(bus.clone()),
            errors,
            Duration::from_millis(50),
        );
        orchestrator.register(Arc::new(AssertingProcessor));
        let _handles = orchestrator.start().await.unwrap();

        bus.publish("s", &record_fields("m-3")).await.unwrap();
        wait_until("entry acknowledged", || bus.pending_count("s", "g") == 0).await;
        orchestrator.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumer_loops() {
        let bus = InMemoryStreamBus::new();
        let processor = FlakyProcessor::new(0);
        let errors = Arc::new(InMemoryErrorIngestion::new());
        let mut orchestrator = StreamOrchestrator::new(
            Arc::new(bus.clone()),
            errors,
            Duration::from_millis(50),
        );
        orchestrator.register(processor);
        let handles = orchestrator.start().await.unwrap();

        orchestrator.shutdown();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .expect("consumer loop should stop promptly")
                .unwrap();
        }
    }
}
