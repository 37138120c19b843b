//! Listener manager: one broker consumer pool per configured address.
//!
//! Lifecycle per listener: New -> Starting -> Running <-> Degraded ->
//! Stopping -> Stopped. Degraded is entered when the broker connection drops;
//! a single reconnect supervisor rebuilds the connection on the configured
//! schedule and respawns every listener. Start/stop/reconfigure are
//! serialized by one lifecycle mutex; status reads never take it.

use crate::config::{ConcurrencyBand, ListenerSettings};
use crate::pipeline::{DeliveryHandler, ProcessOutcome};
use crate::GatewayError;
use broker::{AckMode, BrokerDelivery, BrokerResult, SourceBroker, Subscription};
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Builds a broker connection from the active settings. Called at start and
/// on every reconnect attempt.
pub type BrokerFactory = Arc<
    dyn Fn(&ListenerSettings) -> BoxFuture<'static, BrokerResult<Arc<dyn SourceBroker>>>
        + Send
        + Sync,
>;

/// Builds the per-message handler from the active settings (the stream
/// mapping can change across `reconfigure`).
pub type HandlerFactory = Arc<dyn Fn(&ListenerSettings) -> Arc<dyn DeliveryHandler> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerState {
    New,
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
}

impl ListenerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Degraded,
            4 => Self::Stopping,
            5 => Self::Stopped,
            _ => Self::New,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Degraded => 3,
            Self::Stopping => 4,
            Self::Stopped => 5,
        }
    }
}

/// Shared, atomically readable state of one address listener.
pub struct ListenerHandle {
    pub address: String,
    pub destination: String,
    state: AtomicU8,
    active_consumers: AtomicUsize,
    busy_consumers: AtomicUsize,
    desired_consumers: AtomicUsize,
}

impl ListenerHandle {
    fn new(address: String, destination: String, desired: usize) -> Self {
        Self {
            address,
            destination,
            state: AtomicU8::new(ListenerState::New.as_u8()),
            active_consumers: AtomicUsize::new(0),
            busy_consumers: AtomicUsize::new(0),
            desired_consumers: AtomicUsize::new(desired),
        }
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ListenerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn active_consumers(&self) -> usize {
        self.active_consumers.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> ListenerStatus {
        let state = self.state();
        ListenerStatus {
            address: self.address.clone(),
            destination: self.destination.clone(),
            running: state == ListenerState::Running,
            active_consumers: self.active_consumers(),
            state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub address: String,
    pub destination: String,
    pub running: bool,
    pub active_consumers: usize,
    pub state: ListenerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallState {
    Running,
    Stopped,
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub state: OverallState,
    pub listeners: Vec<ListenerStatus>,
}

pub struct ListenerManager {
    broker_factory: BrokerFactory,
    handler_factory: HandlerFactory,
    settings: tokio::sync::RwLock<ListenerSettings>,
    lifecycle: tokio::sync::Mutex<()>,
    listeners: std::sync::RwLock<Vec<Arc<ListenerHandle>>>,
    broker: std::sync::Mutex<Option<Arc<dyn SourceBroker>>>,
    shutdown_tx: std::sync::Mutex<Option<watch::Sender<bool>>>,
}

impl ListenerManager {
    pub fn new(
        settings: ListenerSettings,
        broker_factory: BrokerFactory,
        handler_factory: HandlerFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker_factory,
            handler_factory,
            settings: tokio::sync::RwLock::new(settings),
            lifecycle: tokio::sync::Mutex::new(()),
            listeners: std::sync::RwLock::new(Vec::new()),
            broker: std::sync::Mutex::new(None),
            shutdown_tx: std::sync::Mutex::new(None),
        })
    }

    /// Build the broker connection and start one listener per address.
    /// Startup failures are fatal to the component.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Gracefully stop every consumer, then close the broker connection.
    pub async fn stop(self: &Arc<Self>) {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await;
    }

    /// stop -> apply -> start, atomic under the lifecycle mutex.
    pub async fn reconfigure(self: &Arc<Self>, settings: ListenerSettings) -> Result<(), GatewayError> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked().await;
        *self.settings.write().await = settings;
        self.start_locked().await
    }

    pub async fn current_settings(&self) -> ListenerSettings {
        self.settings.read().await.clone()
    }

    /// Point-in-time status; does not contend with lifecycle operations.
    pub fn status(&self) -> GatewayStatus {
        let listeners: Vec<ListenerStatus> = self
            .listeners
            .read()
            .unwrap()
            .iter()
            .map(|h| h.snapshot())
            .collect();
        let state = if listeners.is_empty() || listeners.iter().all(|l| !l.running) {
            OverallState::Stopped
        } else if listeners.iter().all(|l| l.running) {
            OverallState::Running
        } else {
            OverallState::Partial
        };
        GatewayStatus { state, listeners }
    }

    async fn start_locked(self: &Arc<Self>) -> Result<(), GatewayError> {
        // A second start while running is a restart.
        let already_running = self.shutdown_tx.lock().unwrap().is_some();
        if already_running {
            self.stop_locked().await;
        }
        let settings = self.settings.read().await.clone();

        let broker = (self.broker_factory)(&settings).await?;
        *self.broker.lock().unwrap() = Some(broker.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);

        let (degraded_tx, degraded_rx) = mpsc::channel::<String>(32);
        self.spawn_address_listeners(broker, &settings, shutdown_rx.clone(), degraded_tx)
            .await;
        self.spawn_reconnect_supervisor(degraded_rx, shutdown_rx);

        tracing::info!(
            addresses = settings.addresses.len(),
            subscriber = %settings.subscriber_name,
            "Gateway listeners started"
        );
        Ok(())
    }

    async fn stop_locked(self: &Arc<Self>) {
        for handle in self.listeners.read().unwrap().iter() {
            handle.set_state(ListenerState::Stopping);
        }
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }

        // Finish in-flight messages, bounded.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let active: usize = self
                .listeners
                .read()
                .unwrap()
                .iter()
                .map(|h| h.active_consumers())
                .sum();
            if active == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let broker = self.broker.lock().unwrap().take();
        if let Some(broker) = broker {
            if let Err(e) = broker.close().await {
                tracing::warn!(error = %e, "Error closing broker connection");
            }
        }
        for handle in self.listeners.read().unwrap().iter() {
            handle.set_state(ListenerState::Stopped);
        }
        tracing::info!("Gateway listeners stopped");
    }

    async fn spawn_address_listeners(
        self: &Arc<Self>,
        broker: Arc<dyn SourceBroker>,
        settings: &ListenerSettings,
        shutdown_rx: watch::Receiver<bool>,
        degraded_tx: mpsc::Sender<String>,
    ) {
        let handler = (self.handler_factory)(settings);
        let ack_mode = if settings.acknowledge_messages {
            AckMode::Auto
        } else {
            tracing::warn!(
                "ACKNOWLEDGE_MESSAGES is disabled: every message will be processed and then \
                 returned to the broker for redelivery. This is a debug mode."
            );
            AckMode::SuppressAndRedeliver
        };

        let subscriber_name = if settings.subscriber_name.is_empty() {
            None
        } else {
            Some(settings.subscriber_name.clone())
        };

        let mut handles = Vec::with_capacity(settings.addresses.len());
        for address in &settings.addresses {
            let subscription = Subscription {
                subscriber_name: subscriber_name.clone(),
                prefetch: 1,
            };
            let handle = Arc::new(ListenerHandle::new(
                address.clone(),
                subscription.destination(address),
                settings.concurrency.min,
            ));
            handle.set_state(ListenerState::Starting);

            for ordinal in 0..settings.concurrency.min {
                spawn_consumer(
                    broker.clone(),
                    subscription.clone(),
                    handle.clone(),
                    handler.clone(),
                    ack_mode,
                    shutdown_rx.clone(),
                    degraded_tx.clone(),
                    ordinal,
                );
            }
            spawn_scaler(
                broker.clone(),
                subscription.clone(),
                handle.clone(),
                handler.clone(),
                ack_mode,
                settings.concurrency,
                shutdown_rx.clone(),
                degraded_tx.clone(),
            );
            handles.push(handle);
        }
        *self.listeners.write().unwrap() = handles;
    }

    fn spawn_reconnect_supervisor(
        self: &Arc<Self>,
        mut degraded_rx: mpsc::Receiver<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    received = degraded_rx.recv() => {
                        let Some(address) = received else { return };
                        tracing::warn!(address = %address, "Broker connection lost, entering reconnect");
                        // Coalesce the burst of signals from sibling consumers.
                        while degraded_rx.try_recv().is_ok() {}
                        manager
                            .reconnect(&mut shutdown_rx, degraded_rx)
                            .await;
                        return;
                    }
                }
            }
        });
    }

    /// Rebuild the broker on the configured schedule and respawn every
    /// listener. Exhausting the schedule stops the component.
    async fn reconnect(
        self: &Arc<Self>,
        shutdown_rx: &mut watch::Receiver<bool>,
        degraded_rx: mpsc::Receiver<String>,
    ) {
        let settings = self.settings.read().await.clone();
        for handle in self.listeners.read().unwrap().iter() {
            handle.set_state(ListenerState::Degraded);
        }

        let mut attempt = 0u64;
        for delay in settings.reconnect.delays() {
            if *shutdown_rx.borrow() {
                return;
            }
            attempt += 1;
            tokio::time::sleep(delay).await;
            match (self.broker_factory)(&settings).await {
                Ok(broker) => {
                    tracing::info!(attempt = attempt, "Broker reconnected");
                    *self.broker.lock().unwrap() = Some(broker.clone());
                    let (degraded_tx, new_degraded_rx) = mpsc::channel::<String>(32);
                    drop(degraded_rx);
                    self.spawn_address_listeners(
                        broker,
                        &settings,
                        shutdown_rx.clone(),
                        degraded_tx,
                    )
                    .await;
                    self.spawn_reconnect_supervisor(new_degraded_rx, shutdown_rx.clone());
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Broker reconnect attempt failed"
                    );
                }
            }
        }

        tracing::error!(attempts = attempt, "Reconnect attempts exhausted, listeners stopped");
        for handle in self.listeners.read().unwrap().iter() {
            handle.set_state(ListenerState::Stopped);
        }
    }
}

fn spawn_consumer(
    broker: Arc<dyn SourceBroker>,
    subscription: Subscription,
    handle: Arc<ListenerHandle>,
    handler: Arc<dyn DeliveryHandler>,
    ack_mode: AckMode,
    mut shutdown_rx: watch::Receiver<bool>,
    degraded_tx: mpsc::Sender<String>,
    ordinal: usize,
) {
    tokio::spawn(async move {
        let mut stream = match broker.subscribe(&handle.address, &subscription).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    address = %handle.address,
                    error = %e,
                    "Failed to open broker consumer"
                );
                handle.set_state(ListenerState::Degraded);
                let _ = degraded_tx.send(handle.address.clone()).await;
                return;
            }
        };

        handle.active_consumers.fetch_add(1, Ordering::SeqCst);
        handle.set_state(ListenerState::Running);
        tracing::debug!(address = %handle.address, ordinal = ordinal, "Consumer started");

        let mut recheck = tokio::time::interval(Duration::from_millis(500));
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            // Scaled below this ordinal: retire between messages.
            if ordinal >= handle.desired_consumers.load(Ordering::SeqCst) {
                tracing::debug!(
                    address = %handle.address,
                    ordinal = ordinal,
                    "Consumer retired by scale-down"
                );
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = recheck.tick() => {}
                next = stream.next() => {
                    match next {
                        Some(delivery) => {
                            handle.busy_consumers.fetch_add(1, Ordering::SeqCst);
                            let outcome = handler
                                .handle(&handle.address, delivery.message_id.as_deref(), &delivery.body)
                                .await;
                            settle(delivery, outcome, ack_mode, &handle.address).await;
                            handle.busy_consumers.fetch_sub(1, Ordering::SeqCst);
                        }
                        None => {
                            if !*shutdown_rx.borrow() {
                                handle.set_state(ListenerState::Degraded);
                                let _ = degraded_tx.send(handle.address.clone()).await;
                            }
                            break;
                        }
                    }
                }
            }
        }

        handle.active_consumers.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(address = %handle.address, ordinal = ordinal, "Consumer exited");
    });
}

/// Watches one listener and adjusts its consumer count within the band:
/// scale up while every consumer is busy, scale back down when load drops.
fn spawn_scaler(
    broker: Arc<dyn SourceBroker>,
    subscription: Subscription,
    handle: Arc<ListenerHandle>,
    handler: Arc<dyn DeliveryHandler>,
    ack_mode: AckMode,
    band: ConcurrencyBand,
    mut shutdown_rx: watch::Receiver<bool>,
    degraded_tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(2));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if handle.state() != ListenerState::Running {
                        continue;
                    }
                    let busy = handle.busy_consumers.load(Ordering::SeqCst);
                    let desired = handle.desired_consumers.load(Ordering::SeqCst);
                    if busy >= desired && desired < band.max {
                        handle.desired_consumers.store(desired + 1, Ordering::SeqCst);
                        tracing::debug!(
                            address = %handle.address,
                            consumers = desired + 1,
                            "Scaling listener up"
                        );
                        spawn_consumer(
                            broker.clone(),
                            subscription.clone(),
                            handle.clone(),
                            handler.clone(),
                            ack_mode,
                            shutdown_rx.clone(),
                            degraded_tx.clone(),
                            desired,
                        );
                    } else if desired > band.min && busy + 1 < desired {
                        handle.desired_consumers.store(desired - 1, Ordering::SeqCst);
                        tracing::debug!(
                            address = %handle.address,
                            consumers = desired - 1,
                            "Scaling listener down"
                        );
                    }
                }
            }
        }
    });
}

async fn settle(delivery: BrokerDelivery, outcome: ProcessOutcome, ack_mode: AckMode, address: &str) {
    let result = match outcome {
        ProcessOutcome::Acked => match ack_mode {
            AckMode::Auto => delivery.ack().await,
            AckMode::SuppressAndRedeliver => {
                tracing::warn!(
                    address = %address,
                    "Acknowledgement suppressed (debug mode), returning message for redelivery"
                );
                delivery.reject(true).await
            }
        },
        ProcessOutcome::Rejected(reason) => {
            tracing::warn!(address = %address, reason = %reason, "Message rejected without redelivery");
            delivery.reject(false).await
        }
        ProcessOutcome::RollbackForRedelivery => delivery.reject(true).await,
    };
    if let Err(e) = result {
        tracing::warn!(address = %address, error = %e, "Failed to settle delivery");
    }
}
