//! End-to-end gateway flow: broker delivery -> raw-event row -> stream
//! record -> operator resend.
//!
//! Requires a live Postgres with TEST_DATABASE_URL set; the broker and the
//! stream store run in-memory.

use broker::{InMemoryBroker, SourceBroker};
use chrono::Utc;
use gateway_rs::config::{ConcurrencyBand, ListenerSettings};
use gateway_rs::control::GatewayControl;
use gateway_rs::digest::checksum;
use gateway_rs::listener::{BrokerFactory, HandlerFactory, ListenerManager};
use gateway_rs::pipeline::{DeliveryHandler, EventPipeline};
use gateway_rs::publisher::StreamPublisher;
use gateway_rs::raw_events::{EventFilter, RawEventStore};
use serial_test::serial;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stream_bus::{parse_resend_flag, InMemoryStreamBus, StreamBus};

const ADDRESS: &str = "BERNARDINI_UNIT_EVENTS";
const STREAM: &str = "tfp-unit-events-stream";
const PAYLOAD: &str = r#"{"unitNumber":"TEST001","unitTypeCode":"CONTAINER","eventTime":"2026-02-04T10:00:00Z","type":"DAMAGE_REPORT","latitude":44.409,"longitude":8.947,"severity":"MEDIUM","reportNotes":"test"}"#;

async fn test_pool() -> PgPool {
    let url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/tfp_test".to_string());
    let pool = PgPool::connect(&url).await.expect("test database");
    sqlx::migrate!("./db/migrations").run(&pool).await.unwrap();
    sqlx::query("TRUNCATE TABLE evt_raw_events")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

fn settings() -> ListenerSettings {
    ListenerSettings {
        broker_url: "inmemory".to_string(),
        broker_user: String::new(),
        broker_password: String::new(),
        addresses: vec![ADDRESS.to_string()],
        subscriber_name: "tfp-gateway".to_string(),
        concurrency: ConcurrencyBand { min: 1, max: 2 },
        retry_attempts: 2,
        retry_delay: Duration::from_millis(50),
        reconnect: broker::ReconnectPolicy::default(),
        stream_mapping: HashMap::from([(ADDRESS.to_string(), STREAM.to_string())]),
        acknowledge_messages: true,
    }
}

struct Harness {
    broker: InMemoryBroker,
    bus: InMemoryStreamBus,
    manager: Arc<ListenerManager>,
    control: GatewayControl,
    store: RawEventStore,
}

async fn harness() -> Harness {
    let pool = test_pool().await;
    let broker = InMemoryBroker::new();
    let bus = InMemoryStreamBus::new();
    let store = RawEventStore::new(pool.clone());

    let broker_factory: BrokerFactory = {
        let broker = broker.clone();
        Arc::new(move |_settings| {
            let broker = broker.clone();
            Box::pin(async move {
                broker.reopen();
                Ok(Arc::new(broker) as Arc<dyn SourceBroker>)
            })
        })
    };
    let handler_factory: HandlerFactory = {
        let store = store.clone();
        let bus = bus.clone();
        Arc::new(move |settings| {
            let publisher =
                StreamPublisher::new(Arc::new(bus.clone()), settings.stream_mapping.clone());
            Arc::new(EventPipeline::new(
                store.clone(),
                publisher,
                settings.retry_attempts,
                settings.retry_delay,
            )) as Arc<dyn DeliveryHandler>
        })
    };

    let manager = ListenerManager::new(settings(), broker_factory, handler_factory);
    let control = GatewayControl::new(
        manager.clone(),
        store.clone(),
        Arc::new(bus.clone()) as Arc<dyn StreamBus>,
    );
    Harness {
        broker,
        bus,
        manager,
        control,
        store,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..150 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Postgres
async fn delivery_persists_raw_event_and_publishes_stream_record() {
    let h = harness().await;
    h.manager.start().await.unwrap();

    h.broker.publish(ADDRESS, Some("ID:abc-1"), PAYLOAD);
    wait_until("stream record published", || h.bus.stream_len(STREAM) == 1).await;

    let filter = EventFilter {
        message_id: Some("ID:abc-1".to_string()),
        ..EventFilter::default()
    };
    let rows = h.store.find_by_filter(&filter, 10, 0).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_type, ADDRESS);
    assert_eq!(rows[0].checksum, checksum(PAYLOAD));
    assert_eq!(
        rows[0].event_time.unwrap().to_rfc3339(),
        "2026-02-04T10:00:00+00:00"
    );

    h.manager.stop().await;
}

#[tokio::test]
#[serial]
#[ignore] // Requires Postgres
async fn redelivery_updates_single_row() {
    let h = harness().await;
    h.manager.start().await.unwrap();

    h.broker.publish(ADDRESS, Some("ID:abc-1"), PAYLOAD);
    wait_until("first publish", || h.bus.stream_len(STREAM) == 1).await;
    let before = Utc::now();
    h.broker.publish(ADDRESS, Some("ID:abc-1"), PAYLOAD);
    wait_until("second publish", || h.bus.stream_len(STREAM) == 2).await;

    let filter = EventFilter {
        message_id: Some("ID:abc-1".to_string()),
        ..EventFilter::default()
    };
    assert_eq!(h.store.count_by_filter(&filter).await.unwrap(), 1);
    let rows = h.store.find_by_filter(&filter, 10, 0).await.unwrap();
    assert!(rows[0].processed_at >= before);

    h.manager.stop().await;
}

#[tokio::test]
#[serial]
#[ignore] // Requires Postgres
async fn resend_republishes_with_resend_metadata() {
    let h = harness().await;
    h.manager.start().await.unwrap();

    h.broker.publish(ADDRESS, Some("ID:abc-1"), PAYLOAD);
    wait_until("initial record", || h.bus.stream_len(STREAM) == 1).await;

    let filter = EventFilter {
        message_id: Some("ID:abc-1".to_string()),
        ..EventFilter::default()
    };
    let rows = h.store.find_by_filter(&filter, 1, 0).await.unwrap();
    let outcome = h.control.resend_events(&[rows[0].id], true).await.unwrap();
    assert_eq!(outcome.published, 1);

    wait_until("resent record", || h.bus.stream_len(STREAM) == 2).await;
    let entries = h
        .bus
        .read_group(STREAM, "inspection", "test", 10, Duration::from_millis(100))
        .await
        .unwrap();
    let resent = entries
        .iter()
        .find(|e| e.fields.get("metadata").is_some())
        .expect("a record with metadata");
    assert!(parse_resend_flag(resent.fields.get("metadata").map(String::as_str)));

    h.manager.stop().await;
}
