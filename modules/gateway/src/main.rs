use broker::{AmqpBroker, SourceBroker};
use gateway_rs::config::GatewayConfig;
use gateway_rs::control::GatewayControl;
use gateway_rs::listener::{BrokerFactory, HandlerFactory, ListenerManager};
use gateway_rs::pipeline::{DeliveryHandler, EventPipeline};
use gateway_rs::publisher::StreamPublisher;
use gateway_rs::raw_events::RawEventStore;
use gateway_rs::routes;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stream_bus::{RedisStreamBus, StreamBus};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = GatewayConfig::from_env().expect("Invalid gateway configuration");

    // Listener consumers fail fast on pool exhaustion so deliveries requeue
    // instead of piling up behind a saturated database.
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied successfully");

    let stream_bus: Arc<dyn StreamBus> = Arc::new(
        RedisStreamBus::connect(&config.redis_url)
            .await
            .expect("Failed to connect to stream store"),
    );

    let raw_events = RawEventStore::new(pool.clone());

    let broker_factory: BrokerFactory = Arc::new(|settings| {
        let url = settings.broker_url.clone();
        let user = settings.broker_user.clone();
        let password = settings.broker_password.clone();
        Box::pin(async move {
            let broker = AmqpBroker::connect(&url, &user, &password).await?;
            Ok(Arc::new(broker) as Arc<dyn SourceBroker>)
        })
    });

    let handler_factory: HandlerFactory = {
        let raw_events = raw_events.clone();
        let stream_bus = stream_bus.clone();
        Arc::new(move |settings| {
            let publisher = StreamPublisher::new(stream_bus.clone(), settings.stream_mapping.clone());
            Arc::new(EventPipeline::new(
                raw_events.clone(),
                publisher,
                settings.retry_attempts,
                settings.retry_delay,
            )) as Arc<dyn DeliveryHandler>
        })
    };

    let manager = ListenerManager::new(config.listener.clone(), broker_factory, handler_factory);
    manager
        .start()
        .await
        .expect("Failed to start gateway listeners");

    let control = Arc::new(GatewayControl::new(
        manager.clone(),
        raw_events,
        stream_bus,
    ));

    let app = routes::router(control).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST/PORT");
    tracing::info!("Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .expect("Server failed to start");
}

async fn shutdown_signal(manager: Arc<ListenerManager>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received, stopping listeners");
    manager.stop().await;
}
