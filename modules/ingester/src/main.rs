use axum::routing::get;
use axum::{Json, Router};
use ingester_rs::config::IngesterConfig;
use ingester_rs::enrichment::{EnrichmentClient, EnrichmentLookup, NoEnrichment};
use ingester_rs::error_ingestion::{ErrorIngestion, ErrorIngestionStore};
use ingester_rs::orchestrator::StreamOrchestrator;
use ingester_rs::processors::{
    AssetDamageProcessor, ConvoyCompositionProcessor, UnitEventProcessor,
};
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

    let config = IngesterConfig::from_env().expect("Invalid ingester configuration");

    // Consumers pull serially per processor; one warm connection per pool
    // avoids a reconnect stall on the first message after idle periods.
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied successfully");

    let bus: Arc<dyn StreamBus> = Arc::new(
        RedisStreamBus::connect(&config.redis_url)
            .await
            .expect("Failed to connect to stream store"),
    );

    let enrichment: Arc<dyn EnrichmentLookup> = if config.enrichment.base_url.is_empty() {
        tracing::warn!("ENRICHMENT_BASE_URL not set, catalogue lookups disabled");
        Arc::new(NoEnrichment)
    } else {
        Arc::new(
            EnrichmentClient::new(
                config.enrichment.base_url.clone(),
                config.enrichment.api_key.clone(),
                config.enrichment.connect_timeout,
                config.enrichment.read_timeout,
            )
            .expect("Failed to build enrichment client"),
        )
    };

    let errors: Arc<dyn ErrorIngestion> = Arc::new(ErrorIngestionStore::new(pool.clone()));

    let mut orchestrator = StreamOrchestrator::new(bus, errors.clone(), config.poll_timeout);
    orchestrator.register(Arc::new(UnitEventProcessor::new(
        pool.clone(),
        enrichment.clone(),
        errors.clone(),
    )));
    orchestrator.register(Arc::new(ConvoyCompositionProcessor::new(
        pool.clone(),
        enrichment.clone(),
        errors.clone(),
    )));
    orchestrator.register(Arc::new(AssetDamageProcessor::new(
        pool.clone(),
        enrichment.clone(),
        errors.clone(),
    )));

    let consumer_handles = orchestrator
        .start()
        .await
        .expect("Failed to start stream consumers");
    let orchestrator = Arc::new(orchestrator);

    let app = Router::new().route("/api/health", get(health)).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST/PORT");
    tracing::info!("Ingester listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let orchestrator = orchestrator.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received, stopping consumers");
                orchestrator.shutdown();
            }
        })
        .await
        .expect("Server failed to start");

    for handle in consumer_handles {
        let _ = handle.await;
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "module": "ingester",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
