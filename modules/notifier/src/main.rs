use axum::routing::get;
use axum::{Json, Router};
use notifier_rs::attachments::{AttachmentStore, HttpAttachmentStore};
use notifier_rs::config::NotifierConfig;
use notifier_rs::consumer::NotificationConsumer;
use notifier_rs::dispatcher::NotificationDispatcher;
use notifier_rs::email::{EmailSender, Mailer, SmtpMailer, SmtpSettings};
use notifier_rs::renderer::TemplateRenderer;
use notifier_rs::send_log::{PgSendLog, SendLog};
use notifier_rs::templates::{PgTemplateRepository, TemplateRepository};
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

    let config = NotifierConfig::from_env().expect("Invalid notifier configuration");
    if config.mappings.is_empty() {
        tracing::warn!("NOTIFIER_MAPPINGS is empty, no events will be consumed");
    }

    // The send log sees bursts around dispatch and the retry sweep; recycle
    // idle connections between them.
    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .idle_timeout(Some(Duration::from_secs(300)))
        .max_lifetime(Some(Duration::from_secs(1800)))
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

    let mailer: Arc<dyn Mailer> = Arc::new(
        SmtpMailer::new(&SmtpSettings {
            host: config.smtp.host.clone(),
            port: config.smtp.port,
            username: config.smtp.username.clone(),
            password: config.smtp.password.clone(),
            starttls: config.smtp.starttls,
        })
        .expect("Failed to build SMTP transport"),
    );
    let attachments: Arc<dyn AttachmentStore> = Arc::new(
        HttpAttachmentStore::new(
            config.backend.base_url.clone(),
            config.backend.download_path.clone(),
            config.backend.api_key.clone(),
            config.backend.timeout,
        )
        .expect("Failed to build attachment client"),
    );
    let templates: Arc<dyn TemplateRepository> = Arc::new(PgTemplateRepository::new(pool.clone()));
    let send_log: Arc<dyn SendLog> = Arc::new(PgSendLog::new(pool.clone()));

    let sender = Arc::new(EmailSender::new(
        mailer,
        attachments,
        Arc::new(TemplateRenderer::new()),
        templates.clone(),
        send_log,
        config.smtp.footer_html.clone(),
        config.smtp.footer_plain.clone(),
        config.smtp.from_address.clone(),
        config.smtp.from_name.clone(),
    ));

    let dispatcher = Arc::new(NotificationDispatcher::new(
        config.mappings.clone(),
        templates,
        sender.clone(),
    ));

    let consumer = Arc::new(NotificationConsumer::new(
        bus,
        dispatcher,
        config.poll_timeout,
    ));
    let consumer_handles = consumer
        .start()
        .await
        .expect("Failed to start notification consumers");

    // Periodic sweep over RETRY-status send logs.
    {
        let sender = sender.clone();
        let max_attempts = config.retry_max_attempts;
        let interval = config.retry_sweep_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                match sender.retry_failed_emails(max_attempts).await {
                    Ok(summary) if summary.scanned > 0 => {
                        tracing::info!(
                            scanned = summary.scanned,
                            sent = summary.sent,
                            still_failing = summary.still_failing,
                            "Email retry sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Email retry sweep failed"),
                }
            }
        });
    }

    let app = Router::new().route("/api/health", get(health)).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST/PORT");
    tracing::info!("Notifier listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let consumer = consumer.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received, stopping consumers");
                consumer.shutdown();
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
        "module": "notifier",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
