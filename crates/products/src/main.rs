// Products service entry point
// Decision: relay runs in-process next to the HTTP write API, one dispatcher per instance
// Decision: shutdown order is HTTP -> scheduler -> producer -> database pool

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_outbox::{
    BrokerProducer, Dispatcher, InMemoryBroker, OutboxStore, PostgresOutboxStore, Publisher,
    RestProducer, Scheduler, Snowflake, SystemClock,
};
use relay_products::api::{self, AppState};
use relay_products::{event_registry, AppConfig, BrokerKind, ProductService};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("relay_products=debug,relay_outbox=debug,tower_http=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("relay-products starting...");

    let config = AppConfig::load().context("Failed to load configuration")?;

    // Initialize database
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.connect_timeout)
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    let store: Arc<dyn OutboxStore> = Arc::new(PostgresOutboxStore::new(pool.clone()));

    let producer: Arc<dyn BrokerProducer> = match config.broker.kind {
        BrokerKind::Memory => Arc::new(InMemoryBroker::logging(config.broker.topic.clone())),
        BrokerKind::Rest => {
            let endpoint = config
                .broker
                .endpoint
                .as_deref()
                .context("broker.endpoint is required for the rest broker")?;
            Arc::new(
                RestProducer::new(endpoint, config.broker.topic.clone(), config.broker.token.clone())
                    .context("Failed to create broker producer")?
                    .with_request_timeout(config.dispatcher.publish_timeout)
                    .with_close_timeout(config.dispatcher.shutdown_timeout),
            )
        }
    };
    tracing::info!(
        kind = ?config.broker.kind,
        topic = %producer.topic(),
        "Broker producer ready"
    );

    // Relay
    let dispatcher = Dispatcher::new(
        store.clone(),
        Publisher::new(producer.clone()),
        event_registry(),
        config.dispatcher_config(),
    )
    .context("Failed to create dispatcher")?;
    dispatcher
        .preflight()
        .await
        .context("Outbox preflight failed")?;

    let scheduler = Scheduler::new(Arc::new(dispatcher), config.scheduler_config());
    scheduler.start().context("Failed to start scheduler")?;

    // Write API
    let service = ProductService::new(
        store,
        Arc::new(Snowflake::new(SystemClock, config.node.machine_id)),
        Arc::new(SystemClock),
        config.partitioner(),
    );
    let app = api::routes(AppState::new(Arc::new(service))).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    scheduler.stop().await;
    if let Err(e) = producer.close().await {
        tracing::warn!("Failed to close broker producer: {}", e);
    }
    pool.close().await;

    tracing::info!("Shutdown complete");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Received shutdown signal");
}
