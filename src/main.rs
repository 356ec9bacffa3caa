//! Courier payment-event webhook dispatch service.
//!
//! Main entry point. Wires the ledger, broker, dispatch consumer and retry
//! sweeper together and coordinates graceful shutdown. Events reach the
//! dispatch topic from upstream services through their own
//! `GroupedProducer`; this process only consumes and delivers.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::Storage, CallbackLogRepository, Clock, InMemoryRepository, RealClock};
use courier_dispatch::{
    Broker, DeliveryClient, DispatchConsumer, InMemoryBroker, RetrySweeper, WebhookService,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

/// Upper bound on waiting for in-flight deliveries during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    info!("Starting Courier webhook dispatch service");
    info!(
        database_url = config.database_url_masked().as_deref().unwrap_or("in-memory"),
        broker = config.broker_addresses.as_deref().unwrap_or("in-process"),
        dispatch_topic = %config.dispatch_topic,
        consumer_group_id = %config.consumer_group_id,
        max_retries = config.max_retries,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let (repository, db_pool) = create_repository(&config).await?;
    let broker = create_broker(&config)?;

    let client = DeliveryClient::new(config.to_client_config())
        .context("Failed to build delivery client")?;
    let service =
        WebhookService::with_client(repository, client, config.to_retry_policy(), clock.clone());

    let token = CancellationToken::new();

    let consumer = DispatchConsumer::new(
        broker,
        service.clone(),
        clock.clone(),
        config.dispatch_topic.clone(),
        config.consumer_group_id.clone(),
        token.child_token(),
    );
    let consumer_handle = tokio::spawn(async move { consumer.run().await });

    let sweeper =
        RetrySweeper::new(service.clone(), clock, config.sweep_interval(), token.child_token());
    let sweeper_handle = tokio::spawn(async move { sweeper.run().await });

    info!("Courier is ready to dispatch webhooks");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    token.cancel();

    match tokio::time::timeout(SHUTDOWN_GRACE, consumer_handle).await {
        Ok(Ok(Ok(stats))) => info!(
            handled = stats.handled,
            rejected = stats.rejected,
            failed = stats.failed,
            "Dispatch consumer stopped"
        ),
        Ok(Ok(Err(e))) => error!(error = %e, "Dispatch consumer failed"),
        Ok(Err(e)) => error!(error = %e, "Dispatch consumer task panicked"),
        Err(_) => warn!("Dispatch consumer did not stop within grace period"),
    }

    if let Err(e) = sweeper_handle.await {
        error!(error = %e, "Retry sweeper task panicked");
    }

    service.shutdown(SHUTDOWN_GRACE).await;

    if let Some(pool) = db_pool {
        pool.close().await;
        info!("Database connections closed");
    }

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(&config.rust_log)
        .unwrap_or_else(|_| EnvFilter::new("info,courier=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Picks the PostgreSQL ledger when a database URL is configured, otherwise
/// an in-memory one.
async fn create_repository(
    config: &Config,
) -> Result<(Arc<dyn CallbackLogRepository>, Option<sqlx::PgPool>)> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set, callback ledger is in-memory and lost on restart");
        let repository: Arc<dyn CallbackLogRepository> = Arc::new(InMemoryRepository::new());
        return Ok((repository, None));
    };

    let pool = create_database_pool(database_url, config.database_max_connections).await?;
    info!("Database connection pool established");

    let storage = Storage::new(pool.clone());
    storage.ensure_schema().await.context("Failed to bootstrap callback ledger schema")?;
    storage.health_check().await.context("Failed to verify database connection")?;
    info!("Callback ledger schema ready");

    let repository: Arc<dyn CallbackLogRepository> = storage.callback_logs;
    Ok((repository, Some(pool)))
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(database_url: &str, max_connections: u32) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

#[cfg(feature = "kafka")]
fn create_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    use courier_dispatch::broker::kafka::{KafkaBroker, KafkaConfig};

    let Some(addresses) = config.broker_addresses.clone() else {
        warn!("BROKER_ADDRESSES not set, using in-process broker");
        return Ok(Arc::new(InMemoryBroker::new()));
    };

    let broker = KafkaBroker::new(KafkaConfig {
        bootstrap_servers: addresses,
        delivery_timeout: Duration::from_secs(config.request_timeout_seconds),
    })
    .context("Failed to connect to Kafka")?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "kafka"))]
fn create_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    if config.broker_addresses.is_some() {
        anyhow::bail!("BROKER_ADDRESSES is set but courier was built without the `kafka` feature");
    }
    warn!("Using in-process broker; events do not leave this process");
    Ok(Arc::new(InMemoryBroker::new()))
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
