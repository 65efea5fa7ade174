//! Notifier service entry point.
//!
//! Keeps one connection to the collection activity feed, restores the
//! subscriptions users asked for, and hands matching events to the delivery
//! side over NATS.

mod commands;
mod config;

use anyhow::{Context, Result};
use common::{ConnectionState, SupervisorConfig, WsConnector};
use config::{NotifierConfig, StoreConfig};
use feed::{FeedClient, FeedConfig, FileStore, LogSink, NatsSink, NotificationSink, PersistenceStore, RedisStore};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::NatsClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting notifier");

    let config = NotifierConfig::from_env()?;
    config.log();

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let connector = match &config.feed_token {
        Some(token) => WsConnector::with_token(&config.feed_url, token)?,
        None => WsConnector::new(&config.feed_url)?,
    };
    info!("Feed endpoint: {}", connector.display_url());

    let store: Arc<dyn PersistenceStore> = match &config.store {
        StoreConfig::Redis { url, key } => Arc::new(RedisStore::new(url, key.clone())?),
        StoreConfig::File(path) => Arc::new(FileStore::new(path.clone())),
    };

    let nats = match &config.nats_url {
        Some(url) => Some(NatsClient::connect(url).await?),
        None => None,
    };
    let sink: Arc<dyn NotificationSink> = match &nats {
        Some(client) => Arc::new(NatsSink::new(client.clone(), config.subject_prefix.clone())),
        None => Arc::new(LogSink),
    };

    let feed_config = FeedConfig {
        supervisor: SupervisorConfig {
            label: config.feed_name.clone(),
            ..Default::default()
        },
        ..Default::default()
    };
    let (client, mut feed_task) = feed::start(connector, store, sink, feed_config)
        .await
        .context("Failed to start feed client")?;

    if let Some(nats) = nats.clone() {
        let subject = config.command_subject.clone();
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = commands::serve(nats, subject, client).await {
                error!("Command bridge error: {:?}", e);
            }
        });
    }

    let mut state = client.watch_state();
    let mut report = tokio::time::interval(STATUS_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down feed client...");
                client.shutdown().await;
                break (&mut feed_task).await;
            }
            result = &mut feed_task => break result,
            changed = state.changed() => {
                if changed.is_err() {
                    break (&mut feed_task).await;
                }
                // Fail-stop: exit so the process supervisor restarts us.
                if *state.borrow_and_update() == ConnectionState::Exhausted {
                    client.shutdown().await;
                    break (&mut feed_task).await;
                }
            }
            _ = report.tick() => log_status(&client).await,
        }
    };

    if let Some(nats) = &nats {
        if let Err(e) = nats.flush().await {
            warn!("Failed to flush NATS: {}", e);
        }
    }

    match outcome {
        Ok(Ok(())) => {
            info!("Notifier stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("Feed client stopped"),
        Err(e) => Err(e).context("Feed task panicked"),
    }
}

async fn log_status(client: &FeedClient) {
    match client.status().await {
        Ok(status) => {
            let confirmed = status
                .topics
                .iter()
                .filter(|t| t.status == Some(common::AckStatus::Confirmed))
                .count();
            info!(
                "Feed {:?}: {} active collections, {} confirmed",
                status.connection,
                status.topics.len(),
                confirmed
            );
        }
        Err(e) => warn!("Status unavailable: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
