//! Application entry-point. Wires catalog, hydration, subscriptions,
//! evaluation, and broadcast together, then waits for SIGINT/SIGTERM and
//! drains the pipeline in reverse dependency order.

use std::sync::Arc;

use ethers::providers::{Http, Provider};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use arbstream::broadcast::RateServer;
use arbstream::config::Config;
use arbstream::errors::EngineError;
use arbstream::evaluate::Evaluator;
use arbstream::hydrate::hydrate;
use arbstream::listen::SyncListener;
use arbstream::store::Store;
use arbstream::types::RateUpdate;

/// Sized for bursty blocks: a full batch of Syncs can land at once and
/// every one of them may touch dozens of cycles.
const RATE_CHANNEL_CAPACITY: usize = 32_768;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if let Err(e) = run().await {
        error!(target: "supervisor", error = %e, "Fatal error.");
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), EngineError> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    info!(
        target: "supervisor",
        db = %config.db_name,
        port = config.web_server_port,
        batch_size = config.batch_size,
        fee_bps = config.fee_bps,
        "Starting arbitrage engine."
    );

    // 1. Catalog. The sqlite handle is closed inside load().
    let store = Arc::new(Store::load(&config.db_name).await?);

    // 2 + 3. Evaluator and broadcaster share the rate channel.
    let (rate_tx, _) = broadcast::channel::<RateUpdate>(RATE_CHANNEL_CAPACITY);
    let evaluator = Arc::new(Evaluator::new(store.clone(), rate_tx.clone(), &config));
    let server = RateServer::bind(config.web_server_port, rate_tx).await?;

    // 4. Hydrate every pool once, then open the Sync subscriptions.
    let listener = SyncListener::new(store.clone(), evaluator.clone(), &config);
    let startup: Result<(), EngineError> = async {
        let provider = Provider::<Http>::try_from(config.https_url().as_str())
            .map_err(|e| EngineError::Provider(e.to_string()))?;
        hydrate(
            &store,
            Arc::new(provider),
            config.viewer_address,
            config.batch_size,
        )
        .await;
        listener.subscribe_all().await;
        Ok(())
    }
    .await;

    if startup.is_ok() {
        info!(target: "supervisor", "Engine running. Waiting for termination signal.");
        wait_for_shutdown().await;
    }

    // Drain in order regardless of how we got here: subscriber first so no
    // new evaluations start, then any in-flight critical section, then the
    // observer connections.
    listener.shutdown().await;
    evaluator.quiesce().await;
    server.shutdown().await;
    info!(target: "supervisor", "Shutdown complete.");
    startup
}

fn init_tracing(config: &Config) -> Result<(), EngineError> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_file_name)
        .map_err(|e| {
            EngineError::Config(format!(
                "cannot open log file {}: {e}",
                config.log_file_name
            ))
        })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("ethers_providers=warn".parse().expect("static directive"))
        .add_directive("sqlx=warn".parse().expect("static directive"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target: "supervisor", error = %e, "SIGTERM handler unavailable, falling back to Ctrl-C.");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!(target: "supervisor", "SIGINT received."),
        _ = terminate.recv() => info!(target: "supervisor", "SIGTERM received."),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
