//! Zero Keeper - lends against bitcoin deposits before they are attested
//!
//! The keeper listens for signed liquidity requests, executes borrows once the
//! deposits confirm, and defaults loans whose borrowers never repay.

use anyhow::{Context, Result};
use chrono::Utc;
use ethers::signers::LocalWallet;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use zero_confirmation::api::{self, AppState};
use zero_confirmation::config::Settings;
use zero_confirmation::keeper::KeeperEngine;
use zero_confirmation::metrics::{self, MetricsServer};
use zero_confirmation::pubsub::{LocalChannel, PubSub, RelayChannel};
use zero_confirmation::state::{MemoryParcelStore, ParcelStore, PgParcelStore};
use zero_confirmation::Zero;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Zero Keeper v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let wallet = load_wallet(&settings)?;
    if wallet.is_none() {
        warn!("No keeper wallet configured - the node's own accounts will sign");
    }

    // Initialize parcel store
    let store: Arc<dyn ParcelStore> = match &settings.database {
        Some(database) => {
            let pg = PgParcelStore::new(database).await?;
            info!("Database connection established");
            pg.run_migrations().await?;
            Arc::new(pg)
        }
        None => Arc::new(MemoryParcelStore::new()),
    };

    // Initialize backends and client context
    let channel: Arc<dyn PubSub> = match &settings.network.relay_url {
        Some(url) => {
            info!("Relaying liquidity requests to {}", url);
            Arc::new(RelayChannel::new(url)?)
        }
        None => Arc::new(LocalChannel::new()),
    };
    let mut zero = Zero::from_settings(&settings, wallet, channel)?;
    if settings.network.borrow_proxy_code_hash.is_none() {
        zero.load_borrow_proxy_creation_code()
            .await
            .context("Failed to load borrow proxy creation code")?;
    }
    let zero = Arc::new(zero);
    info!(
        "Backends initialized: {}",
        zero.driver().backend_names().join(", ")
    );

    // Initialize keeper
    let keeper = Arc::new(KeeperEngine::new(
        zero.clone(),
        store.clone(),
        settings.keeper.clone(),
    )?);
    info!("Keeper engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            zero: zero.clone(),
            store: store.clone(),
            keeper: keeper.clone(),
            instance_id: settings.keeper.instance_id.clone(),
            started_at: Utc::now(),
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start keeper
    let keeper_handle = tokio::spawn({
        let keeper = keeper.clone();
        async move {
            if let Err(e) = keeper.run().await {
                error!("Keeper error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let zero = zero.clone();
        let store = store.clone();
        let interval = settings.keeper.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;

                // Check settlement chain
                match zero.settlement().latest_block().await {
                    Ok(block) => metrics::record_block_height(block),
                    Err(e) => {
                        warn!("Settlement chain health check failed: {}", e);
                        healthy = false;
                    }
                }

                // Check parcel store
                if let Err(e) = store.health_check().await {
                    warn!("Parcel store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Zero Keeper is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    keeper.stop();
    zero.shutdown();
    if let Err(e) = keeper_handle.await {
        warn!("Keeper task ended abnormally: {}", e);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Zero Keeper stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,zero_confirmation=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Keeper wallet from the environment variable named in `wallet.private_key_env`
fn load_wallet(settings: &Settings) -> Result<Option<LocalWallet>> {
    let Some(var) = settings.wallet.private_key_env.as_deref() else {
        return Ok(None);
    };
    let key = std::env::var(var).with_context(|| format!("Wallet key variable {} is not set", var))?;
    let wallet = key
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .with_context(|| format!("Invalid private key in {}", var))?;
    Ok(Some(wallet))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
