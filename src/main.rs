//! Bridge Relayer - two-way token transfer relay
//!
//! Watches the bridge contract on the L1 and on the settlement chain and
//! finalizes every initiated transfer on the counterparty chain.

use anyhow::{Context, Result};
use ethers::signers::Signer;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bridge_relayer::api::{self, AppState};
use bridge_relayer::chain::{ChainManager, EventListener};
use bridge_relayer::config::Settings;
use bridge_relayer::coordination::{Gateway, RelayEngine, RelayLeg};
use bridge_relayer::events::{ChainSide, EventParser};
use bridge_relayer::metrics::MetricsServer;
use bridge_relayer::state::{CursorStore, Saver, StateManager, TransferStore};
use bridge_relayer::tx::{load_wallet, Canceller, Monitor, TransactionSender, Transactor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Bridge Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let relayer = settings.relayer.clone();

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;
    info!("Database migrations complete");

    // Initialize chain manager (handles both chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings).await?);
    info!(
        "Chain connections initialized: {:?}",
        chain_manager.connected_chains()
    );

    let wallet = load_wallet(&settings.wallet)?;
    let cancel = CancellationToken::new();

    let mut monitor_handles = Vec::new();
    let mut transfers: HashMap<ChainSide, Arc<dyn TransferStore>> = HashMap::new();
    let mut legs = Vec::new();

    // One leg per destination; each reads events from the counterparty chain
    for dest in [ChainSide::L1, ChainSide::Settlement] {
        let source = dest.counterparty();
        let dest_config = settings.chain(dest)?;
        let source_config = settings.chain(source)?;
        let dest_endpoint = chain_manager.get(dest)?;
        let source_endpoint = chain_manager.get(source)?;

        let store = Arc::new(state_manager.store(dest));
        let saver: Arc<dyn Saver> = store.clone();
        let transfer_store: Arc<dyn TransferStore> = store.clone();
        let cursor: Arc<dyn CursorStore> = store;

        let monitor = Monitor::new(
            dest,
            dest_endpoint.clone(),
            wallet.address(),
            saver,
            &relayer,
        )
        .await?;
        monitor_handles.push(monitor.start(cancel.child_token()));

        let transactor = Arc::new(Transactor::new(
            dest,
            dest_endpoint.clone(),
            wallet.clone(),
            monitor.clone(),
            relayer.send_retries,
        ));
        let sender = TransactionSender::new(dest, dest_endpoint.clone(), monitor, &relayer);

        if relayer.cancel_pending_on_start {
            let canceller = Canceller::new(
                dest,
                dest_endpoint.clone(),
                transactor.clone(),
                sender.gas_estimator().clone(),
            );
            let replaced = canceller
                .cancel_pending(&cancel)
                .await
                .with_context(|| format!("Failed to cancel pending transactions on {}", dest))?;
            info!("Replaced {} pending transactions on {}", replaced.len(), dest);
        }

        let gateway = Arc::new(Gateway::new(
            dest,
            EventParser::new(dest, &dest_config.contract_address)?,
            transactor,
            sender,
            transfer_store.clone(),
            relayer.settled_cache_size,
            dest_config.gas_limit,
            relayer.resubmit_failed,
        ));

        let listener = EventListener::new(
            source_endpoint,
            EventParser::new(source, &source_config.contract_address)?,
            source_config.finality_depth(),
            &relayer,
        );

        transfers.insert(dest, transfer_store);
        legs.push(RelayLeg::new(listener, gateway, cursor));
    }

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            state_manager: state_manager.clone(),
            chain_manager: chain_manager.clone(),
            transfers,
        };
        let config = settings.api.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = api::run_server(config, state, cancel).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(cancel).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let state_manager = state_manager.clone();
        let interval = relayer.health_check_interval_secs;
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(tokio::time::Duration::from_secs(interval)) => {}
                }

                // Check chain connections
                for (side, healthy) in chain_manager.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", side);
                    }
                }

                // Check database connection
                if let Err(e) = state_manager.health_check().await {
                    warn!("Database health check failed: {}", e);
                }
            }
        }
    });

    // Start relay engine
    let engine_handle = tokio::spawn({
        let engine = RelayEngine::new(legs);
        let cancel = cancel.clone();
        async move {
            if let Err(e) = engine.run(cancel).await {
                error!("Relay engine error: {}", e);
            }
        }
    });

    info!("Bridge Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal or an engine failure
    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received, stopping..."),
        _ = cancel.cancelled() => warn!("Relay engine stopped, shutting down"),
    }
    cancel.cancel();

    // Graceful shutdown: legs first, then monitors release their watchers
    if let Err(e) = engine_handle.await {
        error!("Relay engine task panicked: {}", e);
    }
    for handle in monitor_handles {
        if let Err(e) = handle.await {
            error!("Monitor task panicked: {}", e);
        }
    }
    let _ = api_handle.await;
    let _ = health_handle.await;
    if let Some(h) = metrics_handle {
        let _ = h.await;
    }

    info!("Bridge Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,bridge_relayer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
