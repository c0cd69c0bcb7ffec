//! HTTP API for health checks and pending transfer inspection

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainSide;
use crate::state::{SettlementRecord, StateManager, TransferStore};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub state_manager: Arc<StateManager>,
    pub chain_manager: Arc<ChainManager>,
    /// Transfer stores keyed by the side they finalize on
    pub transfers: HashMap<ChainSide, Arc<dyn TransferStore>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/pending/:chain", get(get_pending))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server until `cancel` fires
pub async fn run_server(
    config: ApiConfig,
    state: AppState,
    cancel: CancellationToken,
) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("Cannot bind API on {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| RelayerError::Internal(format!("API server error: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - database and both chains reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.state_manager.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            chains: chains_ok,
            details: chain_health
                .into_iter()
                .map(|(chain, healthy)| ChainHealth { chain, healthy })
                .collect(),
        }),
    )
}

/// Transfers with a broadcast finalize that has not settled yet
async fn get_pending(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> Result<Json<PendingResponse>, (StatusCode, String)> {
    let side: ChainSide = chain
        .parse()
        .map_err(|e: RelayerError| (StatusCode::NOT_FOUND, e.to_string()))?;

    let store = state
        .transfers
        .get(&side)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("No store for {}", side)))?;

    let records = store.unsettled_transfers().await.map_err(|e| {
        warn!("Failed to list pending transfers on {}: {}", side, e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(Json(PendingResponse::new(side, records)))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: ChainSide,
    healthy: bool,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub chain: ChainSide,
    pub count: usize,
    pub transfers: Vec<PendingTransfer>,
}

#[derive(Debug, Serialize)]
pub struct PendingTransfer {
    pub counterparty_index: U256,
    pub recipient: Address,
    pub amount: U256,
    pub nonce: u64,
    pub tx_hash: H256,
}

impl PendingResponse {
    fn new(chain: ChainSide, records: Vec<SettlementRecord>) -> Self {
        let mut transfers: Vec<PendingTransfer> = records
            .into_iter()
            .filter(|r| !r.settled)
            .map(|r| PendingTransfer {
                counterparty_index: r.counterparty_index,
                recipient: r.recipient,
                amount: r.amount,
                nonce: r.nonce,
                tx_hash: r.tx_hash,
            })
            .collect();
        transfers.sort_by_key(|t| t.nonce);

        Self {
            chain,
            count: transfers.len(),
            transfers,
        }
    }
}
