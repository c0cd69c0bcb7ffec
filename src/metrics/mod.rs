//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and scan progress
//! - Transaction submission and confirmation
//! - Transfer throughput and finalization failures

use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainSide;

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::U256;
use ethers::utils::format_units;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "bridge_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref SCANNED_BLOCK: GaugeVec = register_gauge_vec!(
        "bridge_relayer_scanned_block",
        "Highest block scanned for transfer events",
        &["chain"]
    ).unwrap();

    pub static ref LISTENER_RESCANS: CounterVec = register_counter_vec!(
        "bridge_relayer_listener_rescans_total",
        "Times a listener gave up on a range and restarted from genesis",
        &["chain"]
    ).unwrap();

    // Transaction metrics
    pub static ref CONFIRMED_NONCE: GaugeVec = register_gauge_vec!(
        "bridge_relayer_confirmed_nonce",
        "Last confirmed nonce of the relay account",
        &["chain"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_submitted_total",
        "Total transactions broadcast",
        &["chain"]
    ).unwrap();

    pub static ref TX_OUTCOMES: CounterVec = register_counter_vec!(
        "bridge_relayer_transaction_outcomes_total",
        "Resolved transactions by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref FEE_BUMPS: CounterVec = register_counter_vec!(
        "bridge_relayer_fee_bumps_total",
        "Replacement attempts with bumped fees",
        &["chain"]
    ).unwrap();

    // Transfer metrics
    pub static ref TRANSFERS_INITIATED: CounterVec = register_counter_vec!(
        "bridge_relayer_transfers_initiated_total",
        "Transfers observed on the source chain",
        &["chain"]
    ).unwrap();

    pub static ref TRANSFERS_FINALIZED: CounterVec = register_counter_vec!(
        "bridge_relayer_transfers_finalized_total",
        "Transfers finalized on the destination chain",
        &["chain"]
    ).unwrap();

    pub static ref FINALIZATION_FAILURES: CounterVec = register_counter_vec!(
        "bridge_relayer_finalization_failures_total",
        "Transfers whose finalization gave up",
        &["chain", "alert"]
    ).unwrap();

    pub static ref VOLUME_INITIATED: CounterVec = register_counter_vec!(
        "bridge_relayer_volume_initiated",
        "Transferred amount observed on the source chain, in whole tokens",
        &["chain"]
    ).unwrap();

    pub static ref VOLUME_FINALIZED: CounterVec = register_counter_vec!(
        "bridge_relayer_volume_finalized",
        "Amount finalized on the destination chain, in whole tokens",
        &["chain"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self, cancel: CancellationToken) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("Cannot bind metrics on {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    encode_metrics().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Render the default registry in the text exposition format
pub fn encode_metrics() -> RelayerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| RelayerError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| RelayerError::Internal(e.to_string()))
}

fn token_amount(amount: U256) -> f64 {
    format_units(amount, "ether")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

// Helper functions to record metrics

pub fn record_chain_health(chain: ChainSide, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_scanned(chain: ChainSide, through_block: u64) {
    SCANNED_BLOCK
        .with_label_values(&[chain.as_str()])
        .set(through_block as f64);
}

pub fn record_listener_rescan(chain: ChainSide) {
    LISTENER_RESCANS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_confirmed_nonce(chain: ChainSide, nonce: u64) {
    CONFIRMED_NONCE
        .with_label_values(&[chain.as_str()])
        .set(nonce as f64);
}

pub fn record_tx_submitted(chain: ChainSide) {
    TX_SUBMITTED.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_tx_outcome(chain: ChainSide, outcome: &str) {
    TX_OUTCOMES
        .with_label_values(&[chain.as_str(), outcome])
        .inc();
}

pub fn record_fee_bump(chain: ChainSide) {
    FEE_BUMPS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_transfer_initiated(chain: ChainSide, amount: U256) {
    TRANSFERS_INITIATED.with_label_values(&[chain.as_str()]).inc();
    VOLUME_INITIATED
        .with_label_values(&[chain.as_str()])
        .inc_by(token_amount(amount));
}

pub fn record_transfer_finalized(chain: ChainSide, amount: U256) {
    TRANSFERS_FINALIZED.with_label_values(&[chain.as_str()]).inc();
    VOLUME_FINALIZED
        .with_label_values(&[chain.as_str()])
        .inc_by(token_amount(amount));
}

pub fn record_finalization_failed(chain: ChainSide, amount: U256, alert: bool) {
    FINALIZATION_FAILURES
        .with_label_values(&[chain.as_str(), if alert { "true" } else { "false" }])
        .inc();
    if alert {
        error!(
            chain = chain.as_str(),
            amount = %amount,
            "Finalization failure requires operator attention"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_amount() {
        let one = U256::exp10(18);
        assert_eq!(token_amount(one), 1.0);
        assert_eq!(token_amount(U256::zero()), 0.0);
    }

    #[test]
    fn test_encode_contains_recorded_series() {
        record_fee_bump(ChainSide::Settlement);
        record_tx_outcome(ChainSide::L1, "confirmed");

        let text = encode_metrics().unwrap();
        assert!(text.contains("bridge_relayer_fee_bumps_total"));
        assert!(text.contains("outcome=\"confirmed\""));
    }
}
