//! Chain module - query/submit surface over each bridged chain
//!
//! This module provides:
//! - The `ChainEndpoint` trait every RPC client implements
//! - Multi-RPC provider management with automatic failover
//! - Finality-aware, range-batched event scanning

pub mod finality;
pub mod listener;
pub mod provider;
#[cfg(test)]
pub(crate) mod testing;

pub use listener::{EventListener, ListenerUpdate};
pub use provider::ChainProvider;

use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainSide;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256};
use std::sync::Arc;
use tracing::info;

/// A contract log reduced to what the relayer consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: H256,
}

impl From<Log> for RawEvent {
    fn from(log: Log) -> Self {
        Self {
            topics: log.topics,
            data: log.data,
            block_number: log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
            log_index: log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
            tx_hash: log.transaction_hash.unwrap_or_default(),
        }
    }
}

/// EIP-1559 fee pair, in wei
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeParams {
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
}

/// Query/submit surface over a single chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainEndpoint: Send + Sync {
    /// EIP-155 chain id used when signing
    fn chain_id(&self) -> u64;

    async fn current_height(&self) -> RelayerResult<u64>;

    /// Confirmed transaction count of `account` as of `at_height`
    async fn account_nonce(&self, account: Address, at_height: u64) -> RelayerResult<u64>;

    /// Transaction count including the mempool
    async fn pending_nonce(&self, account: Address) -> RelayerResult<u64>;

    /// Logs of `contract` with first topic `topic` in `[from_block, to_block]`
    async fn filter_events(
        &self,
        contract: Address,
        topic: H256,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<RawEvent>>;

    async fn suggest_fee_tip_and_cap(&self) -> RelayerResult<FeeParams>;

    /// Broadcast a signed, RLP-encoded transaction
    async fn submit(&self, signed_tx: Bytes) -> RelayerResult<H256>;

    /// `None` when the node does not know the transaction
    async fn receipt(&self, tx_hash: H256) -> RelayerResult<Option<TransactionReceipt>>;

    /// One entry per hash, in order. The outer error means the whole batch
    /// failed; inner errors are per element.
    async fn batch_receipts(
        &self,
        hashes: &[H256],
    ) -> RelayerResult<Vec<RelayerResult<Option<TransactionReceipt>>>>;

    async fn health_check(&self) -> bool {
        self.current_height().await.is_ok()
    }
}

/// Endpoints for both sides of the bridge
pub struct ChainManager {
    endpoints: DashMap<ChainSide, Arc<dyn ChainEndpoint>>,
}

impl ChainManager {
    /// Connect a `ChainProvider` for each configured side
    pub async fn new(settings: &Settings) -> RelayerResult<Self> {
        let manager = Self::empty();

        for side in [ChainSide::L1, ChainSide::Settlement] {
            let chain_config = settings
                .chain(side)
                .map_err(|e| RelayerError::Config(e.to_string()))?;

            info!(
                "Initializing chain {} ({}, ID: {})",
                side, chain_config.name, chain_config.chain_id
            );

            let provider = ChainProvider::new(chain_config.clone()).await?;
            manager.insert(side, Arc::new(provider));

            info!("Chain {} initialized successfully", chain_config.name);
        }

        Ok(manager)
    }

    pub fn empty() -> Self {
        Self {
            endpoints: DashMap::new(),
        }
    }

    pub fn insert(&self, side: ChainSide, endpoint: Arc<dyn ChainEndpoint>) {
        self.endpoints.insert(side, endpoint);
    }

    /// Get endpoint for one side
    pub fn get(&self, side: ChainSide) -> RelayerResult<Arc<dyn ChainEndpoint>> {
        self.endpoints
            .get(&side)
            .map(|e| e.clone())
            .ok_or_else(|| RelayerError::Config(format!("Chain {} not configured", side)))
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(ChainSide, bool)> {
        let endpoints: Vec<_> = self
            .endpoints
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut results = Vec::new();
        for (side, endpoint) in endpoints {
            let healthy = endpoint.health_check().await;
            crate::metrics::record_chain_health(side, healthy);
            results.push((side, healthy));
        }

        results
    }

    pub fn connected_chains(&self) -> Vec<ChainSide> {
        self.endpoints.iter().map(|e| *e.key()).collect()
    }
}
