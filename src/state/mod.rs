//! Relay state persistence
//!
//! Handles:
//! - Sent transaction tracking for monitor crash recovery
//! - Settlement records, the idempotency key store
//! - Block cursors for listener restart
//!
//! Each store is scoped to one destination side of the bridge, so the two
//! relay legs never touch the same rows.

mod cache;
mod manager;
mod memory;

pub use cache::SettledCache;
pub use manager::{PgStore, StateManager};
pub use memory::MemoryStore;

use crate::error::RelayerResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use std::fmt;

/// A sent transaction awaiting a terminal outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnDetails {
    pub hash: H256,
    pub nonce: u64,
    pub created_at: DateTime<Utc>,
}

/// Terminal status recorded against a sent transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Failed(String),
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStatus::Success => f.write_str("success"),
            TxStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Persisted finalize attempt for one inbound transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementRecord {
    pub counterparty_index: U256,
    pub amount: U256,
    pub recipient: Address,
    pub nonce: u64,
    pub tx_hash: H256,
    pub settled: bool,
}

/// Records sent transactions so the monitor can resume after a crash
#[async_trait]
pub trait Saver: Send + Sync {
    async fn save(&self, hash: H256, nonce: u64) -> RelayerResult<()>;

    async fn update(&self, hash: H256, status: &TxStatus) -> RelayerResult<()>;

    /// Unresolved finalize transactions of this store
    async fn pending_txns(&self) -> RelayerResult<Vec<TxnDetails>>;

    /// Hashes saved for `nonce`, oldest first
    async fn attempts(&self, nonce: u64) -> RelayerResult<Vec<H256>>;
}

/// Idempotency store keyed by the originating transfer index
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert or replace the record; `settled` is reset to false
    async fn store_transfer(
        &self,
        counterparty_index: U256,
        amount: U256,
        recipient: Address,
        nonce: u64,
        tx_hash: H256,
    ) -> RelayerResult<()>;

    async fn mark_settled(&self, counterparty_index: U256) -> RelayerResult<()>;

    async fn is_settled(&self, counterparty_index: U256) -> RelayerResult<bool>;

    async fn settlement_record(
        &self,
        counterparty_index: U256,
    ) -> RelayerResult<Option<SettlementRecord>>;

    async fn unsettled_transfers(&self) -> RelayerResult<Vec<SettlementRecord>>;
}

/// Last fully processed block of the source chain
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn last_block(&self) -> RelayerResult<Option<u64>>;

    async fn set_last_block(&self, block: u64) -> RelayerResult<()>;
}
