//! In-process store for development runs and tests

use super::{CursorStore, Saver, SettlementRecord, TransferStore, TxStatus, TxnDetails};
use crate::error::RelayerResult;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, H256, U256};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug)]
struct SentTx {
    seq: u64,
    nonce: u64,
    created_at: chrono::DateTime<Utc>,
    status: Option<TxStatus>,
}

#[derive(Debug, Default)]
struct Inner {
    sent: HashMap<H256, SentTx>,
    transfers: BTreeMap<U256, SettlementRecord>,
    last_block: Option<u64>,
}

/// Same contract as `PgStore`, held in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminal status recorded for a sent transaction, if any
    pub async fn tx_status(&self, hash: H256) -> Option<TxStatus> {
        self.inner
            .read()
            .await
            .sent
            .get(&hash)
            .and_then(|tx| tx.status.clone())
    }
}

#[async_trait]
impl Saver for MemoryStore {
    async fn save(&self, hash: H256, nonce: u64) -> RelayerResult<()> {
        let mut inner = self.inner.write().await;
        let seq = inner.sent.len() as u64;
        inner.sent.entry(hash).or_insert(SentTx {
            seq,
            nonce,
            created_at: Utc::now(),
            status: None,
        });
        Ok(())
    }

    async fn update(&self, hash: H256, status: &TxStatus) -> RelayerResult<()> {
        if let Some(tx) = self.inner.write().await.sent.get_mut(&hash) {
            tx.status = Some(status.clone());
        }
        Ok(())
    }

    async fn pending_txns(&self) -> RelayerResult<Vec<TxnDetails>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<TxnDetails> = inner
            .transfers
            .values()
            .filter(|record| !record.settled)
            .filter_map(|record| {
                let sent = inner.sent.get(&record.tx_hash)?;
                sent.status.is_none().then(|| TxnDetails {
                    hash: record.tx_hash,
                    nonce: sent.nonce,
                    created_at: sent.created_at,
                })
            })
            .collect();

        pending.sort_by_key(|tx| tx.nonce);
        Ok(pending)
    }

    async fn attempts(&self, nonce: u64) -> RelayerResult<Vec<H256>> {
        let inner = self.inner.read().await;
        let mut attempts: Vec<(u64, H256)> = inner
            .sent
            .iter()
            .filter(|(_, tx)| tx.nonce == nonce)
            .map(|(hash, tx)| (tx.seq, *hash))
            .collect();

        attempts.sort();
        Ok(attempts.into_iter().map(|(_, hash)| hash).collect())
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn store_transfer(
        &self,
        counterparty_index: U256,
        amount: U256,
        recipient: Address,
        nonce: u64,
        tx_hash: H256,
    ) -> RelayerResult<()> {
        self.inner.write().await.transfers.insert(
            counterparty_index,
            SettlementRecord {
                counterparty_index,
                amount,
                recipient,
                nonce,
                tx_hash,
                settled: false,
            },
        );
        Ok(())
    }

    async fn mark_settled(&self, counterparty_index: U256) -> RelayerResult<()> {
        if let Some(record) = self
            .inner
            .write()
            .await
            .transfers
            .get_mut(&counterparty_index)
        {
            record.settled = true;
        }
        Ok(())
    }

    async fn is_settled(&self, counterparty_index: U256) -> RelayerResult<bool> {
        Ok(self
            .inner
            .read()
            .await
            .transfers
            .get(&counterparty_index)
            .map_or(false, |r| r.settled))
    }

    async fn settlement_record(
        &self,
        counterparty_index: U256,
    ) -> RelayerResult<Option<SettlementRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .transfers
            .get(&counterparty_index)
            .cloned())
    }

    async fn unsettled_transfers(&self) -> RelayerResult<Vec<SettlementRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .transfers
            .values()
            .filter(|r| !r.settled)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn last_block(&self) -> RelayerResult<Option<u64>> {
        Ok(self.inner.read().await.last_block)
    }

    async fn set_last_block(&self, block: u64) -> RelayerResult<()> {
        self.inner.write().await.last_block = Some(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_txns_join_unsettled_transfers() {
        let store = MemoryStore::new();
        let finalize = H256::repeat_byte(1);
        let cancel = H256::repeat_byte(2);
        let idx = U256::from(4);

        store.save(finalize, 7).await.unwrap();
        store.save(cancel, 8).await.unwrap();
        store
            .store_transfer(idx, U256::from(10), Address::zero(), 7, finalize)
            .await
            .unwrap();

        let pending = store.pending_txns().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!((pending[0].hash, pending[0].nonce), (finalize, 7));

        store.update(finalize, &TxStatus::Success).await.unwrap();
        assert!(store.pending_txns().await.unwrap().is_empty());
        assert!(!store.is_settled(idx).await.unwrap());

        store.mark_settled(idx).await.unwrap();
        assert!(store.is_settled(idx).await.unwrap());
        assert!(store.unsettled_transfers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attempts_for_nonce_in_broadcast_order() {
        let store = MemoryStore::new();
        let original = H256::repeat_byte(2);
        let replacement = H256::repeat_byte(1);

        store.save(original, 3).await.unwrap();
        store.save(H256::repeat_byte(9), 4).await.unwrap();
        store.save(replacement, 3).await.unwrap();
        // Saving again keeps the original position
        store.save(original, 3).await.unwrap();

        assert_eq!(store.attempts(3).await.unwrap(), vec![original, replacement]);
        assert!(store.attempts(5).await.unwrap().is_empty());
    }
}
