//! Bounded read-through cache in front of `TransferStore::is_settled`

use super::TransferStore;
use crate::error::RelayerResult;

use ethers::types::U256;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// LRU of transfer indices known to be settled.
///
/// Settlement never reverts, so only positive answers are cached and a hit
/// never needs revalidation. A miss reads the store and fills on `true`.
pub struct SettledCache {
    store: Arc<dyn TransferStore>,
    settled: Mutex<LruCache<U256, ()>>,
}

impl SettledCache {
    pub fn new(store: Arc<dyn TransferStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            settled: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn is_settled(&self, counterparty_index: U256) -> RelayerResult<bool> {
        if self.settled.lock().await.get(&counterparty_index).is_some() {
            return Ok(true);
        }

        let settled = self.store.is_settled(counterparty_index).await?;
        if settled {
            self.settled.lock().await.put(counterparty_index, ());
        }
        Ok(settled)
    }

    /// Persist the flag, then remember it
    pub async fn mark_settled(&self, counterparty_index: U256) -> RelayerResult<()> {
        self.store.mark_settled(counterparty_index).await?;
        self.settled.lock().await.put(counterparty_index, ());
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.settled.lock().await.len()
    }
}
