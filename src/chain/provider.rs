//! Chain provider with multi-RPC support and automatic failover

use super::{ChainEndpoint, FeeParams, RawEvent};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

const GWEI: u64 = 1_000_000_000;

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run a read call against each provider in turn until one answers.
    /// Every attempt is bounded by the configured RPC timeout.
    async fn with_failover<T, F, Fut>(&self, operation: &str, call: F) -> RelayerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();

        for _ in 0..self.http_providers.len() {
            match tokio::time::timeout(self.config.rpc_timeout(), call(self.http().clone())).await
            {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!(
                        "Failed to {} on chain {}: {}",
                        operation, self.config.chain_id, e
                    );
                    last_error = e.to_string();
                }
                Err(_) => {
                    warn!("Timed out trying to {} on chain {}", operation, self.config.chain_id);
                    last_error = format!("{} timed out", operation);
                }
            }
            self.failover();
        }

        Err(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: format!("All providers failed to {}: {}", operation, last_error),
        })
    }

    async fn eip1559_fees(&self) -> RelayerResult<FeeParams> {
        let default_tip = U256::from(self.config.default_priority_fee_gwei) * U256::from(GWEI);

        let tip = match self
            .with_failover("get priority fee", |p| async move {
                p.request::<_, U256>("eth_maxPriorityFeePerGas", ()).await
            })
            .await
        {
            Ok(tip) => tip,
            Err(e) => {
                debug!("Priority fee unavailable on chain {}, using default: {}", self.config.chain_id, e);
                default_tip
            }
        };

        let block = self
            .with_failover("get latest block", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| RelayerError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RelayerError::GasEstimation("No base fee in block".to_string()))?;

        Ok(cap_fees(
            tip,
            base_fee * 2 + tip,
            U256::from(self.config.max_gas_price_gwei) * U256::from(GWEI),
        ))
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }
}

/// Clamp the cap to the configured ceiling; the tip never exceeds the cap
fn cap_fees(tip: U256, cap: U256, ceiling: U256) -> FeeParams {
    let max_fee_per_gas = std::cmp::min(cap, ceiling);
    FeeParams {
        max_priority_fee_per_gas: std::cmp::min(tip, max_fee_per_gas),
        max_fee_per_gas,
    }
}

#[async_trait]
impl ChainEndpoint for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn current_height(&self) -> RelayerResult<u64> {
        self.with_failover("get block number", |p| async move { p.get_block_number().await })
            .await
            .map(|b| b.as_u64())
    }

    async fn account_nonce(&self, account: Address, at_height: u64) -> RelayerResult<u64> {
        let block: BlockId = BlockNumber::Number(at_height.into()).into();
        self.with_failover("get account nonce", |p| async move {
            p.get_transaction_count(account, Some(block)).await
        })
        .await
        .map(|n| n.as_u64())
    }

    async fn pending_nonce(&self, account: Address) -> RelayerResult<u64> {
        let block: BlockId = BlockNumber::Pending.into();
        self.with_failover("get pending nonce", |p| async move {
            p.get_transaction_count(account, Some(block)).await
        })
        .await
        .map(|n| n.as_u64())
    }

    async fn filter_events(
        &self,
        contract: Address,
        topic: H256,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<RawEvent>> {
        let filter = Filter::new()
            .address(contract)
            .topic0(topic)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .with_failover("get logs", |p| {
                let filter = filter.clone();
                async move { p.get_logs(&filter).await }
            })
            .await?;

        Ok(logs.into_iter().map(RawEvent::from).collect())
    }

    async fn suggest_fee_tip_and_cap(&self) -> RelayerResult<FeeParams> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .with_failover("get gas price", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(FeeParams {
                    max_priority_fee_per_gas: price,
                    max_fee_per_gas: price,
                })
            }
            GasPriceStrategy::Eip1559 => self.eip1559_fees().await,
        }
    }

    async fn submit(&self, signed_tx: Bytes) -> RelayerResult<H256> {
        // No failover here: a rejection is an answer, not an outage.
        let provider = self.http().clone();
        let send = async move {
            provider
                .send_raw_transaction(signed_tx)
                .await
                .map(|pending| pending.tx_hash())
        };

        match tokio::time::timeout(self.config.rpc_timeout(), send).await {
            Ok(Ok(hash)) => Ok(hash),
            Ok(Err(e)) => {
                let message = e.to_string();
                if message.contains("insufficient funds") {
                    return Err(RelayerError::InsufficientBalance {
                        chain_id: self.config.chain_id,
                    });
                }
                Err(RelayerError::Transaction(message))
            }
            Err(_) => Err(RelayerError::Timeout {
                operation: "send transaction".to_string(),
            }),
        }
    }

    async fn receipt(&self, tx_hash: H256) -> RelayerResult<Option<TransactionReceipt>> {
        self.with_failover("get receipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    async fn batch_receipts(
        &self,
        hashes: &[H256],
    ) -> RelayerResult<Vec<RelayerResult<Option<TransactionReceipt>>>> {
        let provider = self.http().clone();
        let rpc_timeout = self.config.rpc_timeout();
        let chain_id = self.config.chain_id;

        let lookups = hashes.iter().map(|hash| {
            let provider = provider.clone();
            let hash = *hash;
            async move {
                match tokio::time::timeout(rpc_timeout, provider.get_transaction_receipt(hash)).await
                {
                    Ok(result) => result.map_err(|e| RelayerError::ChainConnection {
                        chain_id,
                        message: e.to_string(),
                    }),
                    Err(_) => Err(RelayerError::Timeout {
                        operation: format!("receipt {:?}", hash),
                    }),
                }
            }
        });

        Ok(futures::future::join_all(lookups).await)
    }

    async fn health_check(&self) -> bool {
        match self.current_height().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}
