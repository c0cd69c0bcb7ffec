//! Submission with fee-bump replacement of stuck transactions

use super::gas::GasEstimator;
use super::monitor::{Monitor, TxOutcome};
use super::transactor::SentTransaction;
use crate::chain::listener::backoff_delay;
use crate::chain::{ChainEndpoint, FeeParams};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainSide;

use async_trait::async_trait;
use ethers::types::{TransactionReceipt, H256, U64};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const RPC_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Called after every accepted broadcast, before waiting for inclusion
#[async_trait]
pub trait SubmissionHook: Send + Sync {
    async fn on_broadcast(&self, sent: &SentTransaction) -> RelayerResult<()>;
}

#[async_trait]
impl SubmissionHook for () {
    async fn on_broadcast(&self, _sent: &SentTransaction) -> RelayerResult<()> {
        Ok(())
    }
}

/// Drives one logical transaction to inclusion, replacing it with higher
/// fees whenever it sits unmined past the inclusion timeout.
pub struct TransactionSender {
    side: ChainSide,
    endpoint: Arc<dyn ChainEndpoint>,
    monitor: Arc<Monitor>,
    gas_estimator: GasEstimator,
    inclusion_timeout: Duration,
    max_retries: u32,
}

impl TransactionSender {
    pub fn new(
        side: ChainSide,
        endpoint: Arc<dyn ChainEndpoint>,
        monitor: Arc<Monitor>,
        config: &RelayerConfig,
    ) -> Self {
        Self {
            side,
            endpoint,
            monitor,
            gas_estimator: GasEstimator::new(config.fee_bump_percent),
            inclusion_timeout: config.submission_timeout(),
            max_retries: config.max_retries,
        }
    }

    pub fn gas_estimator(&self) -> &GasEstimator {
        &self.gas_estimator
    }

    /// Broadcast through `send` and wait for a terminal outcome.
    ///
    /// `send` receives the fees to use and, after the first broadcast, the
    /// nonce to replace. An inclusion timeout, a nonce race or a transient RPC
    /// error leads to another attempt; reverts and cancellations are returned
    /// to the caller.
    pub async fn submit_with_retry<F, Fut>(
        &self,
        mut send: F,
        hook: &dyn SubmissionHook,
        cancel: &CancellationToken,
    ) -> RelayerResult<TransactionReceipt>
    where
        F: FnMut(FeeParams, Option<u64>) -> Fut,
        Fut: Future<Output = RelayerResult<SentTransaction>>,
    {
        let mut fees = self.initial_fees(cancel).await?;
        let mut nonce: Option<u64> = None;
        let mut attempts: Vec<H256> = Vec::new();

        for attempt in 1..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(RelayerError::Cancelled);
            }

            let sent = match send(fees, nonce).await {
                Ok(sent) => sent,
                Err(e) if e.is_nonce_race() => {
                    warn!(
                        "Attempt {} on {} hit a nonce race, bumping fees: {}",
                        attempt, self.side, e
                    );
                    fees = self.bumped(fees).await;
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff_delay(RPC_RETRY_BASE_DELAY, attempt - 1);
                    warn!(
                        "Attempt {} on {} failed, retrying in {:?}: {}",
                        attempt, self.side, delay, e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RelayerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(e) => {
                    // A replacement is refused once an earlier attempt took the nonce
                    if nonce.is_some() {
                        if let Some(landed) = self.landed_attempt(&attempts).await {
                            return landed;
                        }
                    }
                    return Err(e);
                }
            };

            nonce = Some(sent.nonce);
            fees = sent.fees;
            attempts.push(sent.hash);
            hook.on_broadcast(&sent).await?;

            let rx = self.monitor.watch(sent.hash, sent.nonce).await;
            let waited = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayerError::Cancelled),
                waited = timeout(self.inclusion_timeout, rx) => waited,
            };

            match waited {
                Ok(Ok(TxOutcome::Confirmed(receipt))) => return Ok(receipt),
                Ok(Ok(TxOutcome::Cancelled)) => {
                    let earlier = &attempts[..attempts.len() - 1];
                    return self.landed_attempt(earlier).await.unwrap_or_else(|| {
                        Err(RelayerError::TransactionCancelled {
                            tx_hash: format!("{:?}", sent.hash),
                        })
                    });
                }
                Ok(Ok(outcome)) => return outcome.into_result(sent.hash),
                Ok(Err(_)) => return Err(RelayerError::MonitorClosed),
                Err(_) => {
                    info!(
                        "{:?} (nonce {}) not included on {} within {:?}, replacing ({}/{})",
                        sent.hash,
                        sent.nonce,
                        self.side,
                        self.inclusion_timeout,
                        attempt,
                        self.max_retries
                    );
                    crate::metrics::record_fee_bump(self.side);
                    fees = self.bumped(fees).await;
                }
            }
        }

        Err(RelayerError::RetriesExhausted {
            attempts: self.max_retries,
        })
    }

    /// Fee suggestion for the first broadcast, retried while the RPC error
    /// is transient
    async fn initial_fees(&self, cancel: &CancellationToken) -> RelayerResult<FeeParams> {
        let mut attempt = 0;

        loop {
            match self.endpoint.suggest_fee_tip_and_cap().await {
                Ok(fees) => return Ok(fees),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_retries => {
                    let delay = backoff_delay(RPC_RETRY_BASE_DELAY, attempt);
                    attempt += 1;
                    warn!(
                        "Fee suggestion on {} failed (attempt {}), retrying in {:?}: {}",
                        self.side, attempt, delay, e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RelayerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn bumped(&self, previous: FeeParams) -> FeeParams {
        let suggested = match self.endpoint.suggest_fee_tip_and_cap().await {
            Ok(fees) => Some(fees),
            Err(e) => {
                warn!("Fee suggestion on {} failed, bumping previous fees: {}", self.side, e);
                None
            }
        };
        self.gas_estimator.bump(previous, suggested)
    }

    /// Receipt of whichever of `candidates` was mined, newest first. `None`
    /// when none of them is on chain.
    pub async fn landed_attempt(
        &self,
        candidates: &[H256],
    ) -> Option<RelayerResult<TransactionReceipt>> {
        for hash in candidates.iter().rev() {
            match self.endpoint.receipt(*hash).await {
                Ok(Some(receipt)) if receipt.status == Some(U64::zero()) => {
                    return Some(TxOutcome::Failed(receipt).into_result(*hash));
                }
                Ok(Some(receipt)) => {
                    info!("Earlier attempt {:?} on {} was the one mined", hash, self.side);
                    return Some(Ok(receipt));
                }
                Ok(None) => {}
                Err(e) => warn!("Receipt lookup of {:?} failed: {}", hash, e),
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainEndpoint;
    use crate::state::MemoryStore;
    use ethers::types::{Address, U256};
    use std::sync::Mutex;

    fn fees(tip: u64, cap: u64) -> FeeParams {
        FeeParams {
            max_priority_fee_per_gas: U256::from(tip),
            max_fee_per_gas: U256::from(cap),
        }
    }

    async fn sender(mock: MockChainEndpoint, max_retries: u32) -> TransactionSender {
        let endpoint: Arc<dyn ChainEndpoint> = Arc::new(mock);
        let config = RelayerConfig {
            max_retries,
            submission_timeout_secs: 60,
            ..Default::default()
        };
        let monitor = Monitor::new(
            ChainSide::L1,
            endpoint.clone(),
            Address::zero(),
            Arc::new(MemoryStore::new()),
            &config,
        )
        .await
        .unwrap();
        TransactionSender::new(ChainSide::L1, endpoint, monitor, &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_transaction_is_replaced_until_ceiling() {
        let mut mock = MockChainEndpoint::new();
        mock.expect_suggest_fee_tip_and_cap()
            .returning(|| Ok(fees(100, 300)));
        let sender = sender(mock, 3).await;

        let calls: Mutex<Vec<(FeeParams, Option<u64>)>> = Mutex::new(Vec::new());
        let result = sender
            .submit_with_retry(
                |fees, nonce| {
                    let n = {
                        let mut calls = calls.lock().unwrap();
                        calls.push((fees, nonce));
                        calls.len() as u64
                    };
                    async move {
                        Ok(SentTransaction {
                            hash: H256::from_low_u64_be(n),
                            nonce: nonce.unwrap_or(42),
                            fees,
                        })
                    }
                },
                &(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(RelayerError::RetriesExhausted { attempts: 3 })));

        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, None);
        assert!(calls[1..].iter().all(|(_, nonce)| *nonce == Some(42)));
        assert!(calls.windows(2).all(|w| {
            w[1].0.max_priority_fee_per_gas > w[0].0.max_priority_fee_per_gas
                && w[1].0.max_fee_per_gas > w[0].0.max_fee_per_gas
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonce_race_is_retried_and_hard_errors_surface() {
        let mut mock = MockChainEndpoint::new();
        mock.expect_suggest_fee_tip_and_cap()
            .returning(|| Ok(fees(100, 300)));
        let sender = sender(mock, 5).await;

        let attempts = Mutex::new(0u32);
        let result = sender
            .submit_with_retry(
                |_, _| {
                    let n = {
                        let mut attempts = attempts.lock().unwrap();
                        *attempts += 1;
                        *attempts
                    };
                    async move {
                        if n == 1 {
                            Err(RelayerError::Transaction("already known".into()))
                        } else {
                            Err(RelayerError::Transaction("execution reverted".into()))
                        }
                    }
                },
                &(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(RelayerError::Transaction(msg)) if msg == "execution reverted"));
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_replacement_returns_the_attempt_that_landed() {
        let original = H256::from_low_u64_be(1);

        let mut mock = MockChainEndpoint::new();
        mock.expect_suggest_fee_tip_and_cap()
            .returning(|| Ok(fees(100, 300)));
        mock.expect_receipt()
            .withf(move |hash| *hash == original)
            .returning(|hash| {
                Ok(Some(TransactionReceipt {
                    transaction_hash: hash,
                    status: Some(U64::one()),
                    ..Default::default()
                }))
            });
        let sender = sender(mock, 5).await;

        // The first broadcast is mined while its replacement is being built
        let calls = Mutex::new(0u64);
        let result = sender
            .submit_with_retry(
                |fees, nonce| {
                    let n = {
                        let mut calls = calls.lock().unwrap();
                        *calls += 1;
                        *calls
                    };
                    async move {
                        if n == 1 {
                            Ok(SentTransaction {
                                hash: original,
                                nonce: nonce.unwrap_or(7),
                                fees,
                            })
                        } else {
                            Err(RelayerError::Transaction("nonce too low".into()))
                        }
                    }
                },
                &(),
                &CancellationToken::new(),
            )
            .await;

        let receipt = result.unwrap();
        assert_eq!(receipt.transaction_hash, original);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_fee_errors_are_retried_before_first_broadcast() {
        let mut mock = MockChainEndpoint::new();
        mock.expect_suggest_fee_tip_and_cap()
            .times(2)
            .returning(|| {
                Err(RelayerError::ChainConnection {
                    chain_id: 1,
                    message: "connection reset".into(),
                })
            });
        mock.expect_suggest_fee_tip_and_cap()
            .returning(|| Ok(fees(100, 300)));
        let sender = sender(mock, 5).await;

        let seen = Mutex::new(Vec::new());
        let result = sender
            .submit_with_retry(
                |fees, _| {
                    seen.lock().unwrap().push(fees);
                    async { Err(RelayerError::Transaction("execution reverted".into())) }
                },
                &(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(RelayerError::Transaction(_))));
        assert_eq!(seen.into_inner().unwrap(), vec![fees(100, 300)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fee_errors_give_up_at_the_retry_ceiling() {
        let mut mock = MockChainEndpoint::new();
        mock.expect_suggest_fee_tip_and_cap()
            .times(3)
            .returning(|| {
                Err(RelayerError::Timeout {
                    operation: "eth_feeHistory".into(),
                })
            });
        let sender = sender(mock, 3).await;

        let result = sender
            .submit_with_retry(
                |_, _| async { Err(RelayerError::Internal("unreachable".into())) },
                &(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(RelayerError::Timeout { .. })));
    }
}
