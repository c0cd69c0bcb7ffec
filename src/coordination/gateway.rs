//! Idempotent finalization of inbound transfers on one destination chain

use crate::error::{RelayerError, RelayerResult};
use crate::events::{encode_finalize_call, ChainSide, EventParser, FinalizationRecord, TransferEvent};
use crate::state::{SettledCache, TransferStore};
use crate::tx::{CallRequest, SentTransaction, SubmissionHook, TransactionSender, Transactor};

use async_trait::async_trait;
use ethers::types::{TransactionReceipt, H256, U256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What `finalize_transfer` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Settlement record was already marked settled; nothing was sent
    AlreadySettled,
    Settled(FinalizationRecord),
}

/// Gateway contract binding on the destination side of a relay leg
pub struct Gateway {
    side: ChainSide,
    parser: EventParser,
    transactor: Arc<Transactor>,
    sender: TransactionSender,
    transfers: Arc<dyn TransferStore>,
    settled: SettledCache,
    gas_limit: U256,
    resubmit_failed: bool,
}

/// Persists the settlement record for every broadcast attempt, so the
/// latest hash and nonce survive a crash.
struct RecordTransfer {
    transfers: Arc<dyn TransferStore>,
    event: TransferEvent,
}

#[async_trait]
impl SubmissionHook for RecordTransfer {
    async fn on_broadcast(&self, sent: &SentTransaction) -> RelayerResult<()> {
        self.transfers
            .store_transfer(
                self.event.transfer_index,
                self.event.amount,
                self.event.recipient,
                sent.nonce,
                sent.hash,
            )
            .await
    }
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        side: ChainSide,
        parser: EventParser,
        transactor: Arc<Transactor>,
        sender: TransactionSender,
        transfers: Arc<dyn TransferStore>,
        settled_cache_size: usize,
        gas_limit: u64,
        resubmit_failed: bool,
    ) -> Self {
        Self {
            side,
            parser,
            transactor,
            sender,
            settled: SettledCache::new(transfers.clone(), settled_cache_size),
            transfers,
            gas_limit: U256::from(gas_limit),
            resubmit_failed,
        }
    }

    pub fn side(&self) -> ChainSide {
        self.side
    }

    pub async fn is_settled(&self, counterparty_index: U256) -> RelayerResult<bool> {
        self.settled.is_settled(counterparty_index).await
    }

    /// Whether a finalize for this transfer was ever broadcast
    pub async fn has_attempt(&self, counterparty_index: U256) -> RelayerResult<bool> {
        Ok(self
            .transfers
            .settlement_record(counterparty_index)
            .await?
            .is_some())
    }

    /// Finalize `event` on this chain at most once.
    ///
    /// A settled record short-circuits. An unsettled record means an earlier
    /// attempt was broadcast: its transaction is awaited before anything new
    /// is sent.
    pub async fn finalize_transfer(
        &self,
        event: &TransferEvent,
        cancel: &CancellationToken,
    ) -> RelayerResult<FinalizeOutcome> {
        let idx = event.transfer_index;

        if self.settled.is_settled(idx).await? {
            info!("Transfer {} from {} already settled, skipping", idx, event.source_chain);
            return Ok(FinalizeOutcome::AlreadySettled);
        }

        if let Some(record) = self.transfers.settlement_record(idx).await? {
            info!(
                "Transfer {} has an unsettled finalize {:?} (nonce {}), waiting on it",
                idx, record.tx_hash, record.nonce
            );

            let monitor = self.transactor.monitor();
            let waited = tokio::select! {
                _ = cancel.cancelled() => return Err(RelayerError::Cancelled),
                waited = monitor.wait_for_receipt(record.tx_hash, record.nonce) => waited,
            };

            // A fee-bump replacement recorded last may have lost its nonce to
            // an earlier attempt of the same transfer.
            let waited = match waited {
                Err(RelayerError::TransactionCancelled { tx_hash }) => {
                    let earlier: Vec<H256> = monitor
                        .attempts(record.nonce)
                        .await?
                        .into_iter()
                        .filter(|hash| *hash != record.tx_hash)
                        .collect();
                    self.sender
                        .landed_attempt(&earlier)
                        .await
                        .unwrap_or(Err(RelayerError::TransactionCancelled { tx_hash }))
                }
                other => other,
            };

            match waited {
                Ok(receipt) => return self.settle(event, receipt).await,
                Err(e @ (RelayerError::TransactionFailed { .. }
                | RelayerError::TransactionCancelled { .. }))
                    if self.resubmit_failed =>
                {
                    warn!("Previous finalize of transfer {} did not land ({}), resubmitting", idx, e);
                }
                Err(e) => return Err(e),
            }
        }

        let call = CallRequest {
            to: self.parser.contract_address(),
            data: encode_finalize_call(event.recipient, event.amount, idx),
            value: U256::zero(),
            gas: self.gas_limit,
        };
        let hook = RecordTransfer {
            transfers: self.transfers.clone(),
            event: event.clone(),
        };

        let transactor: &Transactor = &self.transactor;
        let call = &call;
        let receipt = self
            .sender
            .submit_with_retry(
                move |fees, nonce| transactor.send(call, fees, nonce, cancel),
                &hook,
                cancel,
            )
            .await?;

        self.settle(event, receipt).await
    }

    async fn settle(
        &self,
        event: &TransferEvent,
        receipt: TransactionReceipt,
    ) -> RelayerResult<FinalizeOutcome> {
        self.settled.mark_settled(event.transfer_index).await?;

        let record = self.parser.parse_finalized(&receipt).unwrap_or_else(|| {
            FinalizationRecord {
                recipient: event.recipient,
                amount: event.amount,
                counterparty_index: event.transfer_index,
                dest_chain: self.side,
                tx_hash: receipt.transaction_hash,
            }
        });

        info!(
            "Transfer {} from {} settled on {} in {:?}",
            record.counterparty_index, event.source_chain, self.side, record.tx_hash
        );
        Ok(FinalizeOutcome::Settled(record))
    }
}
