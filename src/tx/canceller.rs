//! Clears the relay account's mempool backlog
//!
//! Every nonce between the confirmed and the pending count is replaced by a
//! zero-value transfer to self at bumped fees. Used at startup so leftovers of
//! a previous run cannot hold up new finalizations.

use super::gas::GasEstimator;
use super::transactor::{CallRequest, SentTransaction, Transactor};
use crate::chain::ChainEndpoint;
use crate::error::RelayerResult;
use crate::events::ChainSide;

use ethers::types::{Bytes, U256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TRANSFER_GAS: u64 = 21_000;

pub struct Canceller {
    side: ChainSide,
    endpoint: Arc<dyn ChainEndpoint>,
    transactor: Arc<Transactor>,
    gas_estimator: GasEstimator,
}

impl Canceller {
    pub fn new(
        side: ChainSide,
        endpoint: Arc<dyn ChainEndpoint>,
        transactor: Arc<Transactor>,
        gas_estimator: GasEstimator,
    ) -> Self {
        Self {
            side,
            endpoint,
            transactor,
            gas_estimator,
        }
    }

    /// Replace every pending nonce. Returns the replacement transactions.
    pub async fn cancel_pending(
        &self,
        cancel: &CancellationToken,
    ) -> RelayerResult<Vec<SentTransaction>> {
        let account = self.transactor.address();
        let height = self.endpoint.current_height().await?;
        let latest = self.endpoint.account_nonce(account, height).await?;
        let pending = self.endpoint.pending_nonce(account).await?;

        if pending <= latest {
            return Ok(Vec::new());
        }

        info!(
            "Cancelling {} pending transactions on {} (nonces {}..{})",
            pending - latest,
            self.side,
            latest,
            pending
        );

        let self_transfer = CallRequest {
            to: account,
            data: Bytes::default(),
            value: U256::zero(),
            gas: U256::from(TRANSFER_GAS),
        };

        let mut replaced = Vec::new();
        for nonce in latest..pending {
            let suggested = self.endpoint.suggest_fee_tip_and_cap().await?;
            let fees = self.gas_estimator.bump(suggested, None);

            match self
                .transactor
                .send(&self_transfer, fees, Some(nonce), cancel)
                .await
            {
                Ok(sent) => replaced.push(sent),
                Err(e) if e.is_nonce_race() => {
                    warn!("Nonce {} on {} could not be replaced: {}", nonce, self.side, e)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(replaced)
    }
}
