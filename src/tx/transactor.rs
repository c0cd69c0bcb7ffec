//! Nonce assignment, signing and broadcast for the relay account
//!
//! Nonces are handed out through a single-slot `NonceGate`: whoever holds the
//! token is the only task allowed to pick a fresh nonce and broadcast. The
//! token is released only once the transaction is accepted by the node, so
//! nonces leave the relayer in non-decreasing order.

use super::monitor::Monitor;
use crate::chain::{ChainEndpoint, FeeParams};
use crate::config::WalletConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainSide;

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SEND_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Load the relay key from the configured environment variable
pub fn load_wallet(config: &WalletConfig) -> RelayerResult<LocalWallet> {
    let key = std::env::var(&config.private_key_env).map_err(|_| {
        RelayerError::Wallet(format!(
            "No wallet configured. Set {}",
            config.private_key_env
        ))
    })?;

    key.trim()
        .parse::<LocalWallet>()
        .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
}

/// Single-slot token holding the next nonce safe to use
#[derive(Clone)]
pub struct NonceGate {
    slot: Arc<Mutex<u64>>,
}

impl NonceGate {
    pub fn new(initial: u64) -> Self {
        Self {
            slot: Arc::new(Mutex::new(initial)),
        }
    }

    /// Wait for exclusive use of the token
    pub async fn acquire(&self) -> NonceToken {
        NonceToken {
            guard: self.slot.clone().lock_owned().await,
        }
    }
}

/// Exclusive hold on the gate. Dropping it without `advance` returns the
/// nonce unchanged.
#[derive(Debug)]
pub struct NonceToken {
    guard: OwnedMutexGuard<u64>,
}

impl NonceToken {
    pub fn value(&self) -> u64 {
        *self.guard
    }

    /// Record that `used` went out; the next holder gets at least `used + 1`
    pub fn advance(mut self, used: u64) {
        *self.guard = (*self.guard).max(used + 1);
    }
}

/// Contract call or transfer to broadcast
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas: U256,
}

/// Broadcast transaction accepted by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentTransaction {
    pub hash: H256,
    pub nonce: u64,
    pub fees: FeeParams,
}

/// Signs and broadcasts transactions for one account on one chain
pub struct Transactor {
    side: ChainSide,
    endpoint: Arc<dyn ChainEndpoint>,
    wallet: LocalWallet,
    monitor: Arc<Monitor>,
    gate: NonceGate,
    send_retries: u32,
}

impl Transactor {
    pub fn new(
        side: ChainSide,
        endpoint: Arc<dyn ChainEndpoint>,
        wallet: LocalWallet,
        monitor: Arc<Monitor>,
        send_retries: u32,
    ) -> Self {
        let wallet = wallet.with_chain_id(endpoint.chain_id());
        info!(
            "Transactor for {} initialized with wallet: {:?}",
            side,
            wallet.address()
        );

        Self {
            side,
            endpoint,
            wallet,
            monitor,
            gate: NonceGate::new(0),
            send_retries,
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Sign and broadcast `call`.
    ///
    /// With `nonce: None` a fresh nonce is taken from the gate; with
    /// `Some(n)` the transaction replaces whatever already uses `n`.
    pub async fn send(
        &self,
        call: &CallRequest,
        fees: FeeParams,
        nonce: Option<u64>,
        cancel: &CancellationToken,
    ) -> RelayerResult<SentTransaction> {
        match nonce {
            Some(nonce) => self.broadcast(call, fees, nonce, cancel).await,
            None => {
                let token = self.gate.acquire().await;
                let pending = self.endpoint.pending_nonce(self.address()).await?;
                let nonce = token.value().max(pending);

                // On error the token drops and the next caller retries this nonce.
                let sent = self.broadcast(call, fees, nonce, cancel).await?;
                token.advance(nonce);
                Ok(sent)
            }
        }
    }

    async fn broadcast(
        &self,
        call: &CallRequest,
        fees: FeeParams,
        nonce: u64,
        cancel: &CancellationToken,
    ) -> RelayerResult<SentTransaction> {
        let request = Eip1559TransactionRequest::new()
            .from(self.address())
            .to(call.to)
            .data(call.data.clone())
            .value(call.value)
            .gas(call.gas)
            .nonce(nonce)
            .chain_id(self.endpoint.chain_id())
            .max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .max_fee_per_gas(fees.max_fee_per_gas);
        let tx = TypedTransaction::Eip1559(request);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        if !self.monitor.allow(nonce, cancel).await {
            return Err(RelayerError::Cancelled);
        }

        let hash = self.submit_raw(raw, cancel).await?;
        self.monitor.sent(hash, nonce).await?;
        crate::metrics::record_tx_submitted(self.side);

        debug!(
            "Sent {:?} on {} (nonce {}, tip {}, cap {})",
            hash, self.side, nonce, fees.max_priority_fee_per_gas, fees.max_fee_per_gas
        );

        Ok(SentTransaction { hash, nonce, fees })
    }

    /// Broadcast, retrying only when the RPC call itself timed out
    async fn submit_raw(&self, raw: Bytes, cancel: &CancellationToken) -> RelayerResult<H256> {
        let mut delay = SEND_RETRY_BASE_DELAY;
        let mut attempt = 0;

        loop {
            match self.endpoint.submit(raw.clone()).await {
                Err(RelayerError::Timeout { operation }) if attempt < self.send_retries => {
                    attempt += 1;
                    warn!(
                        "Timed out trying to {} on {} (attempt {}), retrying in {:?}",
                        operation, self.side, attempt, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RelayerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay *= 2;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{load_wallet, NonceGate};
    use crate::config::WalletConfig;
    use crate::error::RelayerError;
    use ethers::signers::Signer;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn test_token_returned_unchanged_on_drop() {
        let gate = NonceGate::new(4);

        let token = gate.acquire().await;
        assert_eq!(token.value(), 4);
        drop(token);

        let token = gate.acquire().await;
        assert_eq!(token.value(), 4);
        token.advance(9);

        assert_eq!(gate.acquire().await.value(), 10);
    }

    #[tokio::test]
    async fn test_advance_never_moves_backwards() {
        let gate = NonceGate::new(12);
        gate.acquire().await.advance(3);
        assert_eq!(gate.acquire().await.value(), 12);
    }

    #[tokio::test]
    async fn test_gate_is_exclusive() {
        let gate = NonceGate::new(0);
        let held = gate.acquire().await;

        let mut waiter = tokio_test::task::spawn(gate.acquire());
        assert_pending!(waiter.poll());

        held.advance(0);
        assert!(waiter.is_woken());
        let token = assert_ready!(waiter.poll());
        assert_eq!(token.value(), 1);
    }

    #[test]
    fn test_load_wallet_reads_env() {
        std::env::set_var(
            "TEST_RELAYER_KEY",
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        );
        let wallet = load_wallet(&WalletConfig {
            private_key_env: "TEST_RELAYER_KEY".into(),
        })
        .unwrap();
        assert_eq!(
            format!("{:?}", wallet.address()),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );

        let missing = load_wallet(&WalletConfig {
            private_key_env: "TEST_RELAYER_KEY_UNSET".into(),
        });
        assert!(matches!(missing, Err(RelayerError::Wallet(_))));
    }
}
