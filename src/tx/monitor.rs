//! Nonce-ordered transaction monitor
//!
//! One monitor owns confirmation tracking for one signing account on one
//! chain. Instead of every caller polling for its own receipt, a single loop
//! reads the account's confirmed nonce and a sweeper fetches receipts for every
//! tracked transaction below it, in batches.

use crate::chain::ChainEndpoint;
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::ChainSide;
use crate::state::{Saver, TxStatus};

use ethers::types::{Address, TransactionReceipt, H256, U64};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal outcome delivered to every watcher of a transaction
#[derive(Debug, Clone)]
pub enum TxOutcome {
    Confirmed(TransactionReceipt),
    /// Mined with a failure status
    Failed(TransactionReceipt),
    /// Nonce consumed by a different transaction
    Cancelled,
    MonitorClosed,
}

impl TxOutcome {
    pub fn into_result(self, tx_hash: H256) -> RelayerResult<TransactionReceipt> {
        match self {
            TxOutcome::Confirmed(receipt) => Ok(receipt),
            TxOutcome::Failed(receipt) => Err(RelayerError::TransactionFailed {
                tx_hash: format!("{:?}", tx_hash),
                reason: format!(
                    "status 0 in block {}",
                    receipt.block_number.unwrap_or_default()
                ),
            }),
            TxOutcome::Cancelled => Err(RelayerError::TransactionCancelled {
                tx_hash: format!("{:?}", tx_hash),
            }),
            TxOutcome::MonitorClosed => Err(RelayerError::MonitorClosed),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TxOutcome::Confirmed(_) => "confirmed",
            TxOutcome::Failed(_) => "failed",
            TxOutcome::Cancelled => "cancelled",
            TxOutcome::MonitorClosed => "closed",
        }
    }

    fn status(&self) -> Option<TxStatus> {
        match self {
            TxOutcome::Confirmed(_) => Some(TxStatus::Success),
            TxOutcome::Failed(_) => Some(TxStatus::Failed("reverted".to_string())),
            TxOutcome::Cancelled => Some(TxStatus::Failed("nonce reused".to_string())),
            TxOutcome::MonitorClosed => None,
        }
    }
}

/// Receipt classification. A missing receipt below the confirmed nonce means
/// another transaction took the slot.
fn classify(receipt: Option<TransactionReceipt>) -> TxOutcome {
    match receipt {
        None => TxOutcome::Cancelled,
        Some(receipt) if receipt.status == Some(U64::zero()) => TxOutcome::Failed(receipt),
        Some(receipt) => TxOutcome::Confirmed(receipt),
    }
}

async fn wait_for_window(confirmed: &mut watch::Receiver<u64>, nonce: u64, window: u64) -> bool {
    loop {
        if nonce <= confirmed.borrow_and_update().saturating_add(window) {
            return true;
        }
        if confirmed.changed().await.is_err() {
            return false;
        }
    }
}

type Sinks = Vec<oneshot::Sender<TxOutcome>>;

#[derive(Default)]
struct WaitState {
    closed: bool,
    /// nonce -> hash -> watchers. A tracked hash may have no watchers yet.
    waiters: HashMap<u64, HashMap<H256, Sinks>>,
}

/// Tracks outstanding transactions of one account
pub struct Monitor {
    side: ChainSide,
    endpoint: Arc<dyn ChainEndpoint>,
    account: Address,
    saver: Arc<dyn Saver>,
    max_pending: u64,
    batch_size: usize,
    poll_interval: Duration,
    state: Mutex<WaitState>,
    new_tx: Notify,
    /// Highest confirmed nonce seen; every publish triggers a sweep
    last_confirmed: watch::Sender<u64>,
    closed: CancellationToken,
}

impl Monitor {
    /// Create a monitor and re-register transactions the saver still
    /// considers pending.
    pub async fn new(
        side: ChainSide,
        endpoint: Arc<dyn ChainEndpoint>,
        account: Address,
        saver: Arc<dyn Saver>,
        config: &RelayerConfig,
    ) -> RelayerResult<Arc<Self>> {
        let (last_confirmed, _) = watch::channel(0);
        let monitor = Arc::new(Self {
            side,
            endpoint,
            account,
            saver,
            max_pending: config.max_pending_txs,
            batch_size: config.receipt_batch_size.max(1),
            poll_interval: config.monitor_poll_interval(),
            state: Mutex::new(WaitState::default()),
            new_tx: Notify::new(),
            last_confirmed,
            closed: CancellationToken::new(),
        });

        let pending = monitor.saver.pending_txns().await?;
        if !pending.is_empty() {
            info!(
                "Monitor for {} reloaded {} pending transactions",
                side,
                pending.len()
            );
        }
        {
            let mut state = monitor.state.lock().await;
            for tx in pending {
                state
                    .waiters
                    .entry(tx.nonce)
                    .or_default()
                    .entry(tx.hash)
                    .or_default();
            }
        }

        Ok(monitor)
    }

    /// Spawn the polling and sweeping loops. The returned task finishes after
    /// `cancel` fires and every remaining watcher got `MonitorClosed`.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let poller = tokio::spawn(self.clone().poll_loop(cancel.clone()));
        let sweeper = tokio::spawn(self.clone().sweep_loop(cancel));
        let this = self.clone();

        tokio::spawn(async move {
            let (poll_result, sweep_result) = tokio::join!(poller, sweeper);
            if let Err(e) = poll_result.and(sweep_result) {
                warn!("Monitor task for {} ended abnormally: {}", this.side, e);
            }
            this.close().await;
        })
    }

    /// Wait until `nonce` fits in the pending window. Returns false if
    /// `cancel` fires or the monitor closes first.
    pub async fn allow(&self, nonce: u64, cancel: &CancellationToken) -> bool {
        let mut confirmed = self.last_confirmed.subscribe();
        let window = self.max_pending;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.closed.cancelled() => false,
            fits = wait_for_window(&mut confirmed, nonce, window) => fits,
        }
    }

    /// Register a broadcast transaction and persist it
    pub async fn sent(&self, hash: H256, nonce: u64) -> RelayerResult<()> {
        self.saver.save(hash, nonce).await?;

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(RelayerError::MonitorClosed);
            }
            state.waiters.entry(nonce).or_default().entry(hash).or_default();
        }

        debug!("Monitor for {} tracking {:?} (nonce {})", self.side, hash, nonce);
        self.new_tx.notify_one();
        Ok(())
    }

    /// One-shot receiver resolved with the transaction's terminal outcome
    pub async fn watch(&self, hash: H256, nonce: u64) -> oneshot::Receiver<TxOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().await;

        if state.closed {
            let _ = tx.send(TxOutcome::MonitorClosed);
        } else {
            state
                .waiters
                .entry(nonce)
                .or_default()
                .entry(hash)
                .or_default()
                .push(tx);
            drop(state);
            self.new_tx.notify_one();
        }

        rx
    }

    /// Wait for the transaction to resolve; anything but `Confirmed` is an error
    pub async fn wait_for_receipt(&self, hash: H256, nonce: u64) -> RelayerResult<TransactionReceipt> {
        let outcome = self
            .watch(hash, nonce)
            .await
            .await
            .unwrap_or(TxOutcome::MonitorClosed);
        outcome.into_result(hash)
    }

    /// Every transaction this account broadcast with `nonce`, oldest first
    pub async fn attempts(&self, nonce: u64) -> RelayerResult<Vec<H256>> {
        self.saver.attempts(nonce).await
    }

    pub fn last_confirmed_nonce(&self) -> u64 {
        *self.last_confirmed.borrow()
    }

    /// Tracked transactions, watched or not
    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .waiters
            .values()
            .map(|hashes| hashes.len())
            .sum()
    }

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.new_tx.notified() => {}
            }

            let height = match self.endpoint.current_height().await {
                Ok(h) => h,
                Err(e) => {
                    warn!("Monitor for {} could not read height: {}", self.side, e);
                    continue;
                }
            };

            match self.endpoint.account_nonce(self.account, height).await {
                Ok(nonce) => self.record_confirmed_nonce(nonce),
                Err(e) => warn!(
                    "Monitor for {} could not read nonce at block {}: {}",
                    self.side, height, e
                ),
            }
        }
    }

    /// Publish the confirmed nonce; never moves backwards
    fn record_confirmed_nonce(&self, nonce: u64) {
        self.last_confirmed.send_modify(|last| *last = (*last).max(nonce));
        crate::metrics::record_confirmed_nonce(self.side, self.last_confirmed_nonce());
    }

    async fn sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut confirmed = self.last_confirmed.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = confirmed.changed() => if changed.is_err() { break },
            }

            let below = *confirmed.borrow_and_update();
            self.sweep(below).await;
        }
    }

    /// Resolve every tracked transaction with a nonce below `confirmed_nonce`
    async fn sweep(&self, confirmed_nonce: u64) {
        let due: Vec<(u64, H256)> = {
            let state = self.state.lock().await;
            let mut due: Vec<_> = state
                .waiters
                .iter()
                .filter(|(nonce, _)| **nonce < confirmed_nonce)
                .flat_map(|(nonce, hashes)| hashes.keys().map(move |hash| (*nonce, *hash)))
                .collect();
            due.sort();
            due
        };

        for chunk in due.chunks(self.batch_size) {
            let hashes: Vec<H256> = chunk.iter().map(|(_, hash)| *hash).collect();

            let results = match self.endpoint.batch_receipts(&hashes).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(
                        "Receipt batch of {} on {} failed, retrying next sweep: {}",
                        hashes.len(),
                        self.side,
                        e
                    );
                    continue;
                }
            };

            for (&(nonce, hash), result) in chunk.iter().zip(results) {
                let receipt = match result {
                    Ok(receipt) => receipt,
                    Err(e) => {
                        debug!("Batch lookup of {:?} failed, retrying singly: {}", hash, e);
                        match self.endpoint.receipt(hash).await {
                            Ok(receipt) => receipt,
                            Err(e) => {
                                warn!("Receipt lookup of {:?} on {} failed: {}", hash, self.side, e);
                                continue;
                            }
                        }
                    }
                };

                self.notify(nonce, hash, classify(receipt)).await;
            }
        }
    }

    /// Deliver `outcome` to every watcher of `(nonce, hash)` and forget it
    async fn notify(&self, nonce: u64, hash: H256, outcome: TxOutcome) {
        let sinks = {
            let mut state = self.state.lock().await;
            let Some(hashes) = state.waiters.get_mut(&nonce) else {
                return;
            };
            let sinks = hashes.remove(&hash);
            if hashes.is_empty() {
                state.waiters.remove(&nonce);
            }
            match sinks {
                Some(sinks) => sinks,
                None => return,
            }
        };

        match &outcome {
            TxOutcome::Confirmed(_) => {
                debug!("Transaction {:?} (nonce {}) confirmed on {}", hash, nonce, self.side)
            }
            other => warn!(
                "Transaction {:?} (nonce {}) on {} resolved as {}",
                hash,
                nonce,
                self.side,
                other.kind()
            ),
        }
        crate::metrics::record_tx_outcome(self.side, outcome.kind());

        if let Some(status) = outcome.status() {
            if let Err(e) = self.saver.update(hash, &status).await {
                warn!("Failed to record status of {:?}: {}", hash, e);
            }
        }

        for sink in sinks {
            // Receiver may have given up waiting.
            let _ = sink.send(outcome.clone());
        }
    }

    /// Resolve every remaining watcher with `MonitorClosed`
    async fn close(&self) {
        let drained = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        self.closed.cancel();

        let mut count = 0;
        for sink in drained.into_values().flat_map(|hashes| hashes.into_values()).flatten() {
            let _ = sink.send(TxOutcome::MonitorClosed);
            count += 1;
        }

        info!("Monitor for {} closed, released {} watchers", self.side, count);
    }
}
