//! Relay engine: two independent legs, one per bridge direction

use super::gateway::{FinalizeOutcome, Gateway};
use crate::chain::listener::backoff_delay;
use crate::chain::{EventListener, ListenerUpdate};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{ChainSide, TransferEvent};
use crate::state::CursorStore;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Moves transfers initiated on `source` to the gateway on the other side
pub struct RelayLeg {
    source: ChainSide,
    listener: EventListener,
    gateway: Arc<Gateway>,
    cursor: Arc<dyn CursorStore>,
}

impl RelayLeg {
    pub fn new(
        listener: EventListener,
        gateway: Arc<Gateway>,
        cursor: Arc<dyn CursorStore>,
    ) -> Self {
        Self {
            source: gateway.side().counterparty(),
            listener,
            gateway,
            cursor,
        }
    }

    /// Run until `cancel` fires. Transfers are handled one at a time, in
    /// chain order; the cursor only moves past blocks whose transfers have
    /// all been handled.
    pub async fn run(self, cancel: CancellationToken) -> RelayerResult<()> {
        let RelayLeg {
            source,
            listener,
            gateway,
            cursor,
        } = self;
        let dest = gateway.side();

        let mut persisted = cursor.last_block().await?;
        let resume_from = persisted.map_or(0, |b| b + 1);

        info!(
            "Relay leg {} -> {} resuming at block {}",
            source, dest, resume_from
        );

        let (listener, mut updates) = listener.start(resume_from, cancel.child_token());

        loop {
            let update = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };

            match update {
                ListenerUpdate::Transfer(event) => {
                    // Nothing after an interrupted transfer may reach the cursor
                    if !relay_transfer(source, &gateway, &event, &cancel).await {
                        break;
                    }
                }
                ListenerUpdate::Scanned { through_block } => {
                    if persisted.map_or(true, |p| through_block > p) {
                        match cursor.set_last_block(through_block).await {
                            Ok(()) => persisted = Some(through_block),
                            Err(e) => warn!("Failed to save {} cursor: {}", source, e),
                        }
                    }
                }
            }
        }

        drop(updates);
        if let Err(e) = listener.await {
            error!("Listener for {} panicked: {}", source, e);
        }

        info!("Relay leg {} -> {} stopped", source, dest);
        Ok(())
    }
}

/// Finalize one transfer, retrying until it is dealt with.
///
/// Returns false only when shutdown interrupted it. A failure that left no
/// settlement record is retried with backoff, since nothing else would ever
/// pick the transfer up again. A failure of a broadcast attempt is final and
/// left to the operator.
async fn relay_transfer(
    source: ChainSide,
    gateway: &Gateway,
    event: &TransferEvent,
    cancel: &CancellationToken,
) -> bool {
    let dest = gateway.side();
    crate::metrics::record_transfer_initiated(source, event.amount);

    debug!(
        "Transfer {} from {}: {} to {:?}",
        event.transfer_index, source, event.amount, event.recipient
    );

    let mut attempt = 0;
    loop {
        let e = match gateway.finalize_transfer(event, cancel).await {
            Ok(FinalizeOutcome::Settled(_)) => {
                crate::metrics::record_transfer_finalized(dest, event.amount);
                return true;
            }
            Ok(FinalizeOutcome::AlreadySettled) => return true,
            Err(RelayerError::Cancelled | RelayerError::MonitorClosed) => return false,
            Err(e) => e,
        };

        let recorded = match gateway.has_attempt(event.transfer_index).await {
            Ok(recorded) => recorded,
            Err(lookup) => {
                warn!(
                    "Settlement record lookup for transfer {} failed: {}",
                    event.transfer_index, lookup
                );
                false
            }
        };

        if recorded && !e.is_retryable() {
            error!(
                "Finalization on {} failed for transfer {} (recipient {:?}, amount {}): {}",
                dest, event.transfer_index, event.recipient, event.amount, e
            );
            crate::metrics::record_finalization_failed(dest, event.amount, e.should_alert());
            return true;
        }

        let delay = backoff_delay(RETRY_BASE_DELAY, attempt);
        attempt += 1;
        warn!(
            "Finalization on {} of transfer {} failed (attempt {}), retrying in {:?}: {}",
            dest, event.transfer_index, attempt, delay, e
        );
        if e.should_alert() {
            crate::metrics::record_finalization_failed(dest, event.amount, true);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Runs both relay legs until cancelled
pub struct RelayEngine {
    legs: Vec<RelayLeg>,
}

impl RelayEngine {
    pub fn new(legs: Vec<RelayLeg>) -> Self {
        Self { legs }
    }

    /// Returns the first leg error, after cancelling the other legs
    pub async fn run(self, cancel: CancellationToken) -> RelayerResult<()> {
        let mut set = JoinSet::new();
        for leg in self.legs {
            set.spawn(leg.run(cancel.clone()));
        }

        info!("Relay engine started");

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(RelayerError::Internal(format!("Relay leg panicked: {}", e))),
            };
            if let Err(e) = result {
                error!("Relay leg failed: {}", e);
                cancel.cancel();
                first_error.get_or_insert(e);
            }
        }

        info!("Relay engine stopped");
        first_error.map_or(Ok(()), Err)
    }
}
