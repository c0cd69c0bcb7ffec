//! Finality-aware event listener
//!
//! Polls one gateway contract for `TransferInitiated` logs. Only blocks at or
//! below `head - finality_depth` are read, and every query spans at most
//! `max_block_range` blocks. Events are pushed into a bounded queue, so a
//! slow consumer stalls scanning instead of growing memory.

use super::finality::safe_height;
use super::ChainEndpoint;
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{topics, EventParser, TransferEvent};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Item delivered to the consumer, in chain order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerUpdate {
    Transfer(TransferEvent),
    /// Every transfer up to and including this block has been delivered
    Scanned { through_block: u64 },
}

/// Scans one side of the bridge for initiated transfers
pub struct EventListener {
    endpoint: Arc<dyn ChainEndpoint>,
    parser: EventParser,
    finality_depth: u64,
    poll_interval: Duration,
    max_block_range: u64,
    queue_capacity: usize,
    scan_retries: u32,
    retry_base_delay: Duration,
}

impl EventListener {
    pub fn new(
        endpoint: Arc<dyn ChainEndpoint>,
        parser: EventParser,
        finality_depth: u64,
        config: &RelayerConfig,
    ) -> Self {
        Self {
            endpoint,
            parser,
            finality_depth,
            poll_interval: config.listener_poll_interval(),
            max_block_range: config.max_block_range.max(1),
            queue_capacity: config.event_queue_capacity.max(1),
            scan_retries: config.scan_retries,
            retry_base_delay: Duration::from_millis(config.scan_retry_base_delay_ms),
        }
    }

    /// Start scanning at `resume_from_block`. The task ends when `cancel`
    /// fires or the receiver is dropped.
    pub fn start(
        self,
        resume_from_block: u64,
        cancel: CancellationToken,
    ) -> (JoinHandle<()>, mpsc::Receiver<ListenerUpdate>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = tokio::spawn(async move { self.run(resume_from_block, tx, cancel).await });
        (handle, rx)
    }

    async fn run(
        self,
        resume_from_block: u64,
        tx: mpsc::Sender<ListenerUpdate>,
        cancel: CancellationToken,
    ) {
        let side = self.parser.side();
        let mut next_block = resume_from_block;
        // First tick fires immediately, which doubles as the catch-up pass.
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Listener for {} starting at block {}", side, next_block);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let current = match self.endpoint.current_height().await {
                Ok(h) => h,
                Err(e) => {
                    warn!("Listener for {} could not read chain height: {}", side, e);
                    continue;
                }
            };

            let safe = safe_height(current, self.finality_depth);
            if next_block > safe {
                continue;
            }

            for (from, to) in block_ranges(next_block, safe, self.max_block_range) {
                let events = match self.scan_chunk_with_retry(from, to, &cancel).await {
                    Ok(events) => events,
                    Err(RelayerError::Cancelled) => return,
                    Err(e) => {
                        error!(
                            "Listener for {} failed on blocks {}..={} after {} retries, rescanning from genesis: {}",
                            side, from, to, self.scan_retries, e
                        );
                        crate::metrics::record_listener_rescan(side);
                        next_block = 0;
                        break;
                    }
                };

                if !events.is_empty() {
                    debug!("Chain {}: {} transfers in blocks {}..={}", side, events.len(), from, to);
                }

                for event in events {
                    if !emit(&tx, ListenerUpdate::Transfer(event), &cancel).await {
                        return;
                    }
                }
                if !emit(&tx, ListenerUpdate::Scanned { through_block: to }, &cancel).await {
                    return;
                }

                crate::metrics::record_blocks_scanned(side, to);
                next_block = to + 1;
            }
        }

        info!("Listener for {} stopped", side);
    }

    /// Scan `[from, to]` in capped chunks and concatenate the results in order
    pub async fn scan(&self, from: u64, to: u64) -> RelayerResult<Vec<TransferEvent>> {
        let mut all = Vec::new();
        for (start, end) in block_ranges(from, to, self.max_block_range) {
            all.extend(self.scan_chunk(start, end).await?);
        }
        Ok(all)
    }

    async fn scan_chunk(&self, from: u64, to: u64) -> RelayerResult<Vec<TransferEvent>> {
        let raw = self
            .endpoint
            .filter_events(
                self.parser.contract_address(),
                *topics::TRANSFER_INITIATED,
                from,
                to,
            )
            .await?;

        let mut events: Vec<TransferEvent> = raw
            .iter()
            .filter_map(|log| match self.parser.parse_transfer_initiated(log) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Skipping malformed log on {}: {}", self.parser.side(), e);
                    None
                }
            })
            .collect();

        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    /// Retry the same range with exponential backoff before giving up
    async fn scan_chunk_with_retry(
        &self,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> RelayerResult<Vec<TransferEvent>> {
        let mut attempt = 0u32;
        loop {
            match self.scan_chunk(from, to).await {
                Ok(events) => return Ok(events),
                Err(e) if attempt >= self.scan_retries || !e.is_retryable() => return Err(e),
                Err(e) => {
                    let delay = backoff_delay(self.retry_base_delay, attempt);
                    attempt += 1;
                    warn!(
                        "Scan of {} blocks {}..={} failed (attempt {}), retrying in {:?}: {}",
                        self.parser.side(),
                        from,
                        to,
                        attempt,
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RelayerError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

async fn emit(
    tx: &mpsc::Sender<ListenerUpdate>,
    update: ListenerUpdate,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(update) => sent.is_ok(),
    }
}

/// `base * 2^attempt`, capped at one minute
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(MAX_RETRY_DELAY)
}

/// Split `[from, to]` into ranges ending on multiples of `max_range`
pub fn block_ranges(from: u64, to: u64, max_range: u64) -> Vec<(u64, u64)> {
    let max_range = max_range.max(1);
    let mut ranges = Vec::new();
    let mut start = from;

    while start <= to {
        let end = std::cmp::min(to, (start / max_range + 1).saturating_mul(max_range));
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainEndpoint, RawEvent};
    use crate::events::ChainSide;
    use ethers::types::{Address, Bytes, H256, U256};
    use std::sync::Mutex;

    const CONTRACT: &str = "0x00000000000000000000000000000000000000aa";

    fn initiated_at(block: u64) -> RawEvent {
        let mut amount = [0u8; 32];
        U256::from(1_000u64).to_big_endian(&mut amount);
        RawEvent {
            topics: vec![
                *topics::TRANSFER_INITIATED,
                H256::from(Address::repeat_byte(1)),
                H256::from(Address::repeat_byte(2)),
                H256::from_low_u64_be(block),
            ],
            data: Bytes::from(amount.to_vec()),
            block_number: block,
            log_index: 0,
            tx_hash: H256::from_low_u64_be(block),
        }
    }

    fn listener(mock: MockChainEndpoint, depth: u64) -> EventListener {
        let config = RelayerConfig {
            listener_poll_interval_ms: 10,
            scan_retries: 2,
            scan_retry_base_delay_ms: 1,
            ..Default::default()
        };
        EventListener::new(
            Arc::new(mock),
            EventParser::new(ChainSide::L1, CONTRACT).unwrap(),
            depth,
            &config,
        )
    }

    #[test]
    fn test_block_ranges_are_capped() {
        assert_eq!(
            block_ranges(0, 100_000, 40_000),
            vec![(0, 40_000), (40_001, 80_000), (80_001, 100_000)]
        );
        assert_eq!(block_ranges(5, 5, 40_000), vec![(5, 5)]);
        assert!(block_ranges(6, 5, 40_000).is_empty());
    }

    #[tokio::test]
    async fn test_chunked_scan_is_ordered_union() {
        let mut mock = MockChainEndpoint::new();
        mock.expect_filter_events()
            .times(3)
            .returning(|_, _, from, to| Ok(vec![initiated_at(to), initiated_at(from)]));

        let events = listener(mock, 0).scan(0, 100_000).await.unwrap();
        let blocks: Vec<u64> = events.iter().map(|e| e.block_number).collect();
        assert_eq!(blocks, vec![0, 40_000, 40_001, 80_000, 80_001, 100_000]);
    }

    #[tokio::test]
    async fn test_never_reads_above_safe_height() {
        let mut mock = MockChainEndpoint::new();
        mock.expect_current_height().returning(|| Ok(1_000));
        mock.expect_filter_events()
            .withf(|_, _, _, to| *to <= 936)
            .returning(|_, _, from, _| Ok(vec![initiated_at(from)]));

        let cancel = CancellationToken::new();
        let (handle, mut rx) = listener(mock, 64).start(900, cancel.clone());

        assert!(matches!(rx.recv().await, Some(ListenerUpdate::Transfer(e)) if e.block_number == 900));
        assert_eq!(
            rx.recv().await,
            Some(ListenerUpdate::Scanned { through_block: 936 })
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_young_chain_clamps_to_genesis() {
        let mut mock = MockChainEndpoint::new();
        mock.expect_current_height().returning(|| Ok(10));
        mock.expect_filter_events()
            .withf(|_, _, from, to| *from == 0 && *to == 0)
            .returning(|_, _, _, _| Ok(vec![]));

        let cancel = CancellationToken::new();
        let (handle, mut rx) = listener(mock, 64).start(0, cancel.clone());
        assert_eq!(
            rx.recv().await,
            Some(ListenerUpdate::Scanned { through_block: 0 })
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_retries_same_range() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();

        let mut mock = MockChainEndpoint::new();
        mock.expect_current_height().returning(|| Ok(700));
        mock.expect_filter_events().returning(move |_, _, from, to| {
            let mut calls = recorded.lock().unwrap();
            calls.push((from, to));
            if calls.len() < 3 {
                Err(RelayerError::ChainConnection {
                    chain_id: 1,
                    message: "connection reset".into(),
                })
            } else {
                Ok(vec![initiated_at(from)])
            }
        });

        let cancel = CancellationToken::new();
        let (handle, mut rx) = listener(mock, 0).start(500, cancel.clone());
        assert!(matches!(rx.recv().await, Some(ListenerUpdate::Transfer(e)) if e.block_number == 500));
        cancel.cancel();
        handle.await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(&calls[..3], &[(500, 700), (500, 700), (500, 700)]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_rescan_from_genesis() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();

        let mut mock = MockChainEndpoint::new();
        mock.expect_current_height().returning(|| Ok(700));
        mock.expect_filter_events().returning(move |_, _, from, to| {
            let mut calls = recorded.lock().unwrap();
            calls.push((from, to));
            // Initial attempt plus two retries fail.
            if calls.len() <= 3 {
                Err(RelayerError::Timeout {
                    operation: "get logs".into(),
                })
            } else {
                Ok(vec![])
            }
        });

        let cancel = CancellationToken::new();
        let (handle, mut rx) = listener(mock, 0).start(500, cancel.clone());
        assert_eq!(
            rx.recv().await,
            Some(ListenerUpdate::Scanned { through_block: 700 })
        );
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(calls.lock().unwrap()[3], (0, 700));
    }
}
