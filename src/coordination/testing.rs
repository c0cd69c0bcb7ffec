//! Gateway wiring over a `FakeChain` and an in-memory store

use super::gateway::Gateway;
use crate::chain::testing::FakeChain;
use crate::chain::ChainEndpoint;
use crate::config::RelayerConfig;
use crate::events::{ChainSide, EventParser, TransferEvent};
use crate::state::MemoryStore;
use crate::tx::{Monitor, TransactionSender, Transactor};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const RELAY_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const L1_GATEWAY: &str = "0x00000000000000000000000000000000000000aa";
pub const SETTLEMENT_GATEWAY: &str = "0x00000000000000000000000000000000000000bb";

pub fn gateway_address(side: ChainSide) -> &'static str {
    match side {
        ChainSide::L1 => L1_GATEWAY,
        ChainSide::Settlement => SETTLEMENT_GATEWAY,
    }
}

pub fn recipient() -> Address {
    Address::repeat_byte(0x22)
}

pub fn transfer(source: ChainSide, index: u64, amount: u64) -> TransferEvent {
    TransferEvent {
        sender: Address::repeat_byte(0x51),
        recipient: recipient(),
        amount: U256::from(amount),
        transfer_index: U256::from(index),
        source_chain: source,
        block_number: 10,
        log_index: 0,
        tx_hash: H256::repeat_byte(0xee),
    }
}

/// Gateway finalizing on `dest`, with its monitor already running
pub async fn gateway(
    dest: ChainSide,
    chain: Arc<FakeChain>,
    store: Arc<MemoryStore>,
    config: &RelayerConfig,
    cancel: &CancellationToken,
) -> (Gateway, JoinHandle<()>) {
    let endpoint: Arc<dyn ChainEndpoint> = chain;
    let wallet: LocalWallet = RELAY_KEY.parse().unwrap();

    let monitor = Monitor::new(dest, endpoint.clone(), wallet.address(), store.clone(), config)
        .await
        .unwrap();
    let monitor_task = monitor.start(cancel.child_token());

    let transactor = Arc::new(Transactor::new(
        dest,
        endpoint.clone(),
        wallet,
        monitor.clone(),
        config.send_retries,
    ));
    let sender = TransactionSender::new(dest, endpoint, monitor, config);

    let gateway = Gateway::new(
        dest,
        EventParser::new(dest, gateway_address(dest)).unwrap(),
        transactor,
        sender,
        store,
        16,
        200_000,
        config.resubmit_failed,
    );

    (gateway, monitor_task)
}
