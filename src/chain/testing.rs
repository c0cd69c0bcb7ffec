//! Stateful in-memory chain for exercising the relay path end to end

use super::{ChainEndpoint, FeeParams, RawEvent};
use crate::error::{RelayerError, RelayerResult};
use crate::events::topics;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256, U64};
use ethers::utils::{keccak256, rlp::Rlp};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// A broadcast the chain accepted
#[derive(Debug, Clone)]
pub struct Submitted {
    pub hash: H256,
    pub nonce: u64,
    pub fees: FeeParams,
    pub to: Address,
    pub data: Bytes,
}

#[derive(Default)]
struct State {
    height: u64,
    confirmed_nonce: u64,
    mempool: BTreeMap<u64, Vec<Submitted>>,
    receipts: HashMap<H256, TransactionReceipt>,
    logs: Vec<RawEvent>,
    submitted: Vec<Submitted>,
    hold: usize,
    fee_failures: usize,
    revert: bool,
    fees: FeeParams,
}

/// Mines every broadcast immediately unless told to hold it
pub struct FakeChain {
    chain_id: u64,
    state: Mutex<State>,
}

impl FakeChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(State {
                fees: FeeParams {
                    max_priority_fee_per_gas: U256::from(2_000_000_000u64),
                    max_fee_per_gas: U256::from(30_000_000_000u64),
                },
                ..Default::default()
            }),
        }
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    /// Keep the next `n` broadcasts in the mempool
    pub fn hold_next(&self, n: usize) {
        self.state.lock().unwrap().hold = n;
    }

    /// Fail the next `n` fee suggestions with a connection error
    pub fn fail_fee_calls(&self, n: usize) {
        self.state.lock().unwrap().fee_failures = n;
    }

    /// Mine subsequent transactions with a failure status
    pub fn set_revert(&self, revert: bool) {
        self.state.lock().unwrap().revert = revert;
    }

    pub fn submissions(&self) -> Vec<Submitted> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn add_transfer(
        &self,
        block: u64,
        log_index: u64,
        recipient: Address,
        amount: U256,
        transfer_index: u64,
    ) {
        let mut data = [0u8; 32];
        amount.to_big_endian(&mut data);
        self.state.lock().unwrap().logs.push(RawEvent {
            topics: vec![
                *topics::TRANSFER_INITIATED,
                H256::from(Address::repeat_byte(0x51)),
                H256::from(recipient),
                H256::from_low_u64_be(transfer_index),
            ],
            data: Bytes::from(data.to_vec()),
            block_number: block,
            log_index,
            tx_hash: H256::from_low_u64_be(block * 1000 + log_index),
        });
    }

    /// Record a transaction mined by an earlier process
    pub fn insert_mined(&self, hash: H256, nonce: u64, success: bool) {
        let mut state = self.state.lock().unwrap();
        state.height += 1;
        state.confirmed_nonce = state.confirmed_nonce.max(nonce + 1);
        let receipt = TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(U64::from(state.height)),
            status: Some(U64::from(u64::from(success))),
            ..Default::default()
        };
        state.receipts.insert(hash, receipt);
    }

    fn mine(state: &mut State, tx: &Submitted) {
        state.height += 1;
        state.confirmed_nonce = state.confirmed_nonce.max(tx.nonce + 1);
        state.mempool.retain(|nonce, _| *nonce > tx.nonce);

        let mut logs = Vec::new();
        if !state.revert && tx.data.len() == 4 + 3 * 32 {
            // finalizeTransfer(recipient, amount, index) emits TransferFinalized
            logs.push(Log {
                address: tx.to,
                topics: vec![
                    *topics::TRANSFER_FINALIZED,
                    H256::from_slice(&tx.data[4..36]),
                    H256::from_slice(&tx.data[68..100]),
                ],
                data: Bytes::from(tx.data[36..68].to_vec()),
                ..Default::default()
            });
        }

        let receipt = TransactionReceipt {
            transaction_hash: tx.hash,
            block_number: Some(U64::from(state.height)),
            status: Some(U64::from(u64::from(!state.revert))),
            logs,
            ..Default::default()
        };
        state.receipts.insert(tx.hash, receipt);
    }
}

#[async_trait]
impl ChainEndpoint for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn current_height(&self) -> RelayerResult<u64> {
        Ok(self.state.lock().unwrap().height)
    }

    async fn account_nonce(&self, _account: Address, _at_height: u64) -> RelayerResult<u64> {
        Ok(self.state.lock().unwrap().confirmed_nonce)
    }

    async fn pending_nonce(&self, _account: Address) -> RelayerResult<u64> {
        let state = self.state.lock().unwrap();
        let queued = state.mempool.keys().next_back().map_or(0, |n| n + 1);
        Ok(state.confirmed_nonce.max(queued))
    }

    async fn filter_events(
        &self,
        _contract: Address,
        topic: H256,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<RawEvent>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|log| log.topics.first() == Some(&topic))
            .filter(|log| (from_block..=to_block).contains(&log.block_number))
            .cloned()
            .collect())
    }

    async fn suggest_fee_tip_and_cap(&self) -> RelayerResult<FeeParams> {
        let mut state = self.state.lock().unwrap();
        if state.fee_failures > 0 {
            state.fee_failures -= 1;
            return Err(RelayerError::ChainConnection {
                chain_id: self.chain_id,
                message: "connection refused".into(),
            });
        }
        Ok(state.fees)
    }

    async fn submit(&self, signed_tx: Bytes) -> RelayerResult<H256> {
        let (tx, _signature) = TypedTransaction::decode_signed(&Rlp::new(signed_tx.as_ref()))
            .map_err(|e| RelayerError::Transaction(e.to_string()))?;
        let TypedTransaction::Eip1559(request) = &tx else {
            return Err(RelayerError::Transaction("expected a type 2 transaction".into()));
        };

        let submitted = Submitted {
            hash: H256::from(keccak256(signed_tx.as_ref())),
            nonce: request.nonce.unwrap_or_default().as_u64(),
            fees: FeeParams {
                max_priority_fee_per_gas: request.max_priority_fee_per_gas.unwrap_or_default(),
                max_fee_per_gas: request.max_fee_per_gas.unwrap_or_default(),
            },
            to: tx.to_addr().copied().unwrap_or_default(),
            data: request.data.clone().unwrap_or_default(),
        };

        let mut state = self.state.lock().unwrap();
        if submitted.nonce < state.confirmed_nonce {
            return Err(RelayerError::Transaction("nonce too low".into()));
        }
        state.submitted.push(submitted.clone());

        if state.hold > 0 {
            state.hold -= 1;
            state
                .mempool
                .entry(submitted.nonce)
                .or_default()
                .push(submitted.clone());
        } else {
            Self::mine(&mut state, &submitted);
        }

        Ok(submitted.hash)
    }

    async fn receipt(&self, tx_hash: H256) -> RelayerResult<Option<TransactionReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).cloned())
    }

    async fn batch_receipts(
        &self,
        tx_hashes: &[H256],
    ) -> RelayerResult<Vec<RelayerResult<Option<TransactionReceipt>>>> {
        let state = self.state.lock().unwrap();
        Ok(tx_hashes
            .iter()
            .map(|hash| Ok(state.receipts.get(hash).cloned()))
            .collect())
    }
}
