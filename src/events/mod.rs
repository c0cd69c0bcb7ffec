//! Bridge contract event types and parsing
//!
//! Both sides of the bridge run the same gateway contract:
//!
//! ```text
//! event TransferInitiated(address indexed sender, address indexed recipient, uint256 amount, uint256 indexed transferIdx)
//! event TransferFinalized(address indexed recipient, uint256 amount, uint256 indexed counterpartyIdx)
//! function finalizeTransfer(address _recipient, uint256 _amount, uint256 _counterpartyIdx)
//! ```

use crate::chain::RawEvent;
use crate::error::{RelayerError, RelayerResult};

use ethers::abi::{self, Token};
use ethers::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One side of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSide {
    L1,
    Settlement,
}

impl ChainSide {
    /// The chain that finalizes transfers initiated on this one
    pub fn counterparty(self) -> Self {
        match self {
            ChainSide::L1 => ChainSide::Settlement,
            ChainSide::Settlement => ChainSide::L1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChainSide::L1 => "l1",
            ChainSide::Settlement => "settlement",
        }
    }
}

impl fmt::Display for ChainSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainSide {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l1" => Ok(ChainSide::L1),
            "settlement" => Ok(ChainSide::Settlement),
            other => Err(RelayerError::Config(format!("Unknown chain side: {}", other))),
        }
    }
}

/// A deposit observed on the source chain, identified by
/// `(source_chain, transfer_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    /// Strictly increasing per source chain
    pub transfer_index: U256,
    pub source_chain: ChainSide,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: H256,
}

/// Result of a confirmed `finalizeTransfer` on the destination chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationRecord {
    pub recipient: Address,
    pub amount: U256,
    /// Originating transfer index; the idempotency key
    pub counterparty_index: U256,
    pub dest_chain: ChainSide,
    pub tx_hash: H256,
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use ethers::types::H256;
    use ethers::utils::keccak256;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref TRANSFER_INITIATED: H256 = H256::from(keccak256(
            "TransferInitiated(address,address,uint256,uint256)"
        ));
        pub static ref TRANSFER_FINALIZED: H256 =
            H256::from(keccak256("TransferFinalized(address,uint256,uint256)"));
    }
}

/// Decodes gateway logs for one side of the bridge
#[derive(Debug, Clone)]
pub struct EventParser {
    side: ChainSide,
    contract_address: Address,
}

impl EventParser {
    pub fn new(side: ChainSide, contract_address: &str) -> RelayerResult<Self> {
        let address = Address::from_str(contract_address)
            .map_err(|e| RelayerError::Config(format!("Invalid address: {}", e)))?;

        Ok(Self {
            side,
            contract_address: address,
        })
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    pub fn side(&self) -> ChainSide {
        self.side
    }

    /// Parse a `TransferInitiated` log
    pub fn parse_transfer_initiated(&self, event: &RawEvent) -> RelayerResult<TransferEvent> {
        if event.topics.first() != Some(&*topics::TRANSFER_INITIATED) {
            return Err(RelayerError::EventParsing(format!(
                "Unexpected topic in log {:?}/{}",
                event.tx_hash, event.log_index
            )));
        }
        if event.topics.len() != 4 {
            return Err(RelayerError::EventParsing(format!(
                "TransferInitiated has {} topics, expected 4",
                event.topics.len()
            )));
        }

        Ok(TransferEvent {
            sender: topic_address(&event.topics[1]),
            recipient: topic_address(&event.topics[2]),
            amount: word(&event.data, 0)?,
            transfer_index: U256::from_big_endian(event.topics[3].as_bytes()),
            source_chain: self.side,
            block_number: event.block_number,
            log_index: event.log_index,
            tx_hash: event.tx_hash,
        })
    }

    /// Find the `TransferFinalized` log emitted by this contract in a receipt
    pub fn parse_finalized(&self, receipt: &TransactionReceipt) -> Option<FinalizationRecord> {
        receipt
            .logs
            .iter()
            .filter(|log| log.address == self.contract_address)
            .find(|log| {
                log.topics.len() == 3 && log.topics[0] == *topics::TRANSFER_FINALIZED
            })
            .and_then(|log| {
                let amount = word(&log.data, 0).ok()?;
                Some(FinalizationRecord {
                    recipient: topic_address(&log.topics[1]),
                    amount,
                    counterparty_index: U256::from_big_endian(log.topics[2].as_bytes()),
                    dest_chain: self.side,
                    tx_hash: receipt.transaction_hash,
                })
            })
    }
}

/// Calldata for `finalizeTransfer(address,uint256,uint256)`
pub fn encode_finalize_call(recipient: Address, amount: U256, counterparty_index: U256) -> Bytes {
    let selector = ethers::utils::id("finalizeTransfer(address,uint256,uint256)");
    let mut data = selector.to_vec();
    data.extend(abi::encode(&[
        Token::Address(recipient),
        Token::Uint(amount),
        Token::Uint(counterparty_index),
    ]));
    data.into()
}

fn topic_address(topic: &H256) -> Address {
    Address::from_slice(&topic.as_bytes()[12..32])
}

fn word(data: &[u8], index: usize) -> RelayerResult<U256> {
    let start = index * 32;
    data.get(start..start + 32)
        .map(U256::from_big_endian)
        .ok_or_else(|| RelayerError::EventParsing(format!("Log data too short: {} bytes", data.len())))
}
