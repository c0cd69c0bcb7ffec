//! Error types for the bridge relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    /// Node rejected a submitted transaction. Carries the RPC message verbatim
    /// so nonce races can be recognised.
    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    /// Receipt lookup found nothing below the confirmed nonce: another
    /// transaction took the nonce.
    #[error("Transaction {tx_hash} was cancelled (nonce reused)")]
    TransactionCancelled { tx_hash: String },

    #[error("Transaction {tx_hash} reverted: {reason}")]
    TransactionFailed { tx_hash: String, reason: String },

    #[error("Transaction monitor closed")]
    MonitorClosed,

    #[error("Gave up after {attempts} submission attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Insufficient balance on chain {chain_id}")]
    InsufficientBalance { chain_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. } | RelayerError::Timeout { .. }
        ) || self.is_nonce_race()
    }

    /// Submission was rejected because a transaction with the same nonce is
    /// already in the pool.
    pub fn is_nonce_race(&self) -> bool {
        match self {
            RelayerError::Transaction(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("replacement transaction underpriced")
                    || msg.contains("already known")
            }
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientBalance { .. }
                | RelayerError::RetriesExhausted { .. }
                | RelayerError::Wallet(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_race_classification() {
        let underpriced = RelayerError::Transaction(
            "(code: -32000, message: replacement transaction underpriced, data: None)".into(),
        );
        assert!(underpriced.is_nonce_race());
        assert!(underpriced.is_retryable());

        assert!(RelayerError::Transaction("already known".into()).is_nonce_race());
        assert!(!RelayerError::Transaction("nonce too low".into()).is_nonce_race());
        assert!(!RelayerError::MonitorClosed.is_nonce_race());
    }

    #[test]
    fn test_terminal_outcomes_are_not_retryable() {
        let cancelled = RelayerError::TransactionCancelled {
            tx_hash: "0x01".into(),
        };
        assert!(!cancelled.is_retryable());
        assert!(RelayerError::RetriesExhausted { attempts: 10 }.should_alert());
    }
}
