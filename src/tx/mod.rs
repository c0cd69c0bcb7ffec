//! Transaction submission: nonce ordering, confirmation tracking and fee bumping

mod canceller;
mod gas;
mod monitor;
mod sender;
mod transactor;

pub use canceller::Canceller;
pub use gas::GasEstimator;
pub use monitor::{Monitor, TxOutcome};
pub use sender::{SubmissionHook, TransactionSender};
pub use transactor::{load_wallet, CallRequest, NonceGate, NonceToken, SentTransaction, Transactor};
