//! Relay coordination between the two bridged chains
//!
//! Each direction runs as its own leg:
//! 1. The source chain's listener yields initiated transfers in order
//! 2. The destination gateway checks the settlement record
//! 3. Unsettled transfers are finalized through the retry wrapper and monitor
//! 4. The source cursor advances once the scanned range has been handled

pub mod engine;
pub mod gateway;
#[cfg(test)]
mod testing;

pub use engine::{RelayEngine, RelayLeg};
pub use gateway::{FinalizeOutcome, Gateway};
