//! Bridge Relayer - two-way token transfer relay between an L1 and a settlement chain
//!
//! The relayer watches the bridge contract on each chain for initiated
//! transfers and finalizes them on the counterparty chain exactly once.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod state;
pub mod tx;
