//! Finality offsets for different L1/L2 networks
//!
//! Events are only read from blocks at least `depth` blocks below the head,
//! so a reorganisation shallower than that never invalidates a relayed transfer:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum / Optimism / Base: sequencer soft finality
//! - Avalanche: Instant finality (1 block)

/// Highest block considered final. Clamps to 0 on a chain younger than `depth`.
pub fn safe_height(current_height: u64, depth: u64) -> u64 {
    current_height.saturating_sub(depth)
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 17000 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}
