// The primary modules that define a LogiChain node and its behavior.
pub mod block;
pub mod canonical;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod mempool;
pub mod miner;
pub mod node;
pub mod p2p;
pub mod persistence;
pub mod transaction;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
