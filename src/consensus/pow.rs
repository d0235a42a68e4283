//! Proof-of-work validation and difficulty retargeting.

use super::{RejectReason, Verdict};
use crate::block::{hex_leading_zeros, Block};
use crate::chain::{ChainParams, ChainState};

/// A SHA-256 hex digest has 64 nibbles.
pub const MAX_DIFFICULTY: u32 = 64;

/// Difficulty required of the block that follows `tail`, where `tail` is the
/// most recent part of the chain ending at the tip.
///
/// At every height that is a multiple of the window (skipping the first
/// window, whose span would include the genesis timestamp) the mean spacing
/// of the last `window` blocks is compared with the target: faster raises the
/// difficulty by one, slower lowers it by one with a floor of one.
pub fn next_difficulty(params: &ChainParams, tail: &[Block]) -> u32 {
    let Some(tip) = tail.last() else {
        return params.initial_difficulty;
    };
    let window = params.adjustment_window.max(1);
    let next_height = tip.index + 1;
    if next_height % window != 0 || next_height <= window {
        return tip.difficulty;
    }
    let window_len = window as usize;
    if tail.len() < window_len + 1 {
        return tip.difficulty;
    }
    let anchor = &tail[tail.len() - 1 - window_len];
    let span = tip.timestamp.saturating_sub(anchor.timestamp);
    let target_span = params.target_block_time.saturating_mul(window);

    if span < target_span {
        (tip.difficulty + 1).min(MAX_DIFFICULTY)
    } else if span > target_span {
        tip.difficulty.saturating_sub(1).max(1)
    } else {
        tip.difficulty
    }
}

/// Difficulty for the next block on `chain`.
pub fn expected_difficulty(chain: &ChainState) -> u32 {
    let window = chain.params().adjustment_window.max(1) as usize;
    next_difficulty(chain.params(), &chain.recent(window + 1))
}

/// Stateless proof-of-work rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProofOfWork;

impl ProofOfWork {
    /// Checks hash integrity, the leading-zero target, the difficulty
    /// schedule and linkage to the current tip.
    pub fn validate(&self, block: &Block, chain: &ChainState) -> Verdict {
        if !block.has_valid_hash() {
            return Verdict::Reject(RejectReason::HashMismatch);
        }
        let tip = chain.tip_hash();
        if block.previous_hash != tip {
            return Verdict::Reject(RejectReason::Linkage {
                expected: tip,
                found: block.previous_hash.clone(),
            });
        }
        let expected = expected_difficulty(chain);
        if block.difficulty != expected {
            return Verdict::Reject(RejectReason::DifficultyMismatch {
                expected,
                found: block.difficulty,
            });
        }
        let found = hex_leading_zeros(&block.hash);
        if found < block.difficulty {
            return Verdict::Reject(RejectReason::InsufficientWork {
                required: block.difficulty,
                found,
            });
        }
        Verdict::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockCreationData;

    fn params() -> ChainParams {
        ChainParams {
            initial_difficulty: 3,
            target_block_time: 1_000,
            adjustment_window: 4,
            ..ChainParams::default()
        }
    }

    fn synthetic_chain(len: u64, spacing: u64, difficulty: u32) -> Vec<Block> {
        (0..len)
            .map(|i| {
                Block::new(BlockCreationData {
                    index: i,
                    timestamp: 1_000_000 + i * spacing,
                    previous_hash: String::new(),
                    transactions: vec![],
                    difficulty,
                    miner_address: String::new(),
                    mining_reward: 0,
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_no_adjustment_off_window() {
        let chain = synthetic_chain(6, 10, 3);
        assert_eq!(next_difficulty(&params(), &chain), 3);
    }

    #[test]
    fn test_first_window_is_skipped() {
        let chain = synthetic_chain(4, 10, 3);
        assert_eq!(next_difficulty(&params(), &chain), 3);
    }

    #[test]
    fn test_fast_window_raises_difficulty() {
        let chain = synthetic_chain(8, 500, 3);
        assert_eq!(next_difficulty(&params(), &chain), 4);
    }

    #[test]
    fn test_slow_window_lowers_difficulty_with_floor() {
        let chain = synthetic_chain(8, 5_000, 3);
        assert_eq!(next_difficulty(&params(), &chain), 2);

        let floor = synthetic_chain(8, 5_000, 1);
        assert_eq!(next_difficulty(&params(), &floor), 1);
    }

    #[test]
    fn test_on_target_window_is_unchanged() {
        let chain = synthetic_chain(8, 1_000, 3);
        assert_eq!(next_difficulty(&params(), &chain), 3);
    }

    #[test]
    fn test_genesis_tip_uses_its_difficulty() {
        assert_eq!(next_difficulty(&params(), &[]), 3);
        let chain = synthetic_chain(1, 0, 5);
        assert_eq!(next_difficulty(&params(), &chain), 5);
    }
}
