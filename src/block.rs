//! --- LogiChain Blocks ---
//!
//! A block's `hash` is SHA-256 over the canonical encoding of every other
//! field. The proof-of-work target is expressed as a number of leading zero
//! hex nibbles in that hash.

use crate::canonical;
use crate::transaction::{Transaction, TransactionError, ZERO_ADDRESS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// `previous_hash` of the block at height 0.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
/// Fixed so that every node derives the same genesis hash.
pub const GENESIS_TIMESTAMP: u64 = 1_704_067_200_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
}

impl From<serde_json::Error> for BlockError {
    fn from(err: serde_json::Error) -> Self {
        BlockError::Serialization(err.to_string())
    }
}

/// Everything needed to assemble an unsealed block.
#[derive(Debug, Clone)]
pub struct BlockCreationData {
    pub index: u64,
    pub timestamp: u64,
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    pub difficulty: u32,
    pub miner_address: String,
    pub mining_reward: u64,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    pub nonce: u64,
    pub difficulty: u32,
    pub miner_address: String,
    pub mining_reward: u64,
    pub hash: String,
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let border = "═".repeat(72);
        writeln!(f, "╔{border}╗")?;
        writeln!(f, "║ Block #{}", self.index)?;
        writeln!(f, "╟{border}╢")?;
        writeln!(f, "║ Hash:          {}", self.hash)?;
        writeln!(f, "║ Previous:      {}", self.previous_hash)?;
        writeln!(f, "║ Timestamp:     {}", self.timestamp)?;
        writeln!(f, "║ Transactions:  {}", self.transactions.len())?;
        writeln!(f, "║ Miner:         {}", self.miner_address)?;
        writeln!(f, "║ Nonce:         {}", self.nonce)?;
        writeln!(f, "║ Difficulty:    {}", self.difficulty)?;
        writeln!(f, "║ Reward:        {}", self.mining_reward)?;
        write!(f, "╚{border}╝")
    }
}

impl Block {
    /// Assembles a block with nonce 0 and computes its hash.
    pub fn new(data: BlockCreationData) -> Result<Self, BlockError> {
        let mut block = Self {
            index: data.index,
            timestamp: data.timestamp,
            previous_hash: data.previous_hash,
            transactions: data.transactions,
            nonce: 0,
            difficulty: data.difficulty,
            miner_address: data.miner_address,
            mining_reward: data.mining_reward,
            hash: String::new(),
        };
        block.seal()?;
        Ok(block)
    }

    /// The height-0 block. Only `difficulty` is configurable.
    pub fn genesis(difficulty: u32) -> Result<Self, BlockError> {
        Self::new(BlockCreationData {
            index: 0,
            timestamp: GENESIS_TIMESTAMP,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            transactions: vec![Transaction::genesis_marker(GENESIS_TIMESTAMP)?],
            difficulty,
            miner_address: ZERO_ADDRESS.to_string(),
            mining_reward: 0,
        })
    }

    fn header_map(&self) -> Result<Map<String, Value>, BlockError> {
        match serde_json::to_value(self)? {
            Value::Object(mut map) => {
                map.remove("hash");
                Ok(map)
            }
            _ => Err(BlockError::Serialization(
                "block did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn compute_hash(&self) -> Result<String, BlockError> {
        let map = self.header_map()?;
        let mut out = Vec::with_capacity(512);
        canonical::write_value(&Value::Object(map), &mut out)?;
        Ok(hex::encode(Sha256::digest(&out)))
    }

    /// Recomputes and stores `hash`.
    pub fn seal(&mut self) -> Result<(), BlockError> {
        self.hash = self.compute_hash()?;
        Ok(())
    }

    pub fn has_valid_hash(&self) -> bool {
        self.compute_hash().map(|h| h == self.hash).unwrap_or(false)
    }

    pub fn meets_target(&self) -> bool {
        hex_leading_zeros(&self.hash) >= self.difficulty
    }

    /// Pre-hashes everything that precedes the nonce in the canonical
    /// encoding so the search loop only hashes the nonce and the tail.
    pub fn hash_template(&self) -> Result<HashTemplate, BlockError> {
        let map = self.header_map()?;
        let mut keys: Vec<&String> = map.keys().filter(|k| k.as_str() != "nonce").collect();
        keys.sort();

        let mut prefix = vec![b'{'];
        let mut suffix = Vec::with_capacity(512);
        let mut wrote_before = false;
        for key in keys {
            if key.as_str() < "nonce" {
                if wrote_before {
                    prefix.push(b',');
                }
                canonical::write_entry(key, &map[key.as_str()], &mut prefix)?;
                wrote_before = true;
            } else {
                suffix.push(b',');
                canonical::write_entry(key, &map[key.as_str()], &mut suffix)?;
            }
        }
        if wrote_before {
            prefix.push(b',');
        }
        prefix.extend_from_slice(b"\"nonce\":");
        suffix.push(b'}');

        let mut base = Sha256::new();
        base.update(&prefix);
        Ok(HashTemplate { base, suffix })
    }

    pub fn reward_transaction(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_reward())
    }

    pub fn transaction_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.hash.clone()).collect()
    }

    /// Sum of fees carried by the non-reward transactions.
    pub fn total_fees(&self) -> u64 {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_reward())
            .fold(0u64, |acc, tx| acc.saturating_add(tx.fee))
    }
}

/// Incremental hasher for a fixed block body with a variable nonce.
#[derive(Clone)]
pub struct HashTemplate {
    base: Sha256,
    suffix: Vec<u8>,
}

impl HashTemplate {
    pub fn digest(&self, nonce: u64) -> [u8; 32] {
        let mut hasher = self.base.clone();
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(&self.suffix);
        hasher.finalize().into()
    }
}

/// Leading zero nibbles of a raw digest.
pub fn leading_zero_nibbles(digest: &[u8]) -> u32 {
    let mut count = 0;
    for byte in digest {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

/// Leading `'0'` characters of a hex-encoded hash.
pub fn hex_leading_zeros(hash: &str) -> u32 {
    hash.bytes().take_while(|b| *b == b'0').count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let miner = "ab".repeat(32);
        Block::new(BlockCreationData {
            index: 1,
            timestamp: GENESIS_TIMESTAMP + 60_000,
            previous_hash: Block::genesis(2).unwrap().hash,
            transactions: vec![Transaction::new_reward(&miner, 5_000, 1, 0).unwrap()],
            difficulty: 2,
            miner_address: miner,
            mining_reward: 5_000,
        })
        .unwrap()
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = Block::genesis(3).unwrap();
        let b = Block::genesis(3).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.index, 0);
        assert_eq!(a.previous_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(a.transactions.len(), 1);
        assert!(a.has_valid_hash());
    }

    #[test]
    fn test_hash_template_matches_full_hash() {
        let mut block = sample_block();
        let template = block.hash_template().unwrap();
        for nonce in [0u64, 1, 9, 10, 12_345, u64::MAX] {
            block.nonce = nonce;
            assert_eq!(
                hex::encode(template.digest(nonce)),
                block.compute_hash().unwrap(),
                "template digest diverged at nonce {nonce}"
            );
        }
    }

    #[test]
    fn test_any_field_change_invalidates_hash() {
        let mut block = sample_block();
        assert!(block.has_valid_hash());
        block.mining_reward += 1;
        assert!(!block.has_valid_hash());
    }

    #[test]
    fn test_leading_zero_counting() {
        assert_eq!(leading_zero_nibbles(&[0x00, 0x0f, 0xff]), 3);
        assert_eq!(leading_zero_nibbles(&[0x10]), 0);
        assert_eq!(leading_zero_nibbles(&[0x00, 0x00]), 4);
        assert_eq!(hex_leading_zeros("000a1"), 3);
        assert_eq!(
            leading_zero_nibbles(&hex::decode("000f").unwrap()),
            hex_leading_zeros("000f")
        );
    }
}
