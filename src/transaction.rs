// src/transaction.rs

//! --- LogiChain Transactions ---
//!
//! Account/nonce transfers. A transaction is authenticated by an ed25519
//! signature and its sender address *is* the hex encoding of the verifying
//! key, so no separate key registry is needed to check it. Transactions from
//! the zero address are block rewards and carry no signature.

use crate::canonical;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

/// Reserved sender of block rewards and of the genesis marker.
pub const ZERO_ADDRESS: &str = "0000000000000000000000000000000000000000000000000000000000000000";
/// Smallest units per whole coin (8 decimal places).
pub const UNITS_PER_COIN: u64 = 100_000_000;
const ADDRESS_HEX_LEN: usize = 64;
const GENESIS_PAYLOAD: &[u8] = b"genesis";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Invalid address format: '{0}'")]
    InvalidAddress(String),
    #[error("Hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch { stored: String, computed: String },
    #[error("Signature verification failed")]
    InvalidSignature,
    #[error("Insufficient balance for {address}: needs {needed}, has {available}")]
    InsufficientBalance {
        address: String,
        needed: u64,
        available: u64,
    },
    #[error("Nonce mismatch for {address}: expected {expected}, found {found}")]
    NonceMismatch {
        address: String,
        expected: u64,
        found: u64,
    },
    #[error("Reward transaction not allowed in this position")]
    UnexpectedReward,
    #[error("Amount overflow")]
    Overflow,
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for TransactionError {
    fn from(err: serde_json::Error) -> Self {
        TransactionError::Serialization(err.to_string())
    }
}

/// Parameters for a new signed transfer.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    pub to_address: String,
    pub amount: u64,
    pub nonce: u64,
    pub fee: u64,
    pub payload: Vec<u8>,
    /// Defaults to the current wall clock when `None`.
    pub timestamp: Option<u64>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub from_address: String,
    pub to_address: String,
    pub amount: u64,
    pub nonce: u64,
    pub fee: u64,
    pub timestamp: u64,
    /// Extension data; opaque to the ledger core.
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "hex_payload")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub signature: String,
    pub hash: String,
}

impl Transaction {
    /// Builds and signs a transfer from the owner of `signing_key`.
    #[instrument(skip(signing_key))]
    pub fn new(config: TransactionConfig, signing_key: &SigningKey) -> Result<Self, TransactionError> {
        if !is_valid_address(&config.to_address) {
            return Err(TransactionError::InvalidAddress(config.to_address));
        }
        let mut tx = Self {
            from_address: address_of(&signing_key.verifying_key()),
            to_address: config.to_address,
            amount: config.amount,
            nonce: config.nonce,
            fee: config.fee,
            timestamp: config.timestamp.unwrap_or_else(crate::unix_millis),
            payload: config.payload,
            signature: String::new(),
            hash: String::new(),
        };
        let signature = signing_key.sign(&tx.signing_bytes()?);
        tx.signature = hex::encode(signature.to_bytes());
        tx.hash = tx.compute_hash()?;
        Ok(tx)
    }

    /// Reward transaction paying `amount` to the miner of block `height`.
    pub fn new_reward(
        miner_address: &str,
        amount: u64,
        height: u64,
        timestamp: u64,
    ) -> Result<Self, TransactionError> {
        if !is_valid_address(miner_address) {
            return Err(TransactionError::InvalidAddress(miner_address.to_string()));
        }
        let mut tx = Self {
            from_address: ZERO_ADDRESS.to_string(),
            to_address: miner_address.to_string(),
            amount,
            nonce: height,
            fee: 0,
            timestamp,
            payload: Vec::new(),
            signature: String::new(),
            hash: String::new(),
        };
        tx.hash = tx.compute_hash()?;
        Ok(tx)
    }

    /// The synthetic transaction carried by the genesis block.
    pub fn genesis_marker(timestamp: u64) -> Result<Self, TransactionError> {
        let mut tx = Self {
            from_address: ZERO_ADDRESS.to_string(),
            to_address: ZERO_ADDRESS.to_string(),
            amount: 0,
            nonce: 0,
            fee: 0,
            timestamp,
            payload: GENESIS_PAYLOAD.to_vec(),
            signature: String::new(),
            hash: String::new(),
        };
        tx.hash = tx.compute_hash()?;
        Ok(tx)
    }

    pub fn is_reward(&self) -> bool {
        self.from_address == ZERO_ADDRESS
    }

    /// Amount plus fee debited from the sender.
    pub fn total_cost(&self) -> Result<u64, TransactionError> {
        self.amount
            .checked_add(self.fee)
            .ok_or(TransactionError::Overflow)
    }

    /// Serialized size used for block and pool size accounting.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }

    fn encode_without(&self, excluded: &[&str]) -> Result<Vec<u8>, TransactionError> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            for field in excluded {
                map.remove(*field);
            }
        }
        let mut out = Vec::with_capacity(256);
        canonical::write_value(&value, &mut out)?;
        Ok(out)
    }

    /// Bytes covered by the sender's signature: every field but `signature` and `hash`.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        self.encode_without(&["signature", "hash"])
    }

    /// Digest over every field but `hash`.
    pub fn compute_hash(&self) -> Result<String, TransactionError> {
        let bytes = self.encode_without(&["hash"])?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Stateless checks: address format, hash integrity and, for transfers,
    /// the sender's signature. Balance and nonce are checked by the ledger.
    pub fn verify_integrity(&self) -> Result<(), TransactionError> {
        if !is_valid_address(&self.from_address) {
            return Err(TransactionError::InvalidAddress(self.from_address.clone()));
        }
        if !is_valid_address(&self.to_address) {
            return Err(TransactionError::InvalidAddress(self.to_address.clone()));
        }
        let computed = self.compute_hash()?;
        if computed != self.hash {
            return Err(TransactionError::HashMismatch {
                stored: self.hash.clone(),
                computed,
            });
        }
        if self.is_reward() {
            return Ok(());
        }
        self.verify_signature()
    }

    fn verify_signature(&self) -> Result<(), TransactionError> {
        let verifying_key = verifying_key_from_address(&self.from_address)?;
        let sig_bytes =
            hex::decode(&self.signature).map_err(|_| TransactionError::InvalidSignature)?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| TransactionError::InvalidSignature)?;
        verifying_key
            .verify_strict(&self.signing_bytes()?, &signature)
            .map_err(|_| TransactionError::InvalidSignature)
    }
}

/// Hex address derived from an ed25519 verifying key.
pub fn address_of(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

/// Addresses are exactly 64 lowercase hex characters. Mixed case would name
/// the same key under a second ledger entry.
pub fn is_valid_address(address: &str) -> bool {
    address.len() == ADDRESS_HEX_LEN
        && address
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Recovers the verifying key encoded in an address.
pub fn verifying_key_from_address(address: &str) -> Result<VerifyingKey, TransactionError> {
    let bytes = hex::decode(address)
        .map_err(|_| TransactionError::InvalidAddress(address.to_string()))?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TransactionError::InvalidAddress(address.to_string()))?;
    VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| TransactionError::InvalidAddress(address.to_string()))
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn transfer(seed: u8, nonce: u64) -> Transaction {
        let receiver = address_of(&key(seed.wrapping_add(1)).verifying_key());
        Transaction::new(
            TransactionConfig {
                to_address: receiver,
                amount: 10,
                nonce,
                fee: 1,
                payload: Vec::new(),
                timestamp: Some(1_700_000_000_000),
            },
            &key(seed),
        )
        .unwrap()
    }

    #[test]
    fn test_signed_transfer_verifies() {
        let tx = transfer(7, 0);
        assert_eq!(tx.from_address, address_of(&key(7).verifying_key()));
        assert!(!tx.is_reward());
        tx.verify_integrity().unwrap();
        assert_eq!(tx.total_cost().unwrap(), 11);
    }

    #[test]
    fn test_tampered_amount_breaks_hash() {
        let mut tx = transfer(7, 0);
        tx.amount = 1_000;
        assert!(matches!(
            tx.verify_integrity(),
            Err(TransactionError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_rehashed_tamper_breaks_signature() {
        let mut tx = transfer(7, 0);
        tx.amount = 1_000;
        tx.hash = tx.compute_hash().unwrap();
        assert_eq!(tx.verify_integrity(), Err(TransactionError::InvalidSignature));
    }

    #[test]
    fn test_reward_is_exempt_from_signature() {
        let miner = address_of(&key(3).verifying_key());
        let tx = Transaction::new_reward(&miner, 50 * UNITS_PER_COIN, 4, 1_000).unwrap();
        assert!(tx.is_reward());
        assert!(tx.signature.is_empty());
        tx.verify_integrity().unwrap();
    }

    #[test]
    fn test_payload_changes_hash_and_survives_serde() {
        let plain = transfer(9, 1);
        let mut config = TransactionConfig {
            to_address: plain.to_address.clone(),
            amount: plain.amount,
            nonce: plain.nonce,
            fee: plain.fee,
            payload: b"oracle:feed".to_vec(),
            timestamp: Some(plain.timestamp),
        };
        let tagged = Transaction::new(config.clone(), &key(9)).unwrap();
        assert_ne!(plain.hash, tagged.hash);

        let json = serde_json::to_string(&tagged).unwrap();
        let decoded: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, tagged);
        decoded.verify_integrity().unwrap();

        config.to_address = "xyz".to_string();
        assert!(matches!(
            Transaction::new(config, &key(9)),
            Err(TransactionError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_uppercase_address_is_rejected() {
        let receiver = address_of(&key(8).verifying_key());
        assert!(is_valid_address(&receiver));
        let upper = receiver.to_uppercase();
        assert!(!is_valid_address(&upper));
        assert!(verifying_key_from_address(&upper).is_ok());

        let config = TransactionConfig {
            to_address: upper.clone(),
            amount: 10,
            nonce: 0,
            fee: 1,
            payload: Vec::new(),
            timestamp: Some(1_700_000_000_000),
        };
        assert_eq!(
            Transaction::new(config, &key(7)),
            Err(TransactionError::InvalidAddress(upper))
        );
    }
}
