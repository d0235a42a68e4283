//! Deterministic keys and addresses for tests.
//!
//! Every helper derives its key from a fixed 32-byte seed so that addresses
//! are stable across runs.

use ed25519_dalek::SigningKey;
use logichain::transaction::address_of;

/// Signing key whose seed is `seed` repeated 32 times.
pub fn test_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Address owned by [`test_key`] with the same seed.
pub fn test_address(seed: u8) -> String {
    address_of(&test_key(seed).verifying_key())
}

/// The address most mining tests pay rewards to.
pub fn make_test_miner_address() -> String {
    test_address(0xA1)
}
