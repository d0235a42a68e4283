//! Validator registry for BFT voting.
//!
//! With Sybil protection enabled only registered, unbanned validators may
//! vote. Registration requires a minimum stake and repeated invalid votes
//! get a validator banned.

use crate::transaction::is_valid_address;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidatorError {
    #[error("Invalid validator address '{0}'")]
    InvalidAddress(String),
    #[error("Stake {stake} is below the minimum validator stake {min_stake}")]
    StakeTooLow { stake: u64, min_stake: u64 },
    #[error("Unknown validator '{0}'")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorInfo {
    pub address: String,
    pub stake: u64,
    pub strikes: u32,
    pub banned: bool,
}

#[derive(Debug, Clone)]
pub struct ValidatorRegistry {
    validators: BTreeMap<String, ValidatorInfo>,
    min_stake: u64,
    strike_threshold: u32,
    sybil_protection: bool,
}

impl ValidatorRegistry {
    pub fn new(min_stake: u64, strike_threshold: u32, sybil_protection: bool) -> Self {
        Self {
            validators: BTreeMap::new(),
            min_stake,
            strike_threshold: strike_threshold.max(1),
            sybil_protection,
        }
    }

    pub fn sybil_protection(&self) -> bool {
        self.sybil_protection
    }

    /// Adds a validator, or updates the stake of an existing one.
    pub fn register(&mut self, address: &str, stake: u64) -> Result<(), ValidatorError> {
        if !is_valid_address(address) {
            return Err(ValidatorError::InvalidAddress(address.to_string()));
        }
        if self.sybil_protection && stake < self.min_stake {
            return Err(ValidatorError::StakeTooLow {
                stake,
                min_stake: self.min_stake,
            });
        }
        self.validators
            .entry(address.to_string())
            .and_modify(|v| v.stake = stake)
            .or_insert_with(|| ValidatorInfo {
                address: address.to_string(),
                stake,
                strikes: 0,
                banned: false,
            });
        Ok(())
    }

    pub fn remove(&mut self, address: &str) -> Option<ValidatorInfo> {
        self.validators.remove(address)
    }

    pub fn ban(&mut self, address: &str) -> Result<(), ValidatorError> {
        let info = self
            .validators
            .get_mut(address)
            .ok_or_else(|| ValidatorError::Unknown(address.to_string()))?;
        info.banned = true;
        warn!("Validator {address} banned");
        Ok(())
    }

    /// Records a misbehaviour. Returns true if this strike banned the validator.
    pub fn record_strike(&mut self, address: &str) -> bool {
        let Some(info) = self.validators.get_mut(address) else {
            return false;
        };
        if info.banned {
            return false;
        }
        info.strikes += 1;
        if info.strikes >= self.strike_threshold {
            info.banned = true;
            warn!(
                "Validator {} banned after {} strikes",
                address, info.strikes
            );
            return true;
        }
        false
    }

    pub fn get(&self, address: &str) -> Option<&ValidatorInfo> {
        self.validators.get(address)
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.validators.contains_key(address)
    }

    pub fn is_banned(&self, address: &str) -> bool {
        self.validators.get(address).is_some_and(|v| v.banned)
    }

    /// Whether votes from `address` count.
    pub fn is_authorized(&self, address: &str) -> bool {
        if !self.sybil_protection {
            return !self.is_banned(address);
        }
        self.validators.get(address).is_some_and(|v| !v.banned)
    }

    /// Validators that are not banned.
    pub fn active_count(&self) -> usize {
        self.validators.values().filter(|v| !v.banned).count()
    }

    /// Highest stake wins. Equal stakes go to the lexicographically smallest address.
    pub fn leader(&self) -> Option<String> {
        self.validators
            .values()
            .filter(|v| !v.banned)
            .fold(None::<&ValidatorInfo>, |best, v| match best {
                Some(b) if b.stake >= v.stake => Some(b),
                _ => Some(v),
            })
            .map(|v| v.address.clone())
    }

    pub fn list(&self) -> Vec<ValidatorInfo> {
        self.validators.values().cloned().collect()
    }
}

/// Votes needed for a phase to reach quorum: strictly more than two thirds.
pub fn required_votes(validator_count: usize) -> usize {
    if validator_count == 0 {
        1
    } else {
        validator_count * 2 / 3 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(c: char) -> String {
        c.to_string().repeat(64)
    }

    #[test]
    fn test_quorum_thresholds() {
        assert_eq!(required_votes(0), 1);
        assert_eq!(required_votes(1), 1);
        assert_eq!(required_votes(3), 3);
        assert_eq!(required_votes(4), 3);
        assert_eq!(required_votes(7), 5);
        assert_eq!(required_votes(100), 67);
    }

    #[test]
    fn test_registration_requires_stake() {
        let mut registry = ValidatorRegistry::new(100, 3, true);
        assert_eq!(
            registry.register(&addr('a'), 99),
            Err(ValidatorError::StakeTooLow {
                stake: 99,
                min_stake: 100
            })
        );
        assert!(registry.register(&addr('a'), 100).is_ok());
        assert!(registry.is_authorized(&addr('a')));
        assert!(!registry.is_authorized(&addr('b')));
    }

    #[test]
    fn test_leader_prefers_stake_then_address() {
        let mut registry = ValidatorRegistry::new(0, 3, true);
        registry.register(&addr('c'), 50).unwrap();
        registry.register(&addr('b'), 50).unwrap();
        registry.register(&addr('a'), 10).unwrap();
        assert_eq!(registry.leader(), Some(addr('b')));

        registry.ban(&addr('b')).unwrap();
        assert_eq!(registry.leader(), Some(addr('c')));
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_strikes_lead_to_ban() {
        let mut registry = ValidatorRegistry::new(0, 2, true);
        registry.register(&addr('a'), 1).unwrap();
        assert!(!registry.record_strike(&addr('a')));
        assert!(registry.record_strike(&addr('a')));
        assert!(!registry.is_authorized(&addr('a')));
        assert!(!registry.record_strike(&addr('z')));
    }
}
