// src/config.rs

//! --- LogiChain Node Configuration ---
//! Node settings are read from a TOML file. A missing file is replaced by the
//! defaults, and every loaded configuration is validated before use.

use crate::chain::ChainParams;
use crate::transaction::is_valid_address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::instrument;

// --- Constants for Validation ---
const MIN_TARGET_BLOCK_TIME: u64 = 100; // ms
const MAX_TARGET_BLOCK_TIME: u64 = 3_600_000;
const MIN_DIFFICULTY: u32 = 1;
const MAX_DIFFICULTY: u32 = 64;
const MAX_MINING_THREADS: usize = 256;
const MIN_ROUND_TIMEOUT_MS: u64 = 100;
const MAX_VOTE_WINDOW_SECS: u64 = 3_600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from '{path}': {source}")]
    Load {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Failed to save configuration to '{path}': {source}")]
    Save {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Which consensus strategy gates block acceptance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    ProofOfWork,
    Bft,
    Hybrid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub network_id: String,
    /// JSON-lines block log. Relative paths resolve against the working directory.
    pub data_path: String,
    /// Hex ed25519 seed identifying this node in BFT voting. A fresh key is
    /// generated at startup when absent.
    pub node_secret_key: Option<String>,

    // --- Chain parameters ---
    pub initial_difficulty: u32,
    pub target_block_time: u64, // ms
    pub difficulty_adjustment_window: u64,
    pub initial_reward: u64,
    pub halving_interval: u64,

    // --- Mining ---
    pub mining_enabled: bool,
    pub miner_address: String,
    pub mining_threads: usize,
    pub max_block_transactions: usize,
    pub max_block_size: usize,
    pub liveness_check_interval: u64,

    pub mempool: MempoolConfig,
    pub consensus: ConsensusConfig,
    pub logging: LoggingConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MempoolConfig {
    pub max_transactions: usize,
    pub min_fee: u64,
    pub ttl_secs: u64,
    pub eviction_interval_secs: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_transactions: 10_000,
            min_fee: 1,
            ttl_secs: 3_600,
            eviction_interval_secs: 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidatorEntry {
    pub address: String,
    pub stake: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConsensusConfig {
    pub mode: ConsensusMode,
    pub round_timeout_ms: u64,
    pub vote_window_secs: u64,
    pub sybil_protection: bool,
    pub min_validator_stake: u64,
    pub strike_threshold: u32,
    pub vote_buffer_capacity: usize,
    pub validators: Vec<ValidatorEntry>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            mode: ConsensusMode::ProofOfWork,
            round_timeout_ms: 30_000,
            vote_window_secs: 300,
            sybil_protection: true,
            min_validator_stake: 1_000,
            strike_threshold: 3,
            vote_buffer_capacity: 1_024,
            validators: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let params = ChainParams::default();
        Self {
            network_id: "logichain-devnet".to_string(),
            data_path: "logichain-blocks.jsonl".to_string(),
            node_secret_key: None,
            initial_difficulty: params.initial_difficulty,
            target_block_time: params.target_block_time,
            difficulty_adjustment_window: params.adjustment_window,
            initial_reward: params.initial_reward,
            halving_interval: params.halving_interval,
            mining_enabled: true,
            miner_address: "1111111111111111111111111111111111111111111111111111111111111111"
                .to_string(),
            mining_threads: num_cpus::get().max(1),
            max_block_transactions: 1_000,
            max_block_size: 1_048_576,
            liveness_check_interval: 1_000,
            mempool: MempoolConfig::default(),
            consensus: ConsensusConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    #[instrument]
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            let default_config = Config::default();
            default_config
                .save(path)
                .context("Failed to create a default configuration file.")
                .map_err(|source| ConfigError::Save {
                    path: path.to_string(),
                    source,
                })?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(path)
            .context("Failed to read configuration file.")
            .map_err(|source| ConfigError::Load {
                path: path.to_string(),
                source,
            })?;
        let config: Config = toml::from_str(&content)
            .context("Failed to parse TOML from configuration file.")
            .map_err(|source| ConfigError::Load {
                path: path.to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    #[instrument(skip(self))]
    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)
            .context("Failed to serialize configuration to TOML.")
            .map_err(|source| ConfigError::Save {
                path: path.to_string(),
                source,
            })?;
        fs::write(path, toml_string)
            .context("Failed to write configuration to file.")
            .map_err(|source| ConfigError::Save {
                path: path.to_string(),
                source,
            })?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_TARGET_BLOCK_TIME..=MAX_TARGET_BLOCK_TIME).contains(&self.target_block_time) {
            return Err(ConfigError::Validation(format!(
                "target_block_time (in ms) must be between {MIN_TARGET_BLOCK_TIME} and {MAX_TARGET_BLOCK_TIME}"
            )));
        }

        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&self.initial_difficulty) {
            return Err(ConfigError::Validation(format!(
                "initial_difficulty must be between {MIN_DIFFICULTY} and {MAX_DIFFICULTY}"
            )));
        }

        if self.difficulty_adjustment_window == 0 {
            return Err(ConfigError::Validation(
                "difficulty_adjustment_window must be at least 1".to_string(),
            ));
        }

        if self.halving_interval == 0 {
            return Err(ConfigError::Validation(
                "halving_interval must be at least 1".to_string(),
            ));
        }

        if self.mining_threads == 0 || self.mining_threads > MAX_MINING_THREADS {
            return Err(ConfigError::Validation(format!(
                "mining_threads must be between 1 and {MAX_MINING_THREADS}"
            )));
        }

        if self.max_block_transactions == 0 || self.max_block_size == 0 {
            return Err(ConfigError::Validation(
                "block limits must be non-zero".to_string(),
            ));
        }

        if self.liveness_check_interval == 0 {
            return Err(ConfigError::Validation(
                "liveness_check_interval must be at least 1".to_string(),
            ));
        }

        if !is_valid_address(&self.miner_address) {
            return Err(ConfigError::Validation(
                "Invalid miner_address format".to_string(),
            ));
        }

        if let Some(secret) = &self.node_secret_key {
            if secret.len() != 64 || hex::decode(secret).is_err() {
                return Err(ConfigError::Validation(
                    "node_secret_key must be 32 hex-encoded bytes".to_string(),
                ));
            }
        }

        if self.mempool.max_transactions == 0 {
            return Err(ConfigError::Validation(
                "mempool.max_transactions must be at least 1".to_string(),
            ));
        }

        if self.mempool.ttl_secs == 0 || self.mempool.eviction_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "mempool ttl and eviction interval must be non-zero".to_string(),
            ));
        }

        let consensus = &self.consensus;
        if consensus.round_timeout_ms < MIN_ROUND_TIMEOUT_MS {
            return Err(ConfigError::Validation(format!(
                "consensus.round_timeout_ms must be at least {MIN_ROUND_TIMEOUT_MS}"
            )));
        }

        if consensus.vote_window_secs == 0 || consensus.vote_window_secs > MAX_VOTE_WINDOW_SECS {
            return Err(ConfigError::Validation(format!(
                "consensus.vote_window_secs must be between 1 and {MAX_VOTE_WINDOW_SECS}"
            )));
        }

        if consensus.strike_threshold == 0 || consensus.vote_buffer_capacity == 0 {
            return Err(ConfigError::Validation(
                "consensus.strike_threshold and vote_buffer_capacity must be non-zero".to_string(),
            ));
        }

        for validator in &consensus.validators {
            if !is_valid_address(&validator.address) {
                return Err(ConfigError::Validation(format!(
                    "Invalid validator address '{}'",
                    validator.address
                )));
            }
            if consensus.sybil_protection && validator.stake < consensus.min_validator_stake {
                return Err(ConfigError::Validation(format!(
                    "Validator '{}' stake {} is below the minimum {}",
                    validator.address, validator.stake, consensus.min_validator_stake
                )));
            }
        }

        Ok(())
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            initial_difficulty: self.initial_difficulty,
            target_block_time: self.target_block_time,
            adjustment_window: self.difficulty_adjustment_window,
            initial_reward: self.initial_reward,
            halving_interval: self.halving_interval,
        }
    }
}
