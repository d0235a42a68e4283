//! --- LogiChain Consensus Engine ---
//!
//! One engine, three strategies chosen at construction:
//!
//! - **Proof-of-Work**: a block is accepted when its hash carries the
//!   expected number of leading zero nibbles and it links to the tip.
//! - **BFT**: a block is accepted once a quorum of registered validators has
//!   voted it through PRE_PREPARE and COMMIT.
//! - **Hybrid**: both of the above. Failing either rejects the block.

pub mod bft;
pub mod pow;
pub mod validators;

use crate::block::Block;
use crate::chain::ChainState;
use crate::config::{ConsensusConfig, ConsensusMode};
use crate::p2p::Broadcaster;
pub use bft::{
    BftConfig, BftEngine, BftStatus, ConsensusVote, FinalityOrigin, Phase, RoundEvent, RoundState,
    VoteError, VoteOutcome,
};
use ed25519_dalek::SigningKey;
use pow::ProofOfWork;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, instrument, warn};
pub use validators::{ValidatorError, ValidatorInfo};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("block hash does not match its contents")]
    HashMismatch,
    #[error("expected previous hash {expected}, found {found}")]
    Linkage { expected: String, found: String },
    #[error("expected difficulty {expected}, found {found}")]
    DifficultyMismatch { expected: u32, found: u32 },
    #[error("hash has {found} leading zero nibbles, {required} required")]
    InsufficientWork { required: u32, found: u32 },
    #[error("block has not been finalized by a validator quorum")]
    NotFinalized,
}

/// Outcome of `ConsensusEngine::validate`. Rejection is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }

    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            Verdict::Accept => None,
            Verdict::Reject(reason) => Some(reason),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Proof-of-work rejected: {0}")]
    RejectedPoW(RejectReason),
    #[error("Validator quorum rejected block: {0}")]
    RejectedQuorum(String),
    #[error("BFT round for {block_hash} timed out after {after_ms}ms")]
    Timeout { block_hash: String, after_ms: u64 },
    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),
    #[error(transparent)]
    Validator(#[from] ValidatorError),
}

pub enum Strategy {
    ProofOfWork(ProofOfWork),
    Bft(Arc<BftEngine>),
    Hybrid {
        pow: ProofOfWork,
        bft: Arc<BftEngine>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusStatus {
    pub mode: ConsensusMode,
    pub difficulty: u32,
    pub bft: Option<BftStatus>,
}

pub struct ConsensusEngine {
    strategy: Strategy,
    chain: Arc<ChainState>,
}

impl ConsensusEngine {
    pub fn new(strategy: Strategy, chain: Arc<ChainState>) -> Self {
        Self { strategy, chain }
    }

    pub fn proof_of_work(chain: Arc<ChainState>) -> Self {
        Self::new(Strategy::ProofOfWork(ProofOfWork), chain)
    }

    pub fn bft(chain: Arc<ChainState>, engine: Arc<BftEngine>) -> Self {
        Self::new(Strategy::Bft(engine), chain)
    }

    pub fn hybrid(chain: Arc<ChainState>, engine: Arc<BftEngine>) -> Self {
        Self::new(
            Strategy::Hybrid {
                pow: ProofOfWork,
                bft: engine,
            },
            chain,
        )
    }

    /// Builds the strategy named in `config`, registering its validator set.
    pub fn from_config(
        config: &ConsensusConfig,
        chain: Arc<ChainState>,
        node_key: SigningKey,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Self, ConsensusError> {
        let build_bft = || -> Result<Arc<BftEngine>, ConsensusError> {
            let engine = BftEngine::new(node_key.clone(), BftConfig::from(config), broadcaster.clone());
            for validator in &config.validators {
                engine.register_validator(&validator.address, validator.stake)?;
            }
            Ok(Arc::new(engine))
        };
        Ok(match config.mode {
            ConsensusMode::ProofOfWork => Self::proof_of_work(chain),
            ConsensusMode::Bft => Self::bft(chain, build_bft()?),
            ConsensusMode::Hybrid => Self::hybrid(chain, build_bft()?),
        })
    }

    pub fn mode(&self) -> ConsensusMode {
        match self.strategy {
            Strategy::ProofOfWork(_) => ConsensusMode::ProofOfWork,
            Strategy::Bft(_) => ConsensusMode::Bft,
            Strategy::Hybrid { .. } => ConsensusMode::Hybrid,
        }
    }

    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    pub fn bft_engine(&self) -> Option<&Arc<BftEngine>> {
        match &self.strategy {
            Strategy::ProofOfWork(_) => None,
            Strategy::Bft(bft) | Strategy::Hybrid { bft, .. } => Some(bft),
        }
    }

    /// Difficulty the next block on `self.chain` must carry.
    pub fn current_difficulty(&self) -> u32 {
        pow::expected_difficulty(&self.chain)
    }

    /// Judges `block` as the next block of `chain`. Never fails; rejection
    /// carries a reason for logging.
    pub fn validate(&self, block: &Block, chain: &ChainState) -> Verdict {
        let verdict = match &self.strategy {
            Strategy::ProofOfWork(pow) => pow.validate(block, chain),
            Strategy::Bft(bft) => match structural_check(block, chain) {
                Verdict::Accept => finality_check(bft, block),
                reject => reject,
            },
            Strategy::Hybrid { pow, bft } => match pow.validate(block, chain) {
                Verdict::Accept => finality_check(bft, block),
                reject => reject,
            },
        };
        if let Verdict::Reject(reason) = &verdict {
            debug!("Block #{} rejected: {}", block.index, reason);
        }
        verdict
    }

    /// Runs a locally mined block through the strategy. For BFT and Hybrid
    /// this waits for the voting round to finalize or time out.
    #[instrument(skip(self, block), fields(index = block.index, hash = %block.hash))]
    pub async fn on_block_mined(&self, block: Block) -> Result<Block, ConsensusError> {
        match &self.strategy {
            Strategy::ProofOfWork(pow) => {
                check_pow(pow, &block, &self.chain)?;
                Ok(block)
            }
            Strategy::Bft(bft) => {
                if let Verdict::Reject(reason) = structural_check(&block, &self.chain) {
                    return Err(ConsensusError::InvalidProposal(reason.to_string()));
                }
                await_finality(bft, block).await
            }
            Strategy::Hybrid { pow, bft } => {
                check_pow(pow, &block, &self.chain)?;
                await_finality(bft, block).await
            }
        }
    }

    /// Enters a voting round for a block proposed by a peer. A no-op under
    /// pure proof-of-work.
    #[instrument(skip(self, block), fields(index = block.index, hash = %block.hash))]
    pub fn accept_proposal(&self, block: &Block) -> Result<RoundState, ConsensusError> {
        let bft = match &self.strategy {
            Strategy::ProofOfWork(_) => return Ok(RoundState::Finalize),
            Strategy::Bft(bft) => bft,
            Strategy::Hybrid { pow, bft } => {
                check_pow(pow, block, &self.chain)?;
                bft
            }
        };
        self.chain
            .check_extension(block)
            .map_err(|e| ConsensusError::InvalidProposal(e.to_string()))?;
        bft.propose(block, FinalityOrigin::Remote)
            .map_err(|e| ConsensusError::RejectedQuorum(e.to_string()))
    }

    pub fn on_peer_vote(&self, vote: ConsensusVote) -> Result<VoteOutcome, VoteError> {
        match self.bft_engine() {
            Some(bft) => bft.on_peer_vote(vote),
            None => Ok(VoteOutcome::Ignored),
        }
    }

    pub fn check_timeouts(&self, now: u64) -> Vec<String> {
        self.bft_engine()
            .map(|bft| bft.check_timeouts(now))
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<RoundEvent>> {
        self.bft_engine().map(|bft| bft.subscribe())
    }

    pub fn register_validator(&self, address: &str, stake: u64) -> Result<(), ConsensusError> {
        match self.bft_engine() {
            Some(bft) => Ok(bft.register_validator(address, stake)?),
            None => Ok(()),
        }
    }

    pub fn remove_validator(&self, address: &str) -> Option<ValidatorInfo> {
        self.bft_engine().and_then(|bft| bft.remove_validator(address))
    }

    pub fn ban_validator(&self, address: &str) -> Result<(), ConsensusError> {
        match self.bft_engine() {
            Some(bft) => Ok(bft.ban_validator(address)?),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            mode: self.mode(),
            difficulty: self.current_difficulty(),
            bft: self.bft_engine().map(|bft| bft.status()),
        }
    }
}

fn check_pow(pow: &ProofOfWork, block: &Block, chain: &ChainState) -> Result<(), ConsensusError> {
    match pow.validate(block, chain) {
        Verdict::Accept => Ok(()),
        Verdict::Reject(reason) => Err(ConsensusError::RejectedPoW(reason)),
    }
}

fn structural_check(block: &Block, chain: &ChainState) -> Verdict {
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
    Verdict::Accept
}

fn finality_check(bft: &BftEngine, block: &Block) -> Verdict {
    if bft.is_finalized(&block.hash) {
        Verdict::Accept
    } else {
        Verdict::Reject(RejectReason::NotFinalized)
    }
}

async fn await_finality(bft: &Arc<BftEngine>, block: Block) -> Result<Block, ConsensusError> {
    let hash = block.hash.clone();
    // Subscribe before proposing so a fast quorum cannot be missed.
    let mut events = bft.subscribe();
    let state = bft
        .propose(&block, FinalityOrigin::Local)
        .map_err(|e| ConsensusError::RejectedQuorum(e.to_string()))?;
    if state == RoundState::Finalize {
        return Ok(block);
    }

    let timeout = bft.round_timeout();
    let wait = async {
        loop {
            match events.recv().await {
                Ok(RoundEvent::Finalized { block: done, .. }) if done.hash == hash => {
                    return Ok(());
                }
                Ok(RoundEvent::Aborted { block_hash, .. }) if block_hash == hash => {
                    return Err(ConsensusError::Timeout {
                        block_hash,
                        after_ms: timeout.as_millis() as u64,
                    });
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {skipped} consensus events while waiting for {hash}");
                    if bft.is_finalized(&hash) {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(ConsensusError::RejectedQuorum(
                        "consensus event channel closed".to_string(),
                    ));
                }
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(Ok(())) => Ok(block),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            bft.abort_round(&hash);
            Err(ConsensusError::Timeout {
                block_hash: hash,
                after_ms: timeout.as_millis() as u64,
            })
        }
    }
}
