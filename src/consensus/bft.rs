//! BFT voting rounds.
//!
//! Each candidate block gets a round that moves PRE_PREPARE -> COMMIT ->
//! FINALIZE as distinct validators' votes reach quorum. Rounds that do not
//! finalize before the round timeout are aborted, the view advances and a
//! VIEW_CHANGE vote is broadcast. Vote accumulation and the validator
//! registry share one lock, so the quorum size cannot change mid-count.

use super::validators::{required_votes, ValidatorError, ValidatorInfo, ValidatorRegistry};
use crate::block::Block;
use crate::canonical;
use crate::config::ConsensusConfig;
use crate::p2p::Broadcaster;
use crate::transaction::{address_of, verifying_key_from_address};
use ed25519_dalek::{Signature, Signer, SigningKey};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

const MAX_BUFFERED_PER_BLOCK: usize = 256;
const FINALIZED_CACHE_SIZE: usize = 4_096;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Prepare,
    PrePrepare,
    Commit,
    Finalize,
    ViewChange,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoteError {
    #[error("Duplicate {phase:?} vote from {node_id}")]
    Duplicate { node_id: String, phase: Phase },
    #[error("Vote timestamp is {skew_ms}ms away from local time")]
    StaleTimestamp { skew_ms: u64 },
    #[error("Vote from unregistered validator {0}")]
    UnknownValidator(String),
    #[error("Vote from banned validator {0}")]
    BannedValidator(String),
    #[error("Invalid vote signature from {0}")]
    InvalidSignature(String),
    #[error("Round for {0} is not open")]
    RoundClosed(String),
    #[error("Vote for view {found} but the round runs in view {expected}")]
    WrongView { expected: u64, found: u64 },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for VoteError {
    fn from(err: serde_json::Error) -> Self {
        VoteError::Serialization(err.to_string())
    }
}

#[derive(Serialize)]
struct VotePayload<'a> {
    block_hash: &'a str,
    node_id: &'a str,
    phase: Phase,
    timestamp: u64,
    view: u64,
}

/// A signed vote. `node_id` is the hex verifying key of the voter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsensusVote {
    pub node_id: String,
    pub block_hash: String,
    pub phase: Phase,
    pub view: u64,
    pub timestamp: u64,
    pub signature: String,
}

impl ConsensusVote {
    pub fn new(
        signing_key: &SigningKey,
        block_hash: &str,
        phase: Phase,
        view: u64,
        timestamp: u64,
    ) -> Result<Self, VoteError> {
        let mut vote = Self {
            node_id: address_of(&signing_key.verifying_key()),
            block_hash: block_hash.to_string(),
            phase,
            view,
            timestamp,
            signature: String::new(),
        };
        let signature = signing_key.sign(&vote.signing_bytes()?);
        vote.signature = hex::encode(signature.to_bytes());
        Ok(vote)
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, VoteError> {
        Ok(canonical::to_canonical_bytes(&VotePayload {
            block_hash: &self.block_hash,
            node_id: &self.node_id,
            phase: self.phase,
            timestamp: self.timestamp,
            view: self.view,
        })?)
    }

    pub fn verify_signature(&self) -> Result<(), VoteError> {
        let invalid = || VoteError::InvalidSignature(self.node_id.clone());
        let key = verifying_key_from_address(&self.node_id).map_err(|_| invalid())?;
        let bytes = hex::decode(&self.signature).map_err(|_| invalid())?;
        let signature = Signature::from_slice(&bytes).map_err(|_| invalid())?;
        key.verify_strict(&self.signing_bytes()?, &signature)
            .map_err(|_| invalid())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    PrePrepare,
    Commit,
    Finalize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoundProgress {
    pub entered_commit: bool,
    pub finalized: bool,
}

/// Vote tallies and phase for one candidate block.
#[derive(Debug, Clone)]
pub struct BftRound {
    block_hash: String,
    view: u64,
    state: RoundState,
    started_at: u64,
    votes: HashMap<Phase, HashSet<String>>,
}

impl BftRound {
    pub fn new(block_hash: String, view: u64, started_at: u64) -> Self {
        Self {
            block_hash,
            view,
            state: RoundState::PrePrepare,
            started_at,
            votes: HashMap::new(),
        }
    }

    pub fn block_hash(&self) -> &str {
        &self.block_hash
    }

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn vote_count(&self, phase: Phase) -> usize {
        self.votes.get(&phase).map_or(0, HashSet::len)
    }

    pub fn has_voted(&self, node_id: &str, phase: Phase) -> bool {
        self.votes
            .get(&phase)
            .is_some_and(|voters| voters.contains(node_id))
    }

    pub fn is_expired(&self, now: u64, timeout: Duration) -> bool {
        now.saturating_sub(self.started_at) > timeout.as_millis() as u64
    }

    /// Counts one vote. COMMIT votes are tallied in any state but only take
    /// effect once the round has reached COMMIT.
    pub fn record(
        &mut self,
        node_id: &str,
        phase: Phase,
        required: usize,
    ) -> Result<RoundProgress, VoteError> {
        if self.state == RoundState::Finalize {
            return Err(VoteError::RoundClosed(self.block_hash.clone()));
        }
        if !self
            .votes
            .entry(phase)
            .or_default()
            .insert(node_id.to_string())
        {
            return Err(VoteError::Duplicate {
                node_id: node_id.to_string(),
                phase,
            });
        }
        Ok(self.advance(required))
    }

    pub fn advance(&mut self, required: usize) -> RoundProgress {
        let mut progress = RoundProgress::default();
        if self.state == RoundState::PrePrepare && self.vote_count(Phase::PrePrepare) >= required {
            self.state = RoundState::Commit;
            progress.entered_commit = true;
        }
        if self.state == RoundState::Commit && self.vote_count(Phase::Commit) >= required {
            self.state = RoundState::Finalize;
            progress.finalized = true;
        }
        progress
    }
}

/// Whether a finalized block was proposed by this node or a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalityOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub enum RoundEvent {
    Finalized {
        block: Box<Block>,
        origin: FinalityOrigin,
    },
    Aborted {
        block_hash: String,
        view: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded(RoundState),
    Finalized,
    Buffered,
    ViewChange { view: u64 },
    Ignored,
}

#[derive(Debug, Clone)]
pub struct BftConfig {
    pub round_timeout: Duration,
    pub vote_window: Duration,
    pub sybil_protection: bool,
    pub min_validator_stake: u64,
    pub strike_threshold: u32,
    pub vote_buffer_capacity: usize,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self::from(&ConsensusConfig::default())
    }
}

impl From<&ConsensusConfig> for BftConfig {
    fn from(config: &ConsensusConfig) -> Self {
        Self {
            round_timeout: Duration::from_millis(config.round_timeout_ms),
            vote_window: Duration::from_secs(config.vote_window_secs),
            sybil_protection: config.sybil_protection,
            min_validator_stake: config.min_validator_stake,
            strike_threshold: config.strike_threshold,
            vote_buffer_capacity: config.vote_buffer_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BftStatus {
    pub view: u64,
    pub leader: Option<String>,
    pub active_rounds: usize,
    pub validators: usize,
    pub required_votes: usize,
    pub timeouts: u64,
    pub finalized: u64,
}

struct ActiveRound {
    round: BftRound,
    block: Block,
    origin: FinalityOrigin,
}

struct BftState {
    registry: ValidatorRegistry,
    view: u64,
    leader: Option<String>,
    rounds: HashMap<String, ActiveRound>,
    buffered: LruCache<String, Vec<ConsensusVote>>,
    finalized: LruCache<String, ()>,
    view_changes: HashMap<u64, HashSet<String>>,
    timeouts: u64,
    finalized_count: u64,
}

/// Outbound gossip and events gathered under the lock, released after it.
#[derive(Default)]
struct Effects {
    proposals: Vec<Block>,
    votes: Vec<ConsensusVote>,
    events: Vec<RoundEvent>,
}

pub struct BftEngine {
    signing_key: SigningKey,
    node_id: String,
    config: BftConfig,
    state: Mutex<BftState>,
    events: broadcast::Sender<RoundEvent>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl BftEngine {
    pub fn new(signing_key: SigningKey, config: BftConfig, broadcaster: Arc<dyn Broadcaster>) -> Self {
        let node_id = address_of(&signing_key.verifying_key());
        let buffer_size = NonZeroUsize::new(config.vote_buffer_capacity).unwrap_or(NonZeroUsize::MIN);
        let finalized_size = NonZeroUsize::new(FINALIZED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = BftState {
            registry: ValidatorRegistry::new(
                config.min_validator_stake,
                config.strike_threshold,
                config.sybil_protection,
            ),
            view: 0,
            leader: None,
            rounds: HashMap::new(),
            buffered: LruCache::new(buffer_size),
            finalized: LruCache::new(finalized_size),
            view_changes: HashMap::new(),
            timeouts: 0,
            finalized_count: 0,
        };
        Self {
            signing_key,
            node_id,
            config,
            state: Mutex::new(state),
            events,
            broadcaster,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn round_timeout(&self) -> Duration {
        self.config.round_timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    pub fn register_validator(&self, address: &str, stake: u64) -> Result<(), ValidatorError> {
        let mut state = self.state.lock();
        state.registry.register(address, stake)?;
        state.leader = state.registry.leader();
        info!("Registered validator {address} with stake {stake}");
        Ok(())
    }

    pub fn remove_validator(&self, address: &str) -> Option<ValidatorInfo> {
        let mut state = self.state.lock();
        let removed = state.registry.remove(address);
        state.leader = state.registry.leader();
        removed
    }

    pub fn ban_validator(&self, address: &str) -> Result<(), ValidatorError> {
        let mut state = self.state.lock();
        state.registry.ban(address)?;
        state.leader = state.registry.leader();
        Ok(())
    }

    pub fn validators(&self) -> Vec<ValidatorInfo> {
        self.state.lock().registry.list()
    }

    pub fn required_votes(&self) -> usize {
        required_votes(self.state.lock().registry.active_count())
    }

    pub fn view(&self) -> u64 {
        self.state.lock().view
    }

    pub fn leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }

    pub fn is_finalized(&self, block_hash: &str) -> bool {
        self.state.lock().finalized.contains(&block_hash.to_string())
    }

    pub fn round_state(&self, block_hash: &str) -> Option<RoundState> {
        let state = self.state.lock();
        if state.finalized.contains(&block_hash.to_string()) {
            return Some(RoundState::Finalize);
        }
        state.rounds.get(block_hash).map(|a| a.round.state())
    }

    pub fn status(&self) -> BftStatus {
        let state = self.state.lock();
        BftStatus {
            view: state.view,
            leader: state.leader.clone(),
            active_rounds: state.rounds.len(),
            validators: state.registry.active_count(),
            required_votes: required_votes(state.registry.active_count()),
            timeouts: state.timeouts,
            finalized: state.finalized_count,
        }
    }

    /// Opens a round for `block` and casts this node's PRE_PREPARE vote.
    /// Votes that arrived before the proposal are replayed into the round.
    #[instrument(skip(self, block), fields(hash = %block.hash))]
    pub fn propose(&self, block: &Block, origin: FinalityOrigin) -> Result<RoundState, VoteError> {
        let now = crate::unix_millis();
        let mut effects = Effects::default();
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            self.propose_locked(state, block, origin, now, &mut effects)
        };
        self.flush(effects);
        result
    }

    fn propose_locked(
        &self,
        state: &mut BftState,
        block: &Block,
        origin: FinalityOrigin,
        now: u64,
        effects: &mut Effects,
    ) -> Result<RoundState, VoteError> {
        if state.finalized.contains(&block.hash) {
            return Ok(RoundState::Finalize);
        }
        if let Some(active) = state.rounds.get(&block.hash) {
            return Ok(active.round.state());
        }
        let round = BftRound::new(block.hash.clone(), state.view, now);
        state.rounds.insert(
            block.hash.clone(),
            ActiveRound {
                round,
                block: block.clone(),
                origin,
            },
        );
        debug!("Opened BFT round in view {}", state.view);
        if origin == FinalityOrigin::Local {
            effects.proposals.push(block.clone());
        }
        self.cast_locked(state, &block.hash, Phase::PrePrepare, now, effects)?;

        if let Some(buffered) = state.buffered.pop(&block.hash) {
            debug!("Replaying {} buffered votes", buffered.len());
            for vote in buffered {
                if let Err(e) = self.apply_vote_locked(state, vote, now, effects) {
                    debug!("Buffered vote dropped: {e}");
                }
            }
        }

        if state.finalized.contains(&block.hash) {
            return Ok(RoundState::Finalize);
        }
        Ok(state
            .rounds
            .get(&block.hash)
            .map_or(RoundState::Finalize, |a| a.round.state()))
    }

    /// Validates and applies a vote received from a peer.
    pub fn on_peer_vote(&self, vote: ConsensusVote) -> Result<VoteOutcome, VoteError> {
        let now = crate::unix_millis();
        let mut effects = Effects::default();
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            self.apply_vote_locked(state, vote, now, &mut effects)
        };
        self.flush(effects);
        result
    }

    /// Aborts every round older than the round timeout. Returns the block
    /// hashes whose rounds were aborted.
    pub fn check_timeouts(&self, now: u64) -> Vec<String> {
        let mut effects = Effects::default();
        let expired: Vec<String> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let expired: Vec<String> = state
                .rounds
                .values()
                .filter(|a| a.round.is_expired(now, self.config.round_timeout))
                .map(|a| a.round.block_hash().to_string())
                .collect();
            for hash in &expired {
                self.abort_locked(state, hash, now, &mut effects);
            }
            expired
        };
        self.flush(effects);
        expired
    }

    /// Aborts the round for `block_hash` if it is still open.
    pub fn abort_round(&self, block_hash: &str) -> bool {
        let mut effects = Effects::default();
        let aborted = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            self.abort_locked(state, block_hash, crate::unix_millis(), &mut effects)
        };
        self.flush(effects);
        aborted
    }

    fn apply_vote_locked(
        &self,
        state: &mut BftState,
        vote: ConsensusVote,
        now: u64,
        effects: &mut Effects,
    ) -> Result<VoteOutcome, VoteError> {
        // Nothing is attributed to `node_id` until its key has signed the vote.
        vote.verify_signature()?;
        if state.registry.is_banned(&vote.node_id) {
            return Err(VoteError::BannedValidator(vote.node_id));
        }
        if state.registry.sybil_protection() && !state.registry.is_registered(&vote.node_id) {
            return Err(VoteError::UnknownValidator(vote.node_id));
        }
        let skew_ms = now.abs_diff(vote.timestamp);
        if skew_ms > self.config.vote_window.as_millis() as u64 {
            if state.registry.record_strike(&vote.node_id) {
                state.leader = state.registry.leader();
            }
            return Err(VoteError::StaleTimestamp { skew_ms });
        }

        match vote.phase {
            Phase::ViewChange => Ok(self.on_view_change_locked(state, &vote)),
            Phase::Prepare | Phase::Finalize => Ok(VoteOutcome::Ignored),
            Phase::PrePrepare | Phase::Commit => {
                if state.finalized.contains(&vote.block_hash) {
                    return Ok(VoteOutcome::Ignored);
                }
                if !state.rounds.contains_key(&vote.block_hash) {
                    if let Some(pending) = state.buffered.get_mut(&vote.block_hash) {
                        if pending.len() < MAX_BUFFERED_PER_BLOCK {
                            pending.push(vote);
                        }
                    } else {
                        state.buffered.put(vote.block_hash.clone(), vec![vote]);
                    }
                    return Ok(VoteOutcome::Buffered);
                }
                if let Some(active) = state.rounds.get(&vote.block_hash) {
                    let expected = active.round.view();
                    if vote.view != expected {
                        return Err(VoteError::WrongView {
                            expected,
                            found: vote.view,
                        });
                    }
                }
                let progress =
                    self.record_locked(state, &vote.node_id, &vote.block_hash, vote.phase, now, effects)?;
                if progress.finalized {
                    return Ok(VoteOutcome::Finalized);
                }
                let round_state = state
                    .rounds
                    .get(&vote.block_hash)
                    .map_or(RoundState::Finalize, |a| a.round.state());
                Ok(VoteOutcome::Recorded(round_state))
            }
        }
    }

    fn record_locked(
        &self,
        state: &mut BftState,
        node_id: &str,
        block_hash: &str,
        phase: Phase,
        now: u64,
        effects: &mut Effects,
    ) -> Result<RoundProgress, VoteError> {
        let required = required_votes(state.registry.active_count());
        let progress = match state.rounds.get_mut(block_hash) {
            Some(active) => active.round.record(node_id, phase, required)?,
            None => return Err(VoteError::RoundClosed(block_hash.to_string())),
        };
        if progress.finalized {
            self.finalize_locked(state, block_hash, effects);
        }
        if progress.entered_commit {
            debug!("PRE_PREPARE quorum reached for {block_hash}");
            self.cast_locked(state, block_hash, Phase::Commit, now, effects)?;
        }
        Ok(progress)
    }

    /// Signs a vote for broadcast and counts it locally when this node is an
    /// authorized validator and the round is still open.
    fn cast_locked(
        &self,
        state: &mut BftState,
        block_hash: &str,
        phase: Phase,
        now: u64,
        effects: &mut Effects,
    ) -> Result<(), VoteError> {
        let view = state
            .rounds
            .get(block_hash)
            .map_or(state.view, |a| a.round.view());
        let vote = ConsensusVote::new(&self.signing_key, block_hash, phase, view, now)?;
        effects.votes.push(vote);
        if state.rounds.contains_key(block_hash) && state.registry.is_authorized(&self.node_id) {
            match self.record_locked(state, &self.node_id, block_hash, phase, now, effects) {
                Ok(_) | Err(VoteError::Duplicate { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn finalize_locked(&self, state: &mut BftState, block_hash: &str, effects: &mut Effects) {
        let Some(active) = state.rounds.remove(block_hash) else {
            return;
        };
        state.finalized.put(block_hash.to_string(), ());
        state.finalized_count += 1;
        info!(
            "BFT round finalized block #{} ({}) in view {}",
            active.block.index,
            block_hash,
            active.round.view()
        );
        effects.events.push(RoundEvent::Finalized {
            block: Box::new(active.block),
            origin: active.origin,
        });
    }

    fn abort_locked(
        &self,
        state: &mut BftState,
        block_hash: &str,
        now: u64,
        effects: &mut Effects,
    ) -> bool {
        if state.rounds.remove(block_hash).is_none() {
            return false;
        }
        state.view += 1;
        state.timeouts += 1;
        state.leader = state.registry.leader();
        let view = state.view;
        state.view_changes.retain(|v, _| *v >= view);
        state
            .view_changes
            .entry(view)
            .or_default()
            .insert(self.node_id.clone());
        warn!(
            "BFT round for {} timed out; moving to view {} (leader {:?})",
            block_hash, view, state.leader
        );
        match ConsensusVote::new(&self.signing_key, block_hash, Phase::ViewChange, view, now) {
            Ok(vote) => effects.votes.push(vote),
            Err(e) => warn!("Failed to sign view change: {e}"),
        }
        effects.events.push(RoundEvent::Aborted {
            block_hash: block_hash.to_string(),
            view,
        });
        true
    }

    fn on_view_change_locked(&self, state: &mut BftState, vote: &ConsensusVote) -> VoteOutcome {
        // Only the next view is tracked, which bounds `view_changes`.
        if vote.view != state.view + 1 {
            return VoteOutcome::ViewChange { view: state.view };
        }
        let required = required_votes(state.registry.active_count());
        let voters = state.view_changes.entry(vote.view).or_default();
        voters.insert(vote.node_id.clone());
        if voters.len() >= required {
            state.view = vote.view;
            state.leader = state.registry.leader();
            let view = state.view;
            state.view_changes.retain(|v, _| *v > view);
            info!("Adopted view {} from peer view changes", view);
        }
        VoteOutcome::ViewChange { view: state.view }
    }

    fn flush(&self, effects: Effects) {
        for block in &effects.proposals {
            self.broadcaster.broadcast_block(block);
        }
        for vote in &effects.votes {
            self.broadcaster.broadcast_vote(vote);
        }
        for event in effects.events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::MockBroadcaster;

    #[test]
    fn test_round_needs_commit_quorum() {
        let mut round = BftRound::new("h".to_string(), 0, 0);
        let required = required_votes(4);
        round.record("a", Phase::PrePrepare, required).unwrap();
        round.record("b", Phase::PrePrepare, required).unwrap();
        assert_eq!(round.state(), RoundState::PrePrepare);
        let progress = round.record("c", Phase::PrePrepare, required).unwrap();
        assert!(progress.entered_commit);
        assert_eq!(round.state(), RoundState::Commit);

        round.record("a", Phase::Commit, required).unwrap();
        round.record("b", Phase::Commit, required).unwrap();
        assert_eq!(round.state(), RoundState::Commit);
        assert!(!round.is_expired(1_000, Duration::from_secs(30)));
        assert!(round.is_expired(31_000, Duration::from_secs(30)));

        let progress = round.record("c", Phase::Commit, required).unwrap();
        assert!(progress.finalized);
        assert_eq!(round.state(), RoundState::Finalize);
    }

    #[test]
    fn test_early_commits_count_once_commit_is_reached() {
        let mut round = BftRound::new("h".to_string(), 0, 0);
        for node in ["a", "b", "c"] {
            round.record(node, Phase::Commit, 3).unwrap();
        }
        assert_eq!(round.state(), RoundState::PrePrepare);
        round.record("a", Phase::PrePrepare, 3).unwrap();
        round.record("b", Phase::PrePrepare, 3).unwrap();
        let progress = round.record("c", Phase::PrePrepare, 3).unwrap();
        assert!(progress.entered_commit && progress.finalized);
    }

    #[test]
    fn test_duplicate_vote_rejected() {
        let mut round = BftRound::new("h".to_string(), 0, 0);
        round.record("a", Phase::PrePrepare, 3).unwrap();
        assert_eq!(
            round.record("a", Phase::PrePrepare, 3),
            Err(VoteError::Duplicate {
                node_id: "a".to_string(),
                phase: Phase::PrePrepare
            })
        );
    }

    #[test]
    fn test_vote_signature_round_trip() {
        let key = SigningKey::from_bytes(&[3; 32]);
        let mut vote = ConsensusVote::new(&key, "abc", Phase::Commit, 2, 42).unwrap();
        assert!(vote.verify_signature().is_ok());
        vote.view = 3;
        assert!(vote.verify_signature().is_err());
    }

    #[test]
    fn test_single_validator_finalizes_own_proposal() {
        let key = SigningKey::from_bytes(&[5; 32]);
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_broadcast_block().times(1).return_const(());
        // PRE_PREPARE and COMMIT.
        broadcaster.expect_broadcast_vote().times(2).return_const(());
        let engine = BftEngine::new(key, BftConfig::default(), Arc::new(broadcaster));
        let node_id = engine.node_id().to_string();
        engine.register_validator(&node_id, 5_000).unwrap();

        let block = Block::genesis(1).unwrap();
        let mut events = engine.subscribe();
        assert_eq!(
            engine.propose(&block, FinalityOrigin::Local).unwrap(),
            RoundState::Finalize
        );
        assert!(engine.is_finalized(&block.hash));
        match events.try_recv().unwrap() {
            RoundEvent::Finalized { block: b, origin } => {
                assert_eq!(b.hash, block.hash);
                assert_eq!(origin, FinalityOrigin::Local);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_timeout_advances_view() {
        let key = SigningKey::from_bytes(&[6; 32]);
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_broadcast_block().return_const(());
        broadcaster.expect_broadcast_vote().return_const(());
        let engine = BftEngine::new(key, BftConfig::default(), Arc::new(broadcaster));
        let other = SigningKey::from_bytes(&[7; 32]);
        engine
            .register_validator(&address_of(&other.verifying_key()), 5_000)
            .unwrap();

        let block = Block::genesis(1).unwrap();
        assert_eq!(
            engine.propose(&block, FinalityOrigin::Local).unwrap(),
            RoundState::PrePrepare
        );
        let later = crate::unix_millis() + 31_000;
        assert_eq!(engine.check_timeouts(later), vec![block.hash.clone()]);
        let status = engine.status();
        assert_eq!(status.view, 1);
        assert_eq!(status.timeouts, 1);
        assert_eq!(status.active_rounds, 0);
        assert_eq!(status.leader, Some(address_of(&other.verifying_key())));
    }

    #[test]
    fn test_only_next_view_is_tracked() {
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_broadcast_vote().never();
        let engine = BftEngine::new(
            SigningKey::from_bytes(&[8; 32]),
            BftConfig::default(),
            Arc::new(broadcaster),
        );
        let peer = SigningKey::from_bytes(&[9; 32]);
        let local = engine.node_id().to_string();
        engine.register_validator(&local, 5_000).unwrap();
        engine
            .register_validator(&address_of(&peer.verifying_key()), 5_000)
            .unwrap();

        let now = crate::unix_millis();
        for view in 2..50 {
            let vote = ConsensusVote::new(&peer, "h", Phase::ViewChange, view, now).unwrap();
            assert_eq!(engine.on_peer_vote(vote), Ok(VoteOutcome::ViewChange { view: 0 }));
        }
        assert!(engine.state.lock().view_changes.is_empty());

        let next = ConsensusVote::new(&peer, "h", Phase::ViewChange, 1, now).unwrap();
        assert_eq!(engine.on_peer_vote(next), Ok(VoteOutcome::ViewChange { view: 0 }));
        assert_eq!(engine.state.lock().view_changes.len(), 1);
    }
}
