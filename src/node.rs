//! --- LogiChain Node ---
//!
//! Wires chain state, mempool, consensus and the mining engine together and
//! exposes the operations used by API and CLI layers. `run` drives the
//! background work: inbound peer traffic, mining, mempool expiry and BFT
//! round timeouts.

use crate::block::Block;
use crate::chain::{ChainError, ChainState};
use crate::config::{Config, ConfigError, ConsensusMode};
use crate::consensus::bft::{ConsensusVote, FinalityOrigin, RoundEvent, RoundState, VoteError, VoteOutcome};
use crate::consensus::{ConsensusEngine, ConsensusError, ConsensusStatus, RejectReason, Verdict};
use crate::mempool::{PoolError, TransactionPool};
use crate::miner::{MinerConfig, MiningEngine, MiningError, MiningStats};
use crate::p2p::{Broadcaster, InboundMessage};
use crate::persistence::{BlockStore, StorageError};
use crate::transaction::{Transaction, TransactionError};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const INBOUND_QUEUE_CAPACITY: usize = 1_024;
const MAX_TIMEOUT_TICK: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Mempool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("Block rejected: {0}")]
    Rejected(RejectReason),
    #[error("Mining error: {0}")]
    Mining(#[from] MiningError),
    #[error("Vote error: {0}")]
    Vote(#[from] VoteError),
    #[error("Invalid node key: {0}")]
    InvalidKey(String),
    #[error("Node is already running")]
    AlreadyRunning,
    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChainStatus {
    pub height: u64,
    pub tip_hash: String,
    pub difficulty: u32,
    pub pending_count: usize,
}

pub struct Node {
    config: Config,
    chain: Arc<ChainState>,
    pool: Arc<TransactionPool>,
    consensus: Arc<ConsensusEngine>,
    miner: Arc<MiningEngine>,
    broadcaster: Arc<dyn Broadcaster>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl Node {
    #[instrument(skip(config, store, broadcaster))]
    pub fn new(
        config: Config,
        store: Arc<dyn BlockStore>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let node_key = load_node_key(config.node_secret_key.as_deref())?;

        let chain = Arc::new(ChainState::open(config.chain_params(), store)?);
        let pool = Arc::new(TransactionPool::from_config(&config.mempool));
        let consensus = Arc::new(ConsensusEngine::from_config(
            &config.consensus,
            chain.clone(),
            node_key,
            broadcaster.clone(),
        )?);
        let miner = Arc::new(MiningEngine::new(
            MinerConfig::from_config(&config),
            chain.clone(),
            pool.clone(),
            consensus.clone(),
            broadcaster.clone(),
        )?);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        info!(
            "Node initialized on {} at height {} using {:?} consensus",
            config.network_id,
            chain.height(),
            consensus.mode()
        );
        Ok(Self {
            config,
            chain,
            pool,
            consensus,
            miner,
            broadcaster,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn miner(&self) -> &Arc<MiningEngine> {
        &self.miner
    }

    /// Queue through which the transport layer delivers peer traffic.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Stages a locally submitted transaction and gossips it.
    #[instrument(skip(self, tx), fields(hash = %tx.hash))]
    pub fn submit_transaction(&self, tx: Transaction) -> Result<String, PoolError> {
        let hash = self.stage_transaction(tx.clone())?;
        self.broadcaster.broadcast_transaction(&tx);
        Ok(hash)
    }

    pub fn get_balance(&self, address: &str) -> u64 {
        self.chain.balance_of(address)
    }

    pub fn get_block_template(&self, miner_address: &str) -> Result<Block, MiningError> {
        Ok(self.miner.build_template(miner_address)?.block)
    }

    /// Accepts a block solved by an external miner.
    #[instrument(skip(self, block), fields(index = block.index, hash = %block.hash))]
    pub async fn submit_mined_block(&self, block: Block) -> Result<(), NodeError> {
        let accepted = self.consensus.on_block_mined(block).await?;
        self.append_and_purge(accepted.clone())?;
        self.broadcaster.broadcast_block(&accepted);
        Ok(())
    }

    pub fn get_chain_status(&self) -> ChainStatus {
        ChainStatus {
            height: self.chain.height(),
            tip_hash: self.chain.tip_hash(),
            difficulty: self.consensus.current_difficulty(),
            pending_count: self.pool.len(),
        }
    }

    pub fn consensus_status(&self) -> ConsensusStatus {
        self.consensus.status()
    }

    pub fn mining_stats(&self) -> MiningStats {
        self.miner.stats()
    }

    /// Handles a block announced by a peer. Under proof-of-work a valid block
    /// is appended straight away. Under BFT or Hybrid the block enters a
    /// voting round and is appended once finalized.
    #[instrument(skip(self, block), fields(index = block.index, hash = %block.hash))]
    pub fn on_peer_block(&self, block: Block) -> Result<(), NodeError> {
        if self.chain.contains(&block.hash) {
            debug!("Ignoring known block");
            return Ok(());
        }
        if self.consensus.mode() != ConsensusMode::ProofOfWork {
            if let Verdict::Reject(RejectReason::NotFinalized) = self.consensus.validate(&block, &self.chain) {
                if self.consensus.accept_proposal(&block)? != RoundState::Finalize {
                    return Ok(());
                }
            }
        }
        match self.consensus.validate(&block, &self.chain) {
            Verdict::Accept => self.append_and_purge(block),
            Verdict::Reject(reason) => Err(NodeError::Rejected(reason)),
        }
    }

    pub fn on_peer_transaction(&self, tx: Transaction) -> Result<String, PoolError> {
        self.stage_transaction(tx)
    }

    pub fn on_peer_vote(&self, vote: ConsensusVote) -> Result<VoteOutcome, VoteError> {
        self.consensus.on_peer_vote(vote)
    }

    /// Pre-checks a transaction against the tip state, then stages it.
    fn stage_transaction(&self, tx: Transaction) -> Result<String, PoolError> {
        if !tx.is_reward() {
            let expected = self.chain.next_nonce(&tx.from_address);
            if tx.nonce < expected {
                return Err(PoolError::Invalid(TransactionError::NonceMismatch {
                    address: tx.from_address.clone(),
                    expected,
                    found: tx.nonce,
                }));
            }
            let needed = tx.total_cost()?;
            let available = self.chain.balance_of(&tx.from_address);
            if needed > available {
                return Err(PoolError::Invalid(TransactionError::InsufficientBalance {
                    address: tx.from_address.clone(),
                    needed,
                    available,
                }));
            }
        }
        let hash = tx.hash.clone();
        self.pool.add(tx)?;
        Ok(hash)
    }

    fn append_and_purge(&self, block: Block) -> Result<(), NodeError> {
        let included: Vec<String> = block
            .transactions
            .iter()
            .filter(|tx| !tx.is_reward())
            .map(|tx| tx.hash.clone())
            .collect();
        self.chain.append(block)?;
        self.pool.remove_included(&included);
        self.pool.remove_stale(&self.chain.ledger_snapshot());
        Ok(())
    }

    fn handle_inbound(&self, message: InboundMessage) {
        match message {
            InboundMessage::Block(block) => {
                let index = block.index;
                if let Err(e) = self.on_peer_block(block) {
                    warn!("Rejected peer block #{index}: {e}");
                }
            }
            InboundMessage::Transaction(tx) => {
                if let Err(e) = self.on_peer_transaction(tx) {
                    debug!("Rejected peer transaction: {e}");
                }
            }
            InboundMessage::Vote(vote) => {
                if let Err(e) = self.on_peer_vote(vote) {
                    debug!("Rejected peer vote: {e}");
                }
            }
        }
    }

    fn handle_round_event(&self, event: RoundEvent) {
        let RoundEvent::Finalized { block, origin } = event else {
            return;
        };
        // Locally mined blocks are appended by the mining engine.
        if origin == FinalityOrigin::Local || self.chain.contains(&block.hash) {
            return;
        }
        let index = block.index;
        if let Err(e) = self.append_and_purge(*block) {
            warn!("Finalized peer block #{index} could not be appended: {e}");
        }
    }

    /// Runs the node's background tasks until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), NodeError> {
        let mut inbound = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(NodeError::AlreadyRunning)?;
        let mut join_set: JoinSet<()> = JoinSet::new();

        {
            let node = self.clone();
            let shutdown = shutdown.clone();
            join_set.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        message = inbound.recv() => match message {
                            Some(message) => node.handle_inbound(message),
                            None => break,
                        },
                    }
                }
                debug!("Inbound queue task stopped");
            });
        }

        if self.config.mining_enabled {
            join_set.spawn(self.miner.clone().run(shutdown.clone()));
        } else {
            info!("Mining disabled by configuration");
        }

        {
            let pool = self.pool.clone();
            let shutdown = shutdown.clone();
            let every = Duration::from_secs(self.config.mempool.eviction_interval_secs);
            join_set.spawn(async move {
                let mut ticker = time::interval(every);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            pool.evict_expired(pool.ttl());
                        }
                    }
                }
            });
        }

        if let Some(mut events) = self.consensus.subscribe() {
            let consensus = self.consensus.clone();
            let shutdown_ticks = shutdown.clone();
            let every = Duration::from_millis(self.config.consensus.round_timeout_ms / 4)
                .min(MAX_TIMEOUT_TICK);
            join_set.spawn(async move {
                let mut ticker = time::interval(every);
                loop {
                    tokio::select! {
                        _ = shutdown_ticks.cancelled() => break,
                        _ = ticker.tick() => {
                            consensus.check_timeouts(crate::unix_millis());
                        }
                    }
                }
            });

            let node = self.clone();
            let shutdown = shutdown.clone();
            join_set.spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(event) => node.handle_round_event(event),
                            Err(RecvError::Lagged(skipped)) => {
                                warn!("Finality listener skipped {skipped} events");
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            });
        }

        info!("Node running at height {}", self.chain.height());
        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                error!("Node task failed: {e}");
                shutdown.cancel();
            }
        }
        info!("Node stopped at height {}", self.chain.height());
        Ok(())
    }
}

fn load_node_key(secret: Option<&str>) -> Result<SigningKey, NodeError> {
    match secret {
        Some(hex_secret) => {
            let bytes = hex::decode(hex_secret).map_err(|e| NodeError::InvalidKey(e.to_string()))?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| NodeError::InvalidKey("expected 32 bytes".to_string()))?;
            Ok(SigningKey::from_bytes(&seed))
        }
        None => {
            warn!("No node_secret_key configured; generating an ephemeral validator key");
            Ok(SigningKey::generate(&mut OsRng))
        }
    }
}
