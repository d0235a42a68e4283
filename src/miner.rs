//! --- LogiChain Mining Engine ---
//!
//! Builds block templates from the chain tip and the mempool, searches the
//! nonce space in parallel and pushes solved blocks through consensus into
//! the chain.
//!
//! The nonce space is split into one contiguous range per worker. Every
//! `check_interval` attempts a worker polls the shared stop flag, the
//! cancellation token and the liveness of its template (chain tip and
//! mempool), so all workers wind down within a bounded number of hashes once
//! any of them finds a solution or the template goes stale.

use crate::block::{leading_zero_nibbles, Block, BlockCreationData, BlockError, HashTemplate};
use crate::chain::{ChainError, ChainState};
use crate::config::Config;
use crate::consensus::{ConsensusEngine, ConsensusError};
use crate::mempool::TransactionPool;
use crate::p2p::Broadcaster;
use crate::transaction::{is_valid_address, Transaction, TransactionError};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum MiningError {
    #[error("Invalid miner address: {0}")]
    InvalidAddress(String),
    #[error("Block error: {0}")]
    Block(#[from] BlockError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Chain rejected block: {0}")]
    Chain(#[from] ChainError),
    #[error("Consensus rejected block: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("Thread pool build error: {0}")]
    ThreadPool(String),
    #[error("Mining task failed: {0}")]
    Join(String),
    #[error("Reward for block {0} overflows")]
    RewardOverflow(u64),
    #[error("Internal inconsistency in mined block: {0}")]
    InternalInconsistency(String),
}

impl From<rayon::ThreadPoolBuildError> for MiningError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        MiningError::ThreadPool(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct MinerConfig {
    pub miner_address: String,
    pub threads: usize,
    pub check_interval: u64,
    pub max_block_transactions: usize,
    pub max_block_size: usize,
    pub error_backoff: Duration,
}

impl MinerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            miner_address: config.miner_address.clone(),
            threads: config.mining_threads,
            check_interval: config.liveness_check_interval,
            max_block_transactions: config.max_block_transactions,
            max_block_size: config.max_block_size,
            error_backoff: Duration::from_millis(500),
        }
    }
}

/// A block ready for nonce search, plus what the liveness check compares against.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,
    pub pool_generation: u64,
    pub selected: Vec<String>,
    /// Whether more pool transactions could have fit.
    pub has_room: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    TipChanged,
    PoolChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiningOutcome {
    Solved(Block),
    Stale(StaleReason),
    Exhausted,
    Cancelled,
}

impl MiningOutcome {
    pub fn into_block(self) -> Option<Block> {
        match self {
            MiningOutcome::Solved(block) => Some(block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiningStats {
    pub hashrate: f64,
    pub total_hashes: u64,
    pub blocks_mined: u64,
    pub stale_templates: u64,
    pub last_block_time: Option<u64>,
}

#[derive(Default)]
struct MiningCounters {
    hashes: AtomicU64,
    blocks: AtomicU64,
    stale: AtomicU64,
    last_block_time: AtomicU64,
    hashrate_bits: AtomicU64,
}

/// Shared state of one nonce search.
struct Search<'a> {
    template: &'a BlockTemplate,
    hasher: HashTemplate,
    stop: AtomicBool,
    stale: Mutex<Option<StaleReason>>,
    seen_generation: AtomicU64,
    cancel: &'a CancellationToken,
}

impl Search<'_> {
    fn abandon(&self, reason: StaleReason) {
        let mut stale = self.stale.lock();
        if stale.is_none() {
            *stale = Some(reason);
        }
        self.stop.store(true, Ordering::SeqCst);
    }
}

pub struct MiningEngine {
    config: MinerConfig,
    chain: Arc<ChainState>,
    pool: Arc<TransactionPool>,
    consensus: Arc<ConsensusEngine>,
    broadcaster: Arc<dyn Broadcaster>,
    counters: MiningCounters,
}

impl MiningEngine {
    pub fn new(
        config: MinerConfig,
        chain: Arc<ChainState>,
        pool: Arc<TransactionPool>,
        consensus: Arc<ConsensusEngine>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Self, MiningError> {
        if !is_valid_address(&config.miner_address) {
            return Err(MiningError::InvalidAddress(config.miner_address));
        }
        Ok(Self {
            config: MinerConfig {
                threads: config.threads.max(1),
                check_interval: config.check_interval.max(1),
                ..config
            },
            chain,
            pool,
            consensus,
            broadcaster,
            counters: MiningCounters::default(),
        })
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    /// Assembles the next block: reward first, then the highest-fee pool
    /// transactions that apply cleanly on the tip.
    #[instrument(skip(self))]
    pub fn build_template(&self, miner_address: &str) -> Result<BlockTemplate, MiningError> {
        if !is_valid_address(miner_address) {
            return Err(MiningError::InvalidAddress(miner_address.to_string()));
        }
        let pool_generation = self.pool.generation();
        let tip = self
            .chain
            .latest()
            .ok_or_else(|| MiningError::InternalInconsistency("chain has no tip".to_string()))?;
        let index = tip.index + 1;
        let difficulty = self.consensus.current_difficulty();
        let timestamp = crate::unix_millis().max(tip.timestamp);

        let reward_reserve =
            Transaction::new_reward(miner_address, u64::MAX, index, timestamp)?.encoded_len();
        let max_count = self.config.max_block_transactions.saturating_sub(1);
        let size_budget = self.config.max_block_size.saturating_sub(reward_reserve);
        let candidates = self.pool.select_for_block(max_count, size_budget);
        let candidate_count = candidates.len();
        let selected = self.chain.select_applicable(candidates);

        let fees = selected
            .iter()
            .try_fold(0u64, |acc, tx| acc.checked_add(tx.fee))
            .ok_or(MiningError::RewardOverflow(index))?;
        let reward = self
            .chain
            .params()
            .subsidy(index)
            .checked_add(fees)
            .ok_or(MiningError::RewardOverflow(index))?;

        let selected_hashes: Vec<String> = selected.iter().map(|tx| tx.hash.clone()).collect();
        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(Transaction::new_reward(miner_address, reward, index, timestamp)?);
        transactions.extend(selected);

        let block = Block::new(BlockCreationData {
            index,
            timestamp,
            previous_hash: tip.hash,
            transactions,
            difficulty,
            miner_address: miner_address.to_string(),
            mining_reward: reward,
        })?;
        debug!(
            "Built template #{} with {} transactions at difficulty {}",
            index,
            block.transactions.len(),
            difficulty
        );
        Ok(BlockTemplate {
            block,
            pool_generation,
            selected: selected_hashes,
            has_room: candidate_count < max_count,
        })
    }

    /// Searches for a nonce with a fresh cancellation token.
    pub fn mine(&self, template: &BlockTemplate, worker_count: usize) -> Result<MiningOutcome, MiningError> {
        self.mine_until(template, worker_count, &CancellationToken::new())
    }

    /// Splits the nonce space into `worker_count` disjoint ranges and searches
    /// them in parallel until a solution, a stale template or cancellation.
    #[instrument(skip(self, template, cancel), fields(index = template.block.index))]
    pub fn mine_until(
        &self,
        template: &BlockTemplate,
        worker_count: usize,
        cancel: &CancellationToken,
    ) -> Result<MiningOutcome, MiningError> {
        let workers = worker_count.max(1);
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()?;
        let search = Search {
            template,
            hasher: template.block.hash_template()?,
            stop: AtomicBool::new(false),
            stale: Mutex::new(None),
            seen_generation: AtomicU64::new(template.pool_generation),
            cancel,
        };
        let ranges = nonce_ranges(workers);
        let started = Instant::now();
        let hashes_before = self.counters.hashes.load(Ordering::Relaxed);

        let found = thread_pool.install(|| {
            (0..workers)
                .into_par_iter()
                .find_map_any(|worker| {
                    let (first, last) = ranges[worker];
                    self.search_range(&search, first, last)
                })
        });

        let hashes = self.counters.hashes.load(Ordering::Relaxed) - hashes_before;
        let secs = started.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.counters
                .hashrate_bits
                .store((hashes as f64 / secs).to_bits(), Ordering::Relaxed);
        }

        if let Some(nonce) = found {
            let mut block = template.block.clone();
            block.nonce = nonce;
            block.hash = hex::encode(search.hasher.digest(nonce));
            info!(
                "PoW solved for block #{} with nonce {} after {} hashes",
                block.index, nonce, hashes
            );
            return Ok(MiningOutcome::Solved(block));
        }
        if let Some(reason) = *search.stale.lock() {
            self.counters.stale.fetch_add(1, Ordering::Relaxed);
            debug!("Template #{} abandoned: {:?}", template.block.index, reason);
            return Ok(MiningOutcome::Stale(reason));
        }
        if cancel.is_cancelled() {
            return Ok(MiningOutcome::Cancelled);
        }
        Ok(MiningOutcome::Exhausted)
    }

    fn search_range(&self, search: &Search<'_>, first: u64, last: u64) -> Option<u64> {
        let difficulty = search.template.block.difficulty;
        let interval = self.config.check_interval;
        let mut nonce = first;
        let mut attempts: u64 = 0;
        let mut unreported: u64 = 0;
        let result = loop {
            if attempts % interval == 0 {
                self.counters.hashes.fetch_add(unreported, Ordering::Relaxed);
                unreported = 0;
                if search.stop.load(Ordering::SeqCst) || search.cancel.is_cancelled() {
                    break None;
                }
                if let Some(reason) = self.liveness(search) {
                    search.abandon(reason);
                    break None;
                }
            }
            let digest = search.hasher.digest(nonce);
            attempts += 1;
            unreported += 1;
            if leading_zero_nibbles(&digest) >= difficulty {
                // Only the first finder reports a solution.
                if search.stop.swap(true, Ordering::SeqCst) {
                    break None;
                }
                break Some(nonce);
            }
            if nonce >= last {
                break None;
            }
            nonce += 1;
        };
        self.counters.hashes.fetch_add(unreported, Ordering::Relaxed);
        result
    }

    /// Whether the template still targets the tip and the pool has not
    /// changed in a way that matters to it.
    fn liveness(&self, search: &Search<'_>) -> Option<StaleReason> {
        let template = search.template;
        if self.chain.tip_hash() != template.block.previous_hash {
            return Some(StaleReason::TipChanged);
        }
        let generation = self.pool.generation();
        if generation == search.seen_generation.load(Ordering::Relaxed) {
            return None;
        }
        if template.selected.iter().any(|hash| !self.pool.contains(hash)) {
            return Some(StaleReason::PoolChanged);
        }
        if template.has_room && self.pool.len() > template.selected.len() {
            return Some(StaleReason::PoolChanged);
        }
        search.seen_generation.store(generation, Ordering::Relaxed);
        None
    }

    /// Runs a solved block through consensus, appends it, purges its
    /// transactions from the pool and broadcasts it.
    #[instrument(skip(self, block), fields(index = block.index))]
    pub async fn submit(&self, block: Block) -> Result<Block, MiningError> {
        let recomputed = block.compute_hash()?;
        if recomputed != block.hash || !block.meets_target() {
            error!(
                "Mined block #{} failed self-check (stored {}, recomputed {})",
                block.index, block.hash, recomputed
            );
            return Err(MiningError::InternalInconsistency(format!(
                "block #{} hash {} does not match recomputed {} or misses target {}",
                block.index, block.hash, recomputed, block.difficulty
            )));
        }

        let accepted = self.consensus.on_block_mined(block).await?;
        self.chain.append(accepted.clone())?;

        let included: Vec<String> = accepted
            .transactions
            .iter()
            .filter(|tx| !tx.is_reward())
            .map(|tx| tx.hash.clone())
            .collect();
        self.pool.remove_included(&included);
        self.pool.remove_stale(&self.chain.ledger_snapshot());
        self.broadcaster.broadcast_block(&accepted);

        self.counters.blocks.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_block_time
            .store(crate::unix_millis(), Ordering::Relaxed);
        info!("Mined block accepted\n{accepted}");
        Ok(accepted)
    }

    /// One build, search and submit cycle. `Ok(None)` means the template was
    /// abandoned or cancelled.
    pub async fn mine_once(self: &Arc<Self>, cancel: &CancellationToken) -> Result<Option<Block>, MiningError> {
        let template = self.build_template(&self.config.miner_address)?;
        let engine = Arc::clone(self);
        let token = cancel.child_token();
        let outcome = tokio::task::spawn_blocking(move || {
            engine.mine_until(&template, engine.config.threads, &token)
        })
        .await
        .map_err(|e| MiningError::Join(e.to_string()))??;

        match outcome {
            MiningOutcome::Solved(block) => self.submit(block).await.map(Some),
            MiningOutcome::Stale(_) | MiningOutcome::Cancelled => Ok(None),
            MiningOutcome::Exhausted => {
                warn!("Nonce space exhausted without a solution");
                Ok(None)
            }
        }
    }

    /// Mines until `shutdown` is cancelled. Failed iterations are logged and
    /// retried after a short backoff.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Mining engine started with {} workers for {}",
            self.config.threads, self.config.miner_address
        );
        while !shutdown.is_cancelled() {
            match self.mine_once(&shutdown).await {
                Ok(_) => {}
                Err(MiningError::Chain(ChainError::InvalidLinkage { .. })) => {
                    debug!("Lost the race for the tip; rebuilding template");
                }
                Err(e) => {
                    warn!("Mining iteration failed: {e}");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
        info!("Mining engine stopped");
    }

    pub fn stats(&self) -> MiningStats {
        let last = self.counters.last_block_time.load(Ordering::Relaxed);
        MiningStats {
            hashrate: f64::from_bits(self.counters.hashrate_bits.load(Ordering::Relaxed)),
            total_hashes: self.counters.hashes.load(Ordering::Relaxed),
            blocks_mined: self.counters.blocks.load(Ordering::Relaxed),
            stale_templates: self.counters.stale.load(Ordering::Relaxed),
            last_block_time: (last > 0).then_some(last),
        }
    }
}

/// Splits the nonce space into `workers` disjoint inclusive ranges. The last
/// range absorbs the remainder and ends at `u64::MAX`.
fn nonce_ranges(workers: usize) -> Vec<(u64, u64)> {
    let workers = workers.max(1) as u64;
    let span = u64::MAX / workers;
    (0..workers)
        .map(|worker| {
            let first = worker * span;
            let last = if worker + 1 == workers {
                u64::MAX
            } else {
                first + span - 1
            };
            (first, last)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainParams;
    use crate::p2p::MockBroadcaster;
    use crate::persistence::MemoryStore;

    fn engine(broadcaster: MockBroadcaster) -> Arc<MiningEngine> {
        let chain = Arc::new(
            ChainState::open(
                ChainParams {
                    initial_difficulty: 1,
                    ..ChainParams::default()
                },
                Arc::new(MemoryStore::new()),
            )
            .unwrap(),
        );
        let pool = Arc::new(TransactionPool::new(100, 1, Duration::from_secs(3_600)));
        let consensus = Arc::new(ConsensusEngine::proof_of_work(chain.clone()));
        Arc::new(
            MiningEngine::new(
                MinerConfig {
                    miner_address: "ab".repeat(32),
                    threads: 2,
                    check_interval: 100,
                    max_block_transactions: 10,
                    max_block_size: 100_000,
                    error_backoff: Duration::from_millis(10),
                },
                chain,
                pool,
                consensus,
                Arc::new(broadcaster),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_template_carries_reward_first() {
        let engine = engine(MockBroadcaster::new());
        let template = engine.build_template(&"cd".repeat(32)).unwrap();
        let block = &template.block;
        assert_eq!(block.index, 1);
        assert_eq!(block.difficulty, 1);
        let reward = block.reward_transaction().unwrap();
        assert_eq!(reward.to_address, "cd".repeat(32));
        assert_eq!(reward.amount, block.mining_reward);
        assert!(template.selected.is_empty());
    }

    #[test]
    fn test_mined_block_meets_target() {
        let engine = engine(MockBroadcaster::new());
        let template = engine.build_template(&"ab".repeat(32)).unwrap();
        let block = engine.mine(&template, 2).unwrap().into_block().unwrap();
        assert!(block.meets_target());
        assert_eq!(block.compute_hash().unwrap(), block.hash);
        assert!(engine.stats().total_hashes > 0);
    }

    #[test]
    fn test_nonce_ranges_are_disjoint_and_cover_the_space() {
        for workers in [1, 2, 3, 7, 16] {
            let ranges = nonce_ranges(workers);
            assert_eq!(ranges.len(), workers);
            assert_eq!(ranges[0].0, 0);
            assert_eq!(ranges[workers - 1].1, u64::MAX);
            for pair in ranges.windows(2) {
                assert!(pair[0].0 <= pair[0].1);
                assert_eq!(pair[0].1 + 1, pair[1].0);
            }
        }
        assert_eq!(nonce_ranges(0), vec![(0, u64::MAX)]);
    }

    #[test]
    fn test_cancelled_search_returns_cancelled() {
        let engine = engine(MockBroadcaster::new());
        let mut template = engine.build_template(&"ab".repeat(32)).unwrap();
        template.block.difficulty = 64;
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            engine.mine_until(&template, 2, &token).unwrap(),
            MiningOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn test_submit_appends_and_broadcasts() {
        let mut broadcaster = MockBroadcaster::new();
        broadcaster.expect_broadcast_block().times(1).return_const(());
        let engine = engine(broadcaster);
        let template = engine.build_template(&"ab".repeat(32)).unwrap();
        let block = engine.mine(&template, 2).unwrap().into_block().unwrap();
        let accepted = engine.submit(block).await.unwrap();
        assert_eq!(engine.chain.tip_hash(), accepted.hash);
        assert_eq!(engine.stats().blocks_mined, 1);
        assert!(engine.stats().last_block_time.is_some());
    }

    #[tokio::test]
    async fn test_submit_rejects_tampered_block() {
        let engine = engine(MockBroadcaster::new());
        let template = engine.build_template(&"ab".repeat(32)).unwrap();
        let mut block = engine.mine(&template, 1).unwrap().into_block().unwrap();
        block.mining_reward += 1;
        assert!(matches!(
            engine.submit(block).await,
            Err(MiningError::InternalInconsistency(_))
        ));
        assert_eq!(engine.chain.height(), 0);
    }
}
