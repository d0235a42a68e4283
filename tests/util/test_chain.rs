//! Chain, pool and miner fixtures with cheap proof-of-work settings.

use ed25519_dalek::SigningKey;
use logichain::block::{leading_zero_nibbles, Block, BlockCreationData};
use logichain::chain::{ChainParams, ChainState};
use logichain::config::Config;
use logichain::consensus::{pow, ConsensusEngine};
use logichain::mempool::TransactionPool;
use logichain::miner::{MinerConfig, MiningEngine};
use logichain::p2p::NoopBroadcaster;
use logichain::persistence::MemoryStore;
use logichain::transaction::{Transaction, TransactionConfig};
use std::sync::Arc;
use std::time::Duration;

use super::test_address::make_test_miner_address;

/// Difficulty 1 and a 20 unit subsidy keep arithmetic readable.
pub fn test_params() -> ChainParams {
    ChainParams {
        initial_difficulty: 1,
        target_block_time: 10_000,
        adjustment_window: 10,
        initial_reward: 20,
        halving_interval: 210_000,
    }
}

pub fn create_test_chain(params: ChainParams) -> Arc<ChainState> {
    Arc::new(ChainState::open(params, Arc::new(MemoryStore::new())).expect("chain should open"))
}

pub fn create_test_pool() -> Arc<TransactionPool> {
    Arc::new(TransactionPool::new(1_000, 1, Duration::from_secs(3_600)))
}

pub fn create_test_miner(chain: Arc<ChainState>, pool: Arc<TransactionPool>) -> MiningEngine {
    let consensus = Arc::new(ConsensusEngine::proof_of_work(chain.clone()));
    let config = MinerConfig {
        miner_address: make_test_miner_address(),
        threads: 2,
        check_interval: 64,
        max_block_transactions: 100,
        max_block_size: 64 * 1024,
        error_backoff: Duration::from_millis(10),
    };
    MiningEngine::new(config, chain, pool, consensus, Arc::new(NoopBroadcaster))
        .expect("miner should build")
}

/// Node configuration for in-process tests: no disk, no background mining.
pub fn test_node_config(miner_address: &str) -> Config {
    let params = test_params();
    Config {
        initial_difficulty: params.initial_difficulty,
        target_block_time: params.target_block_time,
        difficulty_adjustment_window: params.adjustment_window,
        initial_reward: params.initial_reward,
        halving_interval: params.halving_interval,
        mining_enabled: false,
        miner_address: miner_address.to_string(),
        mining_threads: 2,
        liveness_check_interval: 64,
        ..Config::default()
    }
}

pub fn transfer(from: &SigningKey, to: &str, amount: u64, fee: u64, nonce: u64) -> Transaction {
    Transaction::new(
        TransactionConfig {
            to_address: to.to_string(),
            amount,
            nonce,
            fee,
            payload: Vec::new(),
            timestamp: None,
        },
        from,
    )
    .expect("transfer should sign")
}

/// Unsolved block extending the tip of `chain`, paying subsidy plus fees to `miner`.
pub fn build_block_at(chain: &ChainState, miner: &str, txs: Vec<Transaction>, timestamp: u64) -> Block {
    let tip = chain.latest().expect("chain has a tip");
    let index = tip.index + 1;
    let fees: u64 = txs.iter().map(|tx| tx.fee).sum();
    let reward = chain.params().subsidy(index) + fees;
    let mut transactions = vec![Transaction::new_reward(miner, reward, index, timestamp)
        .expect("reward should build")];
    transactions.extend(txs);
    Block::new(BlockCreationData {
        index,
        timestamp,
        previous_hash: tip.hash,
        transactions,
        difficulty: pow::expected_difficulty(chain),
        miner_address: miner.to_string(),
        mining_reward: reward,
    })
    .expect("block should build")
}

/// Single-threaded nonce search; only meant for tiny difficulties.
pub fn solve(mut block: Block) -> Block {
    let template = block.hash_template().expect("template should build");
    let nonce = (0..u64::MAX)
        .find(|nonce| leading_zero_nibbles(&template.digest(*nonce)) >= block.difficulty)
        .expect("a nonce exists at test difficulty");
    block.nonce = nonce;
    block.hash = hex::encode(template.digest(nonce));
    block
}

pub fn mine_next(chain: &ChainState, miner: &str, txs: Vec<Transaction>) -> Block {
    let tip = chain.latest().expect("chain has a tip");
    let timestamp = logichain::unix_millis().max(tip.timestamp);
    solve(build_block_at(chain, miner, txs, timestamp))
}

/// Mines and appends the next block, returning it.
pub fn extend_chain(chain: &ChainState, miner: &str, txs: Vec<Transaction>) -> Block {
    let block = mine_next(chain, miner, txs);
    chain.append(block.clone()).expect("mined block should append");
    block
}
