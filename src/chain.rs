// src/chain.rs

//! --- LogiChain Chain State ---
//! The canonical, append-only block sequence and the account ledger derived
//! from it. All mutation goes through `append`, which validates the block
//! against a staged copy of the ledger, writes it to durable storage, and
//! only then publishes the new tip.

use crate::block::{Block, BlockError};
use crate::persistence::{BlockStore, StorageError};
use crate::transaction::{Transaction, TransactionError, UNITS_PER_COIN};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Block hash {0} does not match its contents")]
    InvalidHash(String),
    #[error("Block does not extend the tip: expected previous hash {expected}, found {found}")]
    InvalidLinkage { expected: String, found: String },
    #[error("Transaction {hash} rejected: {source}")]
    InvalidTransaction {
        hash: String,
        #[source]
        source: TransactionError,
    },
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Block(#[from] BlockError),
}

/// Parameters every node on a network must agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub initial_difficulty: u32,
    /// Target spacing between blocks, in milliseconds.
    pub target_block_time: u64,
    /// Blocks per difficulty retarget.
    pub adjustment_window: u64,
    pub initial_reward: u64,
    pub halving_interval: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            initial_difficulty: 4,
            target_block_time: 10_000,
            adjustment_window: 10,
            initial_reward: 50 * UNITS_PER_COIN,
            halving_interval: 210_000,
        }
    }
}

impl ChainParams {
    /// Newly minted units for the block at `height`.
    pub fn subsidy(&self, height: u64) -> u64 {
        let halvings = height / self.halving_interval.max(1);
        if halvings >= u64::BITS as u64 {
            0
        } else {
            self.initial_reward >> halvings
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Account {
    pub balance: u64,
    /// Number of confirmed outgoing transfers, which is also the next valid nonce.
    pub nonce: u64,
}

/// Balances and nonces as of some block.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    accounts: HashMap<String, Account>,
}

impl LedgerState {
    pub fn balance_of(&self, address: &str) -> u64 {
        self.accounts.get(address).map_or(0, |a| a.balance)
    }

    pub fn next_nonce(&self, address: &str) -> u64 {
        self.accounts.get(address).map_or(0, |a| a.nonce)
    }

    pub fn balances(&self) -> HashMap<String, u64> {
        self.accounts
            .iter()
            .map(|(addr, acct)| (addr.clone(), acct.balance))
            .collect()
    }

    /// Checks nonce and funds without changing anything.
    pub fn check_transaction(&self, tx: &Transaction) -> Result<(), TransactionError> {
        if tx.is_reward() {
            return Ok(());
        }
        let account = self.accounts.get(&tx.from_address).copied().unwrap_or_default();
        if tx.nonce != account.nonce {
            return Err(TransactionError::NonceMismatch {
                address: tx.from_address.clone(),
                expected: account.nonce,
                found: tx.nonce,
            });
        }
        let needed = tx.total_cost()?;
        if account.balance < needed {
            return Err(TransactionError::InsufficientBalance {
                address: tx.from_address.clone(),
                needed,
                available: account.balance,
            });
        }
        Ok(())
    }

    /// Applies one transaction. On error the state is unchanged.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), TransactionError> {
        if tx.is_reward() {
            let receiver = self.accounts.entry(tx.to_address.clone()).or_default();
            receiver.balance = receiver
                .balance
                .checked_add(tx.amount)
                .ok_or(TransactionError::Overflow)?;
            return Ok(());
        }
        self.check_transaction(tx)?;
        let cost = tx.total_cost()?;
        let receiver_balance = if tx.to_address == tx.from_address {
            self.balance_of(&tx.to_address) - cost
        } else {
            self.balance_of(&tx.to_address)
        };
        let credited = receiver_balance
            .checked_add(tx.amount)
            .ok_or(TransactionError::Overflow)?;

        let sender = self.accounts.entry(tx.from_address.clone()).or_default();
        sender.balance -= cost;
        sender.nonce += 1;
        self.accounts.entry(tx.to_address.clone()).or_default().balance = credited;
        Ok(())
    }
}

struct ChainInner {
    blocks: Vec<Block>,
    by_hash: HashMap<String, usize>,
    ledger: LedgerState,
}

impl ChainInner {
    fn tip(&self) -> &Block {
        // `ChainState` never exists without its genesis block.
        &self.blocks[self.blocks.len() - 1]
    }

    fn push(&mut self, block: Block, ledger: LedgerState) {
        self.by_hash.insert(block.hash.clone(), self.blocks.len());
        self.blocks.push(block);
        self.ledger = ledger;
    }
}

pub struct ChainState {
    params: ChainParams,
    store: Arc<dyn BlockStore>,
    inner: RwLock<ChainInner>,
}

impl std::fmt::Debug for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ChainState")
            .field("height", &inner.tip().index)
            .field("tip", &inner.tip().hash)
            .finish()
    }
}

impl ChainState {
    /// Rebuilds the chain from `store`, writing the genesis block first if the
    /// store is empty.
    #[instrument(skip(store))]
    pub fn open(params: ChainParams, store: Arc<dyn BlockStore>) -> Result<Self, ChainError> {
        let genesis = Block::genesis(params.initial_difficulty)?;
        let stored = store.load_blocks()?;

        let mut blocks = stored.into_iter();
        match blocks.next() {
            None => {
                store.save_block(&genesis)?;
                info!("Initialized new chain with genesis {}", genesis.hash);
            }
            Some(first) if first.hash != genesis.hash => {
                return Err(ChainError::InvalidBlock(format!(
                    "stored genesis {} does not match expected genesis {}",
                    first.hash, genesis.hash
                )));
            }
            Some(_) => {}
        }

        let mut inner = ChainInner {
            blocks: Vec::new(),
            by_hash: HashMap::new(),
            ledger: LedgerState::default(),
        };
        inner.push(genesis, LedgerState::default());

        for block in blocks {
            let staged = validate_extension(&params, &inner, &block)?;
            inner.push(block, staged);
        }
        info!(
            "Chain state ready at height {} (tip {})",
            inner.tip().index,
            inner.tip().hash
        );

        Ok(Self {
            params,
            store,
            inner: RwLock::new(inner),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Validates `block` as the next block and appends it. The write lock is
    /// held across validation, the storage write and the tip update, so
    /// concurrent appends at the same height resolve to a single winner.
    #[instrument(skip(self, block), fields(index = block.index, hash = %block.hash))]
    pub fn append(&self, block: Block) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        let staged = validate_extension(&self.params, &inner, &block)?;
        self.store.save_block(&block)?;
        info!(
            "Appended block #{} with {} transactions",
            block.index,
            block.transactions.len()
        );
        inner.push(block, staged);
        Ok(())
    }

    /// Runs every check `append` would, without mutating anything.
    pub fn check_extension(&self, block: &Block) -> Result<(), ChainError> {
        let inner = self.inner.read();
        validate_extension(&self.params, &inner, block).map(|_| ())
    }

    pub fn balance_of(&self, address: &str) -> u64 {
        self.inner.read().ledger.balance_of(address)
    }

    pub fn next_nonce(&self, address: &str) -> u64 {
        self.inner.read().ledger.next_nonce(address)
    }

    pub fn ledger_snapshot(&self) -> LedgerState {
        self.inner.read().ledger.clone()
    }

    pub fn latest(&self) -> Option<Block> {
        self.inner.read().blocks.last().cloned()
    }

    pub fn tip_hash(&self) -> String {
        self.inner.read().tip().hash.clone()
    }

    pub fn height(&self) -> u64 {
        self.inner.read().tip().index
    }

    pub fn get(&self, hash: &str) -> Option<Block> {
        let inner = self.inner.read();
        inner.by_hash.get(hash).map(|i| inner.blocks[*i].clone())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }

    pub fn get_by_index(&self, index: u64) -> Option<Block> {
        self.inner.read().blocks.get(index as usize).cloned()
    }

    pub fn range(&self, start: u64, limit: usize) -> Vec<Block> {
        let inner = self.inner.read();
        inner
            .blocks
            .iter()
            .skip(start as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// The last `n` blocks, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Block> {
        let inner = self.inner.read();
        let from = inner.blocks.len().saturating_sub(n);
        inner.blocks[from..].to_vec()
    }

    /// Balances recomputed from genesis, independent of the incremental ledger.
    pub fn replay_balances(&self) -> Result<HashMap<String, u64>, ChainError> {
        let inner = self.inner.read();
        let mut ledger = LedgerState::default();
        for block in inner.blocks.iter().skip(1) {
            for tx in &block.transactions {
                ledger
                    .apply_transaction(tx)
                    .map_err(|source| ChainError::InvalidTransaction {
                        hash: tx.hash.clone(),
                        source,
                    })?;
            }
        }
        Ok(ledger.balances())
    }

    /// Filters `candidates` (in priority order) down to a sequence that applies
    /// cleanly on top of the tip. Transactions whose nonce only becomes valid
    /// after another candidate is applied are picked up on a later pass.
    pub fn select_applicable(&self, candidates: Vec<Transaction>) -> Vec<Transaction> {
        let mut ledger = self.ledger_snapshot();
        let mut remaining = candidates;
        let mut selected = Vec::with_capacity(remaining.len());
        loop {
            let before = selected.len();
            let mut deferred = Vec::new();
            for tx in remaining {
                if tx.is_reward() {
                    continue;
                }
                match ledger.apply_transaction(&tx) {
                    Ok(()) => selected.push(tx),
                    Err(_) => deferred.push(tx),
                }
            }
            remaining = deferred;
            if selected.len() == before || remaining.is_empty() {
                break;
            }
        }
        if !remaining.is_empty() {
            debug!("{} candidate transactions not applicable at tip", remaining.len());
        }
        selected
    }
}

/// Checks that `block` extends the tip of `inner` and returns the ledger that
/// results from applying it.
fn validate_extension(
    params: &ChainParams,
    inner: &ChainInner,
    block: &Block,
) -> Result<LedgerState, ChainError> {
    let tip = inner.tip();
    if block.previous_hash != tip.hash {
        return Err(ChainError::InvalidLinkage {
            expected: tip.hash.clone(),
            found: block.previous_hash.clone(),
        });
    }
    if block.index != tip.index + 1 {
        return Err(ChainError::InvalidBlock(format!(
            "index {} does not follow tip index {}",
            block.index, tip.index
        )));
    }
    if !block.has_valid_hash() {
        return Err(ChainError::InvalidHash(block.hash.clone()));
    }
    if block.timestamp < tip.timestamp {
        return Err(ChainError::InvalidBlock(format!(
            "timestamp {} precedes parent timestamp {}",
            block.timestamp, tip.timestamp
        )));
    }

    let reward = block
        .reward_transaction()
        .ok_or_else(|| ChainError::InvalidBlock("missing reward transaction".to_string()))?;
    if reward.to_address != block.miner_address {
        return Err(ChainError::InvalidBlock(
            "reward is not paid to the block's miner".to_string(),
        ));
    }
    if reward.nonce != block.index {
        return Err(ChainError::InvalidBlock(format!(
            "reward nonce {} does not match height {}",
            reward.nonce, block.index
        )));
    }
    let expected_reward = params
        .subsidy(block.index)
        .checked_add(block.total_fees())
        .ok_or_else(|| ChainError::InvalidBlock("reward overflow".to_string()))?;
    if block.mining_reward != expected_reward || reward.amount != expected_reward {
        return Err(ChainError::InvalidBlock(format!(
            "mining reward {} (paid {}) does not equal subsidy plus fees {}",
            block.mining_reward, reward.amount, expected_reward
        )));
    }

    let mut staged = inner.ledger.clone();
    let mut seen = HashSet::with_capacity(block.transactions.len());
    for (i, tx) in block.transactions.iter().enumerate() {
        let invalid = |source| ChainError::InvalidTransaction {
            hash: tx.hash.clone(),
            source,
        };
        if !seen.insert(tx.hash.as_str()) {
            return Err(ChainError::InvalidBlock(format!(
                "transaction {} appears twice",
                tx.hash
            )));
        }
        if i > 0 && tx.is_reward() {
            return Err(invalid(TransactionError::UnexpectedReward));
        }
        tx.verify_integrity().map_err(invalid)?;
        staged.apply_transaction(tx).map_err(|source| {
            warn!("Block #{} carries an inapplicable transaction", block.index);
            invalid(source)
        })?;
    }
    Ok(staged)
}
