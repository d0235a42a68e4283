//! --- LogiChain Mempool ---
//!
//! Pending transactions ordered by fee (highest first), ties broken by
//! arrival order. Every structure lives behind one mutex so that `add` and
//! `select_for_block` always observe each other's effects in full.

use crate::chain::LedgerState;
use crate::config::MempoolConfig;
use crate::transaction::{Transaction, TransactionError};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// How far ahead of local time a transaction timestamp may be.
pub const MAX_FUTURE_SKEW_MS: u64 = 120_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Mempool is full ({capacity} transactions)")]
    PoolFull { capacity: usize },
    #[error("Transaction {0} is already pending")]
    Duplicate(String),
    #[error("Fee {fee} is below the pool minimum {min_fee}")]
    FeeTooLow { fee: u64, min_fee: u64 },
    #[error("Sender {from} already has pending transaction {existing} with nonce {nonce}")]
    DoubleSpend {
        from: String,
        nonce: u64,
        existing: String,
    },
    #[error("Transaction {0} is older than the pool TTL")]
    Expired(String),
    #[error("Transaction timestamp {timestamp} is ahead of local time {now}")]
    FutureTimestamp { timestamp: u64, now: u64 },
    #[error("Transaction validation failed: {0}")]
    Invalid(#[from] TransactionError),
}

/// A pending transaction plus the bookkeeping used for ordering.
#[derive(Debug, Clone)]
pub struct PrioritizedTransaction {
    pub tx: Transaction,
    pub size: usize,
    pub arrival: u64,
    /// Local wall-clock time (ms) the pool accepted the transaction.
    pub received_at: u64,
}

type PriorityKey = (Reverse<u64>, u64);

#[derive(Default)]
struct PoolInner {
    entries: HashMap<String, PrioritizedTransaction>,
    by_priority: BTreeMap<PriorityKey, String>,
    by_sender_nonce: HashMap<(String, u64), String>,
    next_arrival: u64,
}

impl PoolInner {
    fn remove(&mut self, hash: &str) -> Option<PrioritizedTransaction> {
        let entry = self.entries.remove(hash)?;
        self.by_priority
            .remove(&(Reverse(entry.tx.fee), entry.arrival));
        self.by_sender_nonce
            .remove(&(entry.tx.from_address.clone(), entry.tx.nonce));
        Some(entry)
    }
}

pub struct TransactionPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
    min_fee: u64,
    ttl: Duration,
    generation: AtomicU64,
}

impl std::fmt::Debug for TransactionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionPool")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("min_fee", &self.min_fee)
            .finish()
    }
}

impl TransactionPool {
    pub fn new(capacity: usize, min_fee: u64, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            capacity,
            min_fee,
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &MempoolConfig) -> Self {
        Self::new(
            config.max_transactions,
            config.min_fee,
            Duration::from_secs(config.ttl_secs),
        )
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stages a transaction. Stateless validity (hash and signature) is
    /// checked before the pool lock is taken.
    #[instrument(skip(self, tx), fields(hash = %tx.hash))]
    pub fn add(&self, tx: Transaction) -> Result<(), PoolError> {
        if tx.is_reward() {
            return Err(PoolError::Invalid(TransactionError::UnexpectedReward));
        }
        tx.verify_integrity()?;
        let now = crate::unix_millis();

        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&tx.hash) {
            return Err(PoolError::Duplicate(tx.hash));
        }
        if tx.fee < self.min_fee {
            return Err(PoolError::FeeTooLow {
                fee: tx.fee,
                min_fee: self.min_fee,
            });
        }
        if tx.timestamp > now.saturating_add(MAX_FUTURE_SKEW_MS) {
            return Err(PoolError::FutureTimestamp {
                timestamp: tx.timestamp,
                now,
            });
        }
        if now.saturating_sub(tx.timestamp) > self.ttl.as_millis() as u64 {
            return Err(PoolError::Expired(tx.hash));
        }
        let sender_key = (tx.from_address.clone(), tx.nonce);
        if let Some(existing) = inner.by_sender_nonce.get(&sender_key) {
            return Err(PoolError::DoubleSpend {
                from: tx.from_address,
                nonce: tx.nonce,
                existing: existing.clone(),
            });
        }
        if inner.entries.len() >= self.capacity {
            return Err(PoolError::PoolFull {
                capacity: self.capacity,
            });
        }

        let arrival = inner.next_arrival;
        inner.next_arrival += 1;
        let hash = tx.hash.clone();
        inner
            .by_priority
            .insert((Reverse(tx.fee), arrival), hash.clone());
        inner.by_sender_nonce.insert(sender_key, hash.clone());
        let size = tx.encoded_len();
        inner.entries.insert(
            hash,
            PrioritizedTransaction {
                tx,
                size,
                arrival,
                received_at: now,
            },
        );
        self.generation.fetch_add(1, Ordering::SeqCst);
        debug!("Transaction staged ({} pending)", inner.entries.len());
        Ok(())
    }

    /// Highest-fee transactions first, earliest arrival breaking ties. Stops
    /// at the first transaction that would overflow `max_size` bytes.
    pub fn select_for_block(&self, max_count: usize, max_size: usize) -> Vec<Transaction> {
        let inner = self.inner.lock();
        let mut selected = Vec::new();
        let mut total_size = 0usize;
        for hash in inner.by_priority.values() {
            if selected.len() >= max_count {
                break;
            }
            let Some(entry) = inner.entries.get(hash) else {
                continue;
            };
            if total_size + entry.size > max_size {
                break;
            }
            total_size += entry.size;
            selected.push(entry.tx.clone());
        }
        selected
    }

    /// Drops transactions confirmed in an accepted block.
    pub fn remove_included(&self, hashes: &[String]) -> usize {
        let mut inner = self.inner.lock();
        let removed = hashes
            .iter()
            .filter(|hash| inner.remove(hash).is_some())
            .count();
        if removed > 0 {
            self.generation.fetch_add(1, Ordering::SeqCst);
            debug!("Removed {removed} included transactions");
        }
        removed
    }

    /// Drops transactions whose nonce the ledger has already consumed, e.g.
    /// after a peer's block confirmed a conflicting transfer.
    pub fn remove_stale(&self, ledger: &LedgerState) -> usize {
        let mut inner = self.inner.lock();
        let stale: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.tx.nonce < ledger.next_nonce(&e.tx.from_address))
            .map(|e| e.tx.hash.clone())
            .collect();
        for hash in &stale {
            inner.remove(hash);
        }
        if !stale.is_empty() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        stale.len()
    }

    pub fn evict_expired(&self, ttl: Duration) -> usize {
        self.evict_expired_at(crate::unix_millis(), ttl)
    }

    /// Removes every transaction that has sat in the pool longer than `ttl`
    /// as of `now` (ms). Age counts from arrival, not from the submitter's
    /// timestamp.
    pub fn evict_expired_at(&self, now: u64, ttl: Duration) -> usize {
        let ttl_ms = ttl.as_millis() as u64;
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| now.saturating_sub(e.received_at) > ttl_ms)
            .map(|e| e.tx.hash.clone())
            .collect();
        for hash in &expired {
            inner.remove(hash);
        }
        if !expired.is_empty() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            info!("Evicted {} expired transactions", expired.len());
        }
        expired.len()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.inner.lock().entries.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<Transaction> {
        self.inner.lock().entries.get(hash).map(|e| e.tx.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped on every mutation. Cheap to poll from mining workers.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn pending_hashes(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }
}
