// src/persistence.rs

//! --- LogiChain Block Storage ---
//! The durable-storage collaborator. The chain writes each accepted block
//! through a `BlockStore` before advancing its in-memory tip, and rebuilds
//! all derived state from `load_blocks` on restart.

use crate::block::Block;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt block log at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("Write rejected: {0}")]
    WriteRejected(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait BlockStore: Send + Sync {
    /// Durably records `block`. Returning `Ok` means the block survives a crash.
    fn save_block(&self, block: &Block) -> Result<(), StorageError>;
    /// Every stored block in append order.
    fn load_blocks(&self) -> Result<Vec<Block>, StorageError>;
}

/// Volatile store for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStore {
    blocks: Mutex<Vec<Block>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail, simulating a broken disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}

impl BlockStore for MemoryStore {
    fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected(format!(
                "memory store refused block {}",
                block.index
            )));
        }
        self.blocks.lock().push(block.clone());
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self.blocks.lock().clone())
    }
}

/// Append-only JSON-lines log, one block per line, fsynced on every write.
pub struct FileStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileStore {
    #[instrument]
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!("Opened block log at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileStore {
    fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(block)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last = lines.len();
        let mut blocks = Vec::with_capacity(last);
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Block>(line) {
                Ok(block) => blocks.push(block),
                // A torn final record is what a crash mid-write leaves behind.
                Err(e) if i + 1 == last => {
                    warn!("Ignoring truncated trailing record in {}: {}", self.path.display(), e);
                }
                Err(e) => {
                    return Err(StorageError::Corrupt {
                        line: i + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(blocks)
    }
}
