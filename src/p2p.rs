//! --- LogiChain Network Seam ---
//!
//! Peer transport and discovery live outside this crate. The core talks to
//! the network through `Broadcaster` for outbound gossip and receives peer
//! traffic as `InboundMessage`s on a queue.

use crate::block::Block;
use crate::consensus::bft::ConsensusVote;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Outbound channel closed")]
    ChannelClosed,
}

/// Commands handed to the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum P2PCommand {
    BroadcastBlock(Block),
    BroadcastTransaction(Transaction),
    BroadcastVote(ConsensusVote),
}

/// Peer traffic delivered to the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboundMessage {
    Block(Block),
    Transaction(Transaction),
    Vote(ConsensusVote),
}

/// Outbound gossip hooks. Implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait Broadcaster: Send + Sync {
    fn broadcast_block(&self, block: &Block);
    fn broadcast_transaction(&self, tx: &Transaction);
    fn broadcast_vote(&self, vote: &ConsensusVote);
}

/// Drops everything. Used by standalone nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast_block(&self, block: &Block) {
        debug!("No peers; block #{} not broadcast", block.index);
    }

    fn broadcast_transaction(&self, _tx: &Transaction) {}

    fn broadcast_vote(&self, _vote: &ConsensusVote) {}
}

/// Forwards outbound gossip to a transport task as `P2PCommand`s.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: mpsc::UnboundedSender<P2PCommand>,
}

impl ChannelBroadcaster {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<P2PCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, command: P2PCommand) -> Result<(), P2PError> {
        self.tx.send(command).map_err(|_| P2PError::ChannelClosed)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast_block(&self, block: &Block) {
        if let Err(e) = self.send(P2PCommand::BroadcastBlock(block.clone())) {
            warn!("Failed to queue block #{}: {}", block.index, e);
        }
    }

    fn broadcast_transaction(&self, tx: &Transaction) {
        if let Err(e) = self.send(P2PCommand::BroadcastTransaction(tx.clone())) {
            warn!("Failed to queue transaction {}: {}", tx.hash, e);
        }
    }

    fn broadcast_vote(&self, vote: &ConsensusVote) {
        if let Err(e) = self.send(P2PCommand::BroadcastVote(vote.clone())) {
            warn!("Failed to queue vote for {}: {}", vote.block_hash, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_broadcaster_forwards_commands() {
        let (broadcaster, mut rx) = ChannelBroadcaster::new();
        let genesis = Block::genesis(1).unwrap();
        broadcaster.broadcast_block(&genesis);
        match rx.try_recv().unwrap() {
            P2PCommand::BroadcastBlock(b) => assert_eq!(b.hash, genesis.hash),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_closed_channel_is_not_fatal() {
        let (broadcaster, rx) = ChannelBroadcaster::new();
        drop(rx);
        broadcaster.broadcast_block(&Block::genesis(1).unwrap());
    }
}
