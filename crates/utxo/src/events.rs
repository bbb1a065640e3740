//! Event stream consumed by downstream collaborators.

use bsvd_consensus::Hash256;
use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub enum UtxoEvent {
    Created {
        tx: Hash256,
    },
    Mined {
        tx: Hash256,
        block_id: u32,
        block_height: u32,
        subtree_idx: u32,
    },
    Unmined {
        tx: Hash256,
        block_id: u32,
    },
    Spent {
        tx: Hash256,
        indices: Vec<u32>,
    },
    Unspent {
        tx: Hash256,
        indices: Vec<u32>,
    },
    Frozen {
        tx: Hash256,
        indices: Vec<u32>,
    },
    Unfrozen {
        tx: Hash256,
        indices: Vec<u32>,
    },
    Reassigned {
        tx: Hash256,
        index: u32,
    },
    ConflictingMarked {
        tx: Hash256,
    },
    Deleted {
        tx: Hash256,
    },
}

pub struct EventBus {
    sender: broadcast::Sender<UtxoEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UtxoEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: UtxoEvent) {
        // No subscribers is fine; the stream is best-effort fan-out.
        let _ = self.sender.send(event);
    }
}
