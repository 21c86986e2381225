use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::storage::base::{BaseEntry, Id};

/// Per-class id generator owned by the catalog.
///
/// Every counter holds the last id handed out, so the first id is 1. Replay
/// feeds every id it sees through `try_update_*` so generation resumes past
/// them.
#[derive(Debug, Default)]
pub struct Sequence {
    next_table_id: AtomicU64,
    next_segment_id: AtomicU64,
    next_block_id: AtomicU64,
    next_commit_id: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SequenceSnapshot {
    pub table_id: Id,
    pub segment_id: Id,
    pub block_id: Id,
    pub commit_id: Id,
}

impl Sequence {
    pub fn new() -> Self {
        Sequence::default()
    }

    pub fn next_table_id(&self) -> Id {
        self.next_table_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_segment_id(&self) -> Id {
        self.next_segment_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_block_id(&self) -> Id {
        self.next_block_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Transaction id; doubles as the commit id of the records it produces
    pub fn next_commit_id(&self) -> Id {
        self.next_commit_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn try_update_table_id(&self, id: Id) {
        self.next_table_id.fetch_max(id, Ordering::SeqCst);
    }

    pub fn try_update_segment_id(&self, id: Id) {
        self.next_segment_id.fetch_max(id, Ordering::SeqCst);
    }

    pub fn try_update_block_id(&self, id: Id) {
        self.next_block_id.fetch_max(id, Ordering::SeqCst);
    }

    pub fn try_update_commit_id(&self, id: Id) {
        self.next_commit_id.fetch_max(id, Ordering::SeqCst);
    }

    /// Account for every commit and transaction id in an entry's chain
    pub fn observe_entry(&self, entry: &BaseEntry) {
        for record in entry.chain().iter() {
            self.try_update_commit_id(record.commit_id.max(record.tran_id));
        }
    }

    pub fn snapshot(&self) -> SequenceSnapshot {
        SequenceSnapshot {
            table_id: self.next_table_id.load(Ordering::SeqCst),
            segment_id: self.next_segment_id.load(Ordering::SeqCst),
            block_id: self.next_block_id.load(Ordering::SeqCst),
            commit_id: self.next_commit_id.load(Ordering::SeqCst),
        }
    }
}
