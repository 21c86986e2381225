use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::base::{BaseEntry, CommitInfo, Id, LogIndex, Op};
use crate::storage::catalog::Catalog;
use crate::storage::log_entry::{BlockLogEntry, LogEntryType};
use crate::storage::segment::Segment;
use crate::storage::sequence::Sequence;

/// Serializable projection of a block, without its parent reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub base: BaseEntry,
    /// Rows at the time the snapshot was taken. Row counts are not versioned:
    /// a committed view reports `capacity` once the block is full at that
    /// commit and the live count otherwise.
    pub row_count: u64,
}

impl BlockSnapshot {
    pub fn id(&self) -> Id {
        self.base.id
    }
}

/// Smallest mutable unit of stored rows.
///
/// `row_count` only grows; once it reaches `capacity` the block is full for
/// good, which is why `is_full` needs no lock.
#[derive(Debug)]
pub struct Block {
    id: Id,
    table_id: Id,
    segment_id: Id,
    capacity: u64,
    row_count: AtomicU64,
    segment: Weak<Segment>,
    entry: RwLock<BaseEntry>,
}

impl Block {
    pub(crate) fn new(
        segment: Weak<Segment>,
        table_id: Id,
        segment_id: Id,
        capacity: u64,
        id: Id,
        tran_id: Id,
        external_index: Option<LogIndex>,
    ) -> Self {
        let first = CommitInfo::new(tran_id, Op::Create).with_external_index(external_index);
        Block {
            id,
            table_id,
            segment_id,
            capacity,
            row_count: AtomicU64::new(0),
            segment,
            entry: RwLock::new(BaseEntry::new(id, first)),
        }
    }

    /// Rebuild a deserialized block under its (new) parent segment
    pub(crate) fn rebuild(
        snapshot: BlockSnapshot,
        segment: Weak<Segment>,
        table_id: Id,
        segment_id: Id,
        capacity: u64,
        sequence: &Sequence,
    ) -> Result<Self> {
        snapshot.base.validate()?;
        if snapshot.row_count > capacity {
            return Err(Error::invariant(format!(
                "block {} holds {} rows, capacity is {}",
                snapshot.base.id, snapshot.row_count, capacity
            )));
        }
        sequence.try_update_block_id(snapshot.base.id);
        sequence.observe_entry(&snapshot.base);

        let was_full = snapshot
            .base
            .chain()
            .iter()
            .any(|record| record.op == Op::UpgradeFull);
        let row_count = if was_full { capacity } else { snapshot.row_count };

        Ok(Block {
            id: snapshot.base.id,
            table_id,
            segment_id,
            capacity,
            row_count: AtomicU64::new(row_count),
            segment,
            entry: RwLock::new(snapshot.base),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn table_id(&self) -> Id {
        self.table_id
    }

    pub fn segment_id(&self) -> Id {
        self.segment_id
    }

    /// Owning segment, if it is still alive
    pub fn segment(&self) -> Option<Arc<Segment>> {
        self.segment.upgrade()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.row_count() >= self.capacity
    }

    /// Account for `rows` newly appended rows; returns the new row count
    pub fn add_rows(&self, rows: u64) -> Result<u64> {
        let mut current = self.row_count.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(rows);
            if current >= self.capacity || next > self.capacity {
                return Err(Error::CapacityExceeded {
                    block_id: self.id,
                    row_count: current,
                    capacity: self.capacity,
                    requested: rows,
                });
            }
            match self.row_count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Set a block of a sorted segment back to full during replay
    pub(crate) fn mark_full(&self) {
        self.row_count.store(self.capacity, Ordering::Release);
    }

    /// Restore the row count reported by the data files after a restart
    pub fn restore_row_count(&self, rows: u64) -> Result<()> {
        if rows > self.capacity {
            return Err(Error::invariant(format!(
                "block {} cannot hold {} rows, capacity is {}",
                self.id, rows, self.capacity
            )));
        }
        self.row_count.fetch_max(rows, Ordering::AcqRel);
        Ok(())
    }

    pub fn base(&self) -> BaseEntry {
        self.entry.read().clone()
    }

    pub fn current(&self) -> CommitInfo {
        self.entry.read().current().clone()
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.entry.read().is_soft_deleted()
    }

    /// Ingestion log position the block was created for
    pub fn external_index(&self) -> Option<LogIndex> {
        self.entry.read().chain().first().external_index
    }

    pub fn get_applied_index(&self) -> Option<u64> {
        self.entry.read().get_applied_index()
    }

    /// Mark a full block as sealed.
    ///
    /// The new record's applied index is `applied_index` if given, otherwise
    /// the external index the block was created with.
    pub fn upgrade(
        &self,
        catalog: &Catalog,
        tran_id: Id,
        applied_index: Option<LogIndex>,
        auto_commit: bool,
    ) -> Result<()> {
        if !self.is_full() {
            return Err(Error::UpgradeInfullBlock { block_id: self.id });
        }
        let mut entry = self.entry.write();
        if entry.current().op != Op::Create {
            return Err(Error::UpgradeNotNeeded {
                kind: "block",
                id: self.id,
            });
        }
        let applied = applied_index.or(entry.chain().first().external_index);
        entry.append_commit(CommitInfo::new(tran_id, Op::UpgradeFull).with_applied_index(applied))?;
        catalog.sequence().try_update_commit_id(tran_id);
        debug!(block_id = self.id, segment_id = self.segment_id, tran_id, "block upgraded to full");

        if auto_commit {
            let payload = self.log_entry(&entry, LogEntryType::UpgradeBlock)?;
            catalog.commit(LogEntryType::UpgradeBlock, &payload)?;
        }
        Ok(())
    }

    pub fn simple_upgrade(&self, catalog: &Catalog, applied_index: Option<LogIndex>) -> Result<()> {
        self.upgrade(catalog, catalog.next_uncommitted_id(), applied_index, true)
    }

    pub fn soft_delete(&self, catalog: &Catalog, tran_id: Id, auto_commit: bool) -> Result<()> {
        let mut entry = self.entry.write();
        if entry.is_soft_deleted() {
            return Err(Error::AlreadyDeleted {
                kind: "block",
                id: self.id,
            });
        }
        entry.append_commit(CommitInfo::new(tran_id, Op::SoftDelete))?;
        catalog.sequence().try_update_commit_id(tran_id);
        debug!(block_id = self.id, tran_id, "block soft deleted");

        if auto_commit {
            let payload = self.log_entry(&entry, LogEntryType::DropBlock)?;
            catalog.commit(LogEntryType::DropBlock, &payload)?;
        }
        Ok(())
    }

    /// The block as of `commit_id`; `None` if it was created later.
    ///
    /// Only the commit chain is resolved at `commit_id`. The row count of a
    /// block that was not yet full at that commit is the live one.
    pub fn committed_view(&self, commit_id: Id) -> Option<BlockSnapshot> {
        let base = self.entry.read().committed(commit_id)?;
        let row_count = if base.is_full() {
            self.capacity
        } else {
            self.row_count()
        };
        Some(BlockSnapshot { base, row_count })
    }

    pub fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot {
            base: self.base(),
            row_count: self.row_count(),
        }
    }

    pub fn to_log_entry(&self, entry_type: LogEntryType) -> Result<BlockLogEntry> {
        let entry = self.entry.read();
        self.log_entry(&entry, entry_type)
    }

    fn log_entry(&self, entry: &BaseEntry, entry_type: LogEntryType) -> Result<BlockLogEntry> {
        match entry_type {
            LogEntryType::CreateBlock | LogEntryType::UpgradeBlock => {}
            LogEntryType::DropBlock => {
                if !entry.is_soft_deleted() {
                    return Err(Error::invariant(format!(
                        "drop of block {} that is not soft deleted",
                        self.id
                    )));
                }
            }
            other => {
                return Err(Error::invariant(format!(
                    "block {} cannot be logged as {}",
                    self.id, other
                )));
            }
        }
        Ok(BlockLogEntry {
            base: entry.clone(),
            table_id: self.table_id,
            segment_id: self.segment_id,
            row_count: self.row_count(),
        })
    }

    /// Apply a logged change of this block during replay
    pub(crate) fn replay_update(&self, logged: &BlockLogEntry) -> Result<()> {
        let mut entry = self.entry.write();
        entry.merge(&logged.base)?;
        if entry.chain().iter().any(|r| r.op == Op::UpgradeFull) {
            self.mark_full();
        } else {
            self.restore_row_count(logged.row_count)?;
        }
        Ok(())
    }
}
