use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::base::{BaseEntry, CommitInfo, Id, LogIndex, Op};
use crate::storage::block::{Block, BlockSnapshot};
use crate::storage::catalog::Catalog;
use crate::storage::log_entry::{BlockLogEntry, LogEntryType, SegmentLogEntry};
use crate::storage::sequence::Sequence;
use crate::storage::table::{Schema, Table};

/// Serializable projection of a segment and its blocks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSnapshot {
    pub base: BaseEntry,
    pub blocks: Vec<BlockSnapshot>,
}

impl SegmentSnapshot {
    pub fn id(&self) -> Id {
        self.base.id
    }

    pub fn block_ids(&self) -> Vec<Id> {
        self.blocks.iter().map(|b| b.id()).collect()
    }
}

struct SegmentInner {
    entry: BaseEntry,
    /// Creation order
    blocks: Vec<Arc<Block>>,
    id_index: HashMap<Id, usize>,
}

impl SegmentInner {
    fn on_new_block(&mut self, block: Arc<Block>) {
        self.id_index.insert(block.id(), self.blocks.len());
        self.blocks.push(block);
    }

    /// True once an `UpgradeSorted` record is in the chain, even if the
    /// segment was dropped afterwards
    fn was_sorted(&self) -> bool {
        self.entry.chain().iter().any(|r| r.op == Op::UpgradeSorted)
    }

    /// Blocks of a sorted segment were all full when it was sorted
    fn seal_blocks(&self) {
        if self.was_sorted() {
            for blk in &self.blocks {
                blk.mark_full();
            }
        }
    }

    fn has_max_blocks(&self, schema: &Schema) -> bool {
        self.entry.is_sorted() || self.blocks.len() as u64 >= schema.segment_max_blocks
    }

    /// Applied index of the newest block that has one
    fn calc_applied_index(&self) -> Option<u64> {
        self.blocks.iter().rev().find_map(|blk| blk.get_applied_index())
    }
}

/// Ordered set of blocks with the fill → sort lifecycle.
///
/// `Open` segments accept new blocks until `segment_max_blocks` is reached.
/// `upgrade` moves a segment whose blocks are all full to `Sorted`, after
/// which no block may be added.
pub struct Segment {
    id: Id,
    table_id: Id,
    schema: Arc<Schema>,
    table: Weak<Table>,
    inner: RwLock<SegmentInner>,
}

impl Segment {
    pub(crate) fn new(
        table: Weak<Table>,
        table_id: Id,
        schema: Arc<Schema>,
        id: Id,
        tran_id: Id,
        external_index: Option<LogIndex>,
    ) -> Self {
        let first = CommitInfo::new(tran_id, Op::Create).with_external_index(external_index);
        Segment {
            id,
            table_id,
            schema,
            table,
            inner: RwLock::new(SegmentInner {
                entry: BaseEntry::new(id, first),
                blocks: Vec::new(),
                id_index: HashMap::new(),
            }),
        }
    }

    /// Reattach a deserialized segment to `table`.
    ///
    /// Blocks keep their serialized order; the id index is rebuilt from it and
    /// every id seen is reported to `sequence`.
    pub fn rebuild(
        snapshot: SegmentSnapshot,
        table: &Arc<Table>,
        sequence: &Sequence,
    ) -> Result<Arc<Segment>> {
        let SegmentSnapshot { base, blocks } = snapshot;
        base.validate()?;
        sequence.try_update_segment_id(base.id);
        sequence.observe_entry(&base);

        let id = base.id;
        let table_id = table.id();
        let schema = table.schema_ref();
        let capacity = schema.block_max_rows;

        let mut failure = None;
        let segment = Arc::new_cyclic(|weak: &Weak<Segment>| {
            let mut inner = SegmentInner {
                entry: base,
                blocks: Vec::with_capacity(blocks.len()),
                id_index: HashMap::with_capacity(blocks.len()),
            };
            for blk in blocks {
                let rebuilt =
                    Block::rebuild(blk, weak.clone(), table_id, id, capacity, sequence).and_then(
                        |b| {
                            if inner.id_index.contains_key(&b.id()) {
                                Err(Error::invariant(format!(
                                    "duplicate block {} in segment {}",
                                    b.id(),
                                    id
                                )))
                            } else {
                                Ok(b)
                            }
                        },
                    );
                match rebuilt {
                    Ok(b) => inner.on_new_block(Arc::new(b)),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            inner.seal_blocks();
            Segment {
                id,
                table_id,
                schema,
                table: Arc::downgrade(table),
                inner: RwLock::new(inner),
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(segment)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn table_id(&self) -> Id {
        self.table_id
    }

    /// Owning table, if it is still alive
    pub fn table(&self) -> Option<Arc<Table>> {
        self.table.upgrade()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn base(&self) -> BaseEntry {
        self.inner.read().entry.clone()
    }

    pub fn current(&self) -> CommitInfo {
        self.inner.read().entry.current().clone()
    }

    pub fn is_sorted(&self) -> bool {
        self.inner.read().entry.is_sorted()
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.inner.read().entry.is_soft_deleted()
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// Blocks in creation order
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.inner.read().blocks.clone()
    }

    pub fn get_block(&self, id: Id) -> Option<Arc<Block>> {
        let inner = self.inner.read();
        inner.id_index.get(&id).map(|&pos| inner.blocks[pos].clone())
    }

    /// Position of block `id` in creation order
    pub fn block_position(&self, id: Id) -> Option<usize> {
        self.inner.read().id_index.get(&id).copied()
    }

    /// True once sorted or when the block count reached the schema limit
    pub fn has_max_blocks(&self) -> bool {
        self.inner.read().has_max_blocks(&self.schema)
    }

    pub fn is_appendable(&self) -> bool {
        let inner = self.inner.read();
        if inner.entry.is_sorted() {
            return false;
        }
        match inner.blocks.last() {
            Some(last) if inner.has_max_blocks(&self.schema) => !last.is_full(),
            Some(_) => true,
            None => !inner.has_max_blocks(&self.schema),
        }
    }

    pub fn create_block(
        self: &Arc<Self>,
        catalog: &Catalog,
        tran_id: Id,
        external_index: Option<LogIndex>,
        auto_commit: bool,
    ) -> Result<Arc<Block>> {
        let mut inner = self.inner.write();
        if inner.entry.is_soft_deleted() {
            return Err(Error::AlreadyDeleted {
                kind: "segment",
                id: self.id,
            });
        }
        if inner.has_max_blocks(&self.schema) {
            return Err(Error::SegmentFull { segment_id: self.id });
        }

        let block = Arc::new(Block::new(
            Arc::downgrade(self),
            self.table_id,
            self.id,
            self.schema.block_max_rows,
            catalog.next_block_id(),
            tran_id,
            external_index,
        ));
        catalog.sequence().try_update_commit_id(tran_id);
        inner.on_new_block(block.clone());
        debug!(
            segment_id = self.id,
            block_id = block.id(),
            tran_id,
            blocks = inner.blocks.len(),
            "block created"
        );

        // logged before the lock is released so nothing can upgrade the
        // block ahead of its create entry
        if auto_commit {
            let payload = block.to_log_entry(LogEntryType::CreateBlock)?;
            catalog.commit(LogEntryType::CreateBlock, &payload)?;
        }
        Ok(block)
    }

    pub fn simple_create_block(
        self: &Arc<Self>,
        catalog: &Catalog,
        external_index: Option<LogIndex>,
    ) -> Result<Arc<Block>> {
        self.create_block(catalog, catalog.next_uncommitted_id(), external_index, true)
    }

    /// Trailing non-full block, or a new one if the segment has room
    pub fn next_appendable_block(self: &Arc<Self>, catalog: &Catalog) -> Result<Option<Arc<Block>>> {
        if let Some(blk) = self.first_infull_block() {
            return Ok(Some(blk));
        }
        match self.simple_create_block(catalog, None) {
            Ok(blk) => Ok(Some(blk)),
            Err(Error::SegmentFull { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Oldest block of the trailing run of non-full blocks
    pub fn first_infull_block(&self) -> Option<Arc<Block>> {
        let inner = self.inner.read();
        if inner.entry.is_sorted() {
            return None;
        }
        inner
            .blocks
            .iter()
            .rev()
            .take_while(|blk| !blk.is_full())
            .last()
            .cloned()
    }

    /// Seal a full segment as sorted.
    ///
    /// Preconditions are checked under the shared lock, then re-checked under
    /// the exclusive lock since another upgrade may have won in between. Only
    /// the winner appends the `UpgradeSorted` record; losers get
    /// `UpgradeNotNeeded`.
    pub fn upgrade(
        &self,
        catalog: &Catalog,
        tran_id: Id,
        external_indices: Option<&[LogIndex]>,
        auto_commit: bool,
    ) -> Result<()> {
        {
            let inner = self.inner.read();
            if !inner.has_max_blocks(&self.schema) {
                return Err(Error::UpgradeInfullSegment { segment_id: self.id });
            }
            if inner.entry.is_sorted() {
                return Err(Error::UpgradeNotNeeded {
                    kind: "segment",
                    id: self.id,
                });
            }
            if inner.blocks.iter().any(|blk| !blk.is_full()) {
                return Err(Error::UpgradeInfullSegment { segment_id: self.id });
            }
        }

        let mut inner = self.inner.write();
        match inner.entry.current().op {
            Op::Create => {}
            _ => {
                return Err(Error::UpgradeNotNeeded {
                    kind: "segment",
                    id: self.id,
                });
            }
        }

        let mut record = CommitInfo::new(tran_id, Op::UpgradeSorted);
        match external_indices {
            Some(indices) if !indices.is_empty() => {
                record = record
                    .with_external_index(indices.first().copied())
                    .with_prev_index(indices.get(1).copied());
            }
            _ => {
                record = record.with_applied_index(inner.calc_applied_index().map(LogIndex::new));
            }
        }
        inner.entry.append_commit(record)?;
        catalog.sequence().try_update_commit_id(tran_id);
        debug!(
            segment_id = self.id,
            table_id = self.table_id,
            tran_id,
            blocks = inner.blocks.len(),
            "segment upgraded to sorted"
        );

        if auto_commit {
            let payload = self.log_entry(&inner.entry, LogEntryType::UpgradeSegment)?;
            catalog.commit(LogEntryType::UpgradeSegment, &payload)?;
        }
        Ok(())
    }

    pub fn simple_upgrade(&self, catalog: &Catalog, external_indices: Option<&[LogIndex]>) -> Result<()> {
        self.upgrade(catalog, catalog.next_uncommitted_id(), external_indices, true)
    }

    pub fn soft_delete(&self, catalog: &Catalog, tran_id: Id, auto_commit: bool) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.entry.is_soft_deleted() {
            return Err(Error::AlreadyDeleted {
                kind: "segment",
                id: self.id,
            });
        }
        inner.entry.append_commit(CommitInfo::new(tran_id, Op::SoftDelete))?;
        catalog.sequence().try_update_commit_id(tran_id);
        debug!(segment_id = self.id, tran_id, "segment soft deleted");

        if auto_commit {
            let payload = self.log_entry(&inner.entry, LogEntryType::DropSegment)?;
            catalog.commit(LogEntryType::DropSegment, &payload)?;
        }
        Ok(())
    }

    /// Sorted segments report their own record; open ones aggregate blocks
    pub fn get_applied_index(&self) -> Option<u64> {
        let inner = self.inner.read();
        if inner.entry.is_sorted() {
            return inner.entry.get_applied_index();
        }
        inner.calc_applied_index()
    }

    pub fn calc_applied_index(&self) -> Option<u64> {
        self.inner.read().calc_applied_index()
    }

    /// External index of the newest block that already holds data
    pub fn replay_index(&self) -> Option<LogIndex> {
        let inner = self.inner.read();
        inner.blocks.iter().rev().find_map(|blk| {
            let index = blk.external_index()?;
            (blk.row_count() > 0 || blk.is_full()).then_some(index)
        })
    }

    /// The segment as of `commit_id`; `None` if it was created later
    pub fn committed_view(&self, commit_id: Id) -> Option<SegmentSnapshot> {
        let (base, blocks) = {
            let inner = self.inner.read();
            (inner.entry.committed(commit_id)?, inner.blocks.clone())
        };
        let blocks = blocks
            .iter()
            .filter_map(|blk| blk.committed_view(commit_id))
            .collect();
        Some(SegmentSnapshot { base, blocks })
    }

    pub fn snapshot(&self) -> SegmentSnapshot {
        let inner = self.inner.read();
        SegmentSnapshot {
            base: inner.entry.clone(),
            blocks: inner.blocks.iter().map(|blk| blk.snapshot()).collect(),
        }
    }

    pub fn to_log_entry(&self, entry_type: LogEntryType) -> Result<SegmentLogEntry> {
        let inner = self.inner.read();
        self.log_entry(&inner.entry, entry_type)
    }

    fn log_entry(&self, entry: &BaseEntry, entry_type: LogEntryType) -> Result<SegmentLogEntry> {
        match entry_type {
            LogEntryType::CreateSegment | LogEntryType::UpgradeSegment => {}
            LogEntryType::DropSegment => {
                if !entry.is_soft_deleted() {
                    return Err(Error::invariant(format!(
                        "drop of segment {} that is not soft deleted",
                        self.id
                    )));
                }
            }
            other => {
                return Err(Error::invariant(format!(
                    "segment {} cannot be logged as {}",
                    self.id, other
                )));
            }
        }
        Ok(SegmentLogEntry {
            base: entry.clone(),
            table_id: self.table_id,
        })
    }

    /// Check that the id index matches the block order
    pub fn verify_index(&self) -> Result<()> {
        let inner = self.inner.read();
        if inner.id_index.len() != inner.blocks.len() {
            return Err(Error::invariant(format!(
                "segment {} indexes {} blocks but holds {}",
                self.id,
                inner.id_index.len(),
                inner.blocks.len()
            )));
        }
        for (pos, blk) in inner.blocks.iter().enumerate() {
            if inner.id_index.get(&blk.id()) != Some(&pos) {
                return Err(Error::invariant(format!(
                    "block {} of segment {} is not indexed at position {}",
                    blk.id(),
                    self.id,
                    pos
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn replay_update(&self, logged: &SegmentLogEntry) -> Result<()> {
        let mut inner = self.inner.write();
        inner.entry.merge(&logged.base)?;
        inner.seal_blocks();
        Ok(())
    }

    pub(crate) fn replay_create_block(
        self: &Arc<Self>,
        logged: BlockLogEntry,
        sequence: &Sequence,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.id_index.contains_key(&logged.base.id) {
            return Err(Error::invariant(format!(
                "block {} created twice in segment {}",
                logged.base.id, self.id
            )));
        }
        let block = Block::rebuild(
            BlockSnapshot {
                base: logged.base,
                row_count: logged.row_count,
            },
            Arc::downgrade(self),
            self.table_id,
            self.id,
            self.schema.block_max_rows,
            sequence,
        )?;
        inner.on_new_block(Arc::new(block));
        Ok(())
    }
}
