use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::base::{BaseEntry, CommitInfo, Id, LogIndex, Op};
use crate::storage::catalog::Catalog;
use crate::storage::log_entry::{LogEntryType, SegmentLogEntry, TableLogEntry};
use crate::storage::segment::{Segment, SegmentSnapshot};
use crate::storage::sequence::Sequence;

/// Table limits that drive the segment and block lifecycles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    /// Blocks a segment holds before it can be sorted
    pub segment_max_blocks: u64,
    /// Rows a block holds before it is full
    pub block_max_rows: u64,
}

impl Schema {
    pub fn new(name: impl Into<String>, segment_max_blocks: u64, block_max_rows: u64) -> Self {
        Schema {
            name: name.into(),
            segment_max_blocks,
            block_max_rows,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidSchema("table name is empty".into()));
        }
        if self.segment_max_blocks == 0 {
            return Err(Error::InvalidSchema(format!(
                "{}: segment_max_blocks must be at least 1",
                self.name
            )));
        }
        if self.block_max_rows == 0 {
            return Err(Error::InvalidSchema(format!(
                "{}: block_max_rows must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// Serializable projection of a table and everything below it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub base: BaseEntry,
    pub schema: Schema,
    pub segments: Vec<SegmentSnapshot>,
}

impl TableSnapshot {
    pub fn id(&self) -> Id {
        self.base.id
    }
}

struct TableInner {
    entry: BaseEntry,
    segments: Vec<Arc<Segment>>,
    id_index: HashMap<Id, usize>,
}

impl TableInner {
    fn on_new_segment(&mut self, segment: Arc<Segment>) {
        self.id_index.insert(segment.id(), self.segments.len());
        self.segments.push(segment);
    }
}

/// Ordered set of segments sharing one schema
pub struct Table {
    id: Id,
    schema: Arc<Schema>,
    catalog: Weak<Catalog>,
    inner: RwLock<TableInner>,
}

impl Table {
    pub(crate) fn new(catalog: Weak<Catalog>, id: Id, schema: Schema, tran_id: Id) -> Self {
        Table::with_entry(catalog, BaseEntry::new(id, CommitInfo::new(tran_id, Op::Create)), schema)
    }

    fn with_entry(catalog: Weak<Catalog>, entry: BaseEntry, schema: Schema) -> Self {
        Table {
            id: entry.id,
            schema: Arc::new(schema),
            catalog,
            inner: RwLock::new(TableInner {
                entry,
                segments: Vec::new(),
                id_index: HashMap::new(),
            }),
        }
    }

    /// Reattach a deserialized table, and its segments, to `catalog`
    pub fn rebuild(snapshot: TableSnapshot, catalog: &Arc<Catalog>) -> Result<Arc<Table>> {
        let TableSnapshot {
            base,
            schema,
            segments,
        } = snapshot;
        base.validate()?;
        schema.validate()?;
        let sequence = catalog.sequence();
        sequence.try_update_table_id(base.id);
        sequence.observe_entry(&base);

        let table = Arc::new(Table::with_entry(Arc::downgrade(catalog), base, schema));
        for seg in segments {
            table.attach_segment(seg, sequence)?;
        }
        Ok(table)
    }

    fn attach_segment(self: &Arc<Self>, snapshot: SegmentSnapshot, sequence: &Sequence) -> Result<Arc<Segment>> {
        if self.inner.read().id_index.contains_key(&snapshot.id()) {
            return Err(Error::invariant(format!(
                "segment {} created twice in table {}",
                snapshot.id(),
                self.id
            )));
        }
        let segment = Segment::rebuild(snapshot, self, sequence)?;
        self.inner.write().on_new_segment(segment.clone());
        Ok(segment)
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn schema_ref(&self) -> Arc<Schema> {
        self.schema.clone()
    }

    /// Owning catalog, if it is still alive
    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        self.catalog.upgrade()
    }

    pub fn base(&self) -> BaseEntry {
        self.inner.read().entry.clone()
    }

    pub fn current(&self) -> CommitInfo {
        self.inner.read().entry.current().clone()
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.inner.read().entry.is_soft_deleted()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    /// Segments in creation order
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.inner.read().segments.clone()
    }

    pub fn get_segment(&self, id: Id) -> Option<Arc<Segment>> {
        let inner = self.inner.read();
        inner.id_index.get(&id).map(|&pos| inner.segments[pos].clone())
    }

    pub fn segment_position(&self, id: Id) -> Option<usize> {
        self.inner.read().id_index.get(&id).copied()
    }

    pub fn create_segment(
        self: &Arc<Self>,
        catalog: &Catalog,
        tran_id: Id,
        external_index: Option<LogIndex>,
        auto_commit: bool,
    ) -> Result<Arc<Segment>> {
        let mut inner = self.inner.write();
        if inner.entry.is_soft_deleted() {
            return Err(Error::AlreadyDeleted {
                kind: "table",
                id: self.id,
            });
        }
        let segment = Arc::new(Segment::new(
            Arc::downgrade(self),
            self.id,
            self.schema.clone(),
            catalog.next_segment_id(),
            tran_id,
            external_index,
        ));
        catalog.sequence().try_update_commit_id(tran_id);
        inner.on_new_segment(segment.clone());
        debug!(table_id = self.id, segment_id = segment.id(), tran_id, "segment created");

        if auto_commit {
            let payload = segment.to_log_entry(LogEntryType::CreateSegment)?;
            catalog.commit(LogEntryType::CreateSegment, &payload)?;
        }
        Ok(segment)
    }

    pub fn simple_create_segment(
        self: &Arc<Self>,
        catalog: &Catalog,
        external_index: Option<LogIndex>,
    ) -> Result<Arc<Segment>> {
        self.create_segment(catalog, catalog.next_uncommitted_id(), external_index, true)
    }

    /// Newest segment if it still accepts rows, otherwise a new one
    pub fn appendable_segment(self: &Arc<Self>, catalog: &Catalog) -> Result<Arc<Segment>> {
        let last = self.inner.read().segments.last().cloned();
        match last {
            Some(seg) if !seg.is_soft_deleted() && seg.is_appendable() => Ok(seg),
            _ => self.simple_create_segment(catalog, None),
        }
    }

    /// Applied index of the newest segment that has one
    pub fn get_applied_index(&self) -> Option<u64> {
        let segments = self.segments();
        segments.iter().rev().find_map(|seg| seg.get_applied_index())
    }

    pub fn soft_delete(&self, catalog: &Catalog, tran_id: Id, auto_commit: bool) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.entry.is_soft_deleted() {
            return Err(Error::AlreadyDeleted {
                kind: "table",
                id: self.id,
            });
        }
        inner.entry.append_commit(CommitInfo::new(tran_id, Op::SoftDelete))?;
        catalog.sequence().try_update_commit_id(tran_id);
        debug!(table_id = self.id, table = %self.schema.name, tran_id, "table soft deleted");

        if auto_commit {
            let payload = self.log_entry(&inner.entry, LogEntryType::DropTable)?;
            catalog.commit(LogEntryType::DropTable, &payload)?;
        }
        Ok(())
    }

    /// The table as of `commit_id`; `None` if it was created later
    pub fn committed_view(&self, commit_id: Id) -> Option<TableSnapshot> {
        let (base, segments) = {
            let inner = self.inner.read();
            (inner.entry.committed(commit_id)?, inner.segments.clone())
        };
        let segments = segments
            .iter()
            .filter_map(|seg| seg.committed_view(commit_id))
            .collect();
        Some(TableSnapshot {
            base,
            schema: (*self.schema).clone(),
            segments,
        })
    }

    pub fn snapshot(&self) -> TableSnapshot {
        let (base, segments) = {
            let inner = self.inner.read();
            (inner.entry.clone(), inner.segments.clone())
        };
        TableSnapshot {
            base,
            schema: (*self.schema).clone(),
            segments: segments.iter().map(|seg| seg.snapshot()).collect(),
        }
    }

    pub fn to_log_entry(&self, entry_type: LogEntryType) -> Result<TableLogEntry> {
        let inner = self.inner.read();
        self.log_entry(&inner.entry, entry_type)
    }

    fn log_entry(&self, entry: &BaseEntry, entry_type: LogEntryType) -> Result<TableLogEntry> {
        match entry_type {
            LogEntryType::CreateTable => {}
            LogEntryType::DropTable => {
                if !entry.is_soft_deleted() {
                    return Err(Error::invariant(format!(
                        "drop of table {} that is not soft deleted",
                        self.id
                    )));
                }
            }
            other => {
                return Err(Error::invariant(format!(
                    "table {} cannot be logged as {}",
                    self.id, other
                )));
            }
        }
        Ok(TableLogEntry {
            base: entry.clone(),
            schema: (*self.schema).clone(),
        })
    }

    pub(crate) fn replay_update(&self, logged: &TableLogEntry) -> Result<()> {
        self.inner.write().entry.merge(&logged.base)?;
        Ok(())
    }

    pub(crate) fn replay_create_segment(
        self: &Arc<Self>,
        logged: SegmentLogEntry,
        sequence: &Sequence,
    ) -> Result<()> {
        let snapshot = SegmentSnapshot {
            base: logged.base,
            blocks: Vec::new(),
        };
        self.attach_segment(snapshot, sequence)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::logstore::MemLogStore;

    #[test]
    fn test_schema_validation() {
        assert!(Schema::new("t", 2, 10).validate().is_ok());
        assert!(matches!(
            Schema::new("", 2, 10).validate(),
            Err(Error::InvalidSchema(_))
        ));
        assert!(matches!(
            Schema::new("t", 0, 10).validate(),
            Err(Error::InvalidSchema(_))
        ));
        assert!(matches!(
            Schema::new("t", 2, 0).validate(),
            Err(Error::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_create_segments_in_order() {
        let catalog = Catalog::open(Box::new(MemLogStore::new())).unwrap();
        let table = catalog.simple_create_table(Schema::new("t", 2, 2)).unwrap();
        let s1 = table.simple_create_segment(&catalog, None).unwrap();
        let s2 = table.simple_create_segment(&catalog, None).unwrap();

        assert!(s1.id() < s2.id());
        assert_eq!(table.segment_position(s1.id()), Some(0));
        assert_eq!(table.segment_position(s2.id()), Some(1));
        assert!(Arc::ptr_eq(&s2.table().unwrap(), &table));
        assert!(Arc::ptr_eq(&table.catalog().unwrap(), &catalog));
    }

    #[test]
    fn test_appendable_segment_rolls_over() {
        let catalog = Catalog::open(Box::new(MemLogStore::new())).unwrap();
        let table = catalog.simple_create_table(Schema::new("t", 1, 1)).unwrap();
        let s1 = table.appendable_segment(&catalog).unwrap();
        assert_eq!(table.appendable_segment(&catalog).unwrap().id(), s1.id());

        let blk = s1.simple_create_block(&catalog, None).unwrap();
        blk.add_rows(1).unwrap();
        let s2 = table.appendable_segment(&catalog).unwrap();
        assert_ne!(s1.id(), s2.id());
        assert_eq!(table.segment_count(), 2);
    }

    #[test]
    fn test_soft_deleted_table_rejects_segments() {
        let catalog = Catalog::open(Box::new(MemLogStore::new())).unwrap();
        let table = catalog.simple_create_table(Schema::new("t", 1, 1)).unwrap();
        table.soft_delete(&catalog, catalog.next_uncommitted_id(), true).unwrap();
        assert!(matches!(
            table.simple_create_segment(&catalog, None),
            Err(Error::AlreadyDeleted { kind: "table", .. })
        ));
    }

    #[test]
    fn test_committed_view_drops_later_segments() {
        let catalog = Catalog::open(Box::new(MemLogStore::new())).unwrap();
        let table = catalog.create_table(Schema::new("t", 2, 2), 5, true).unwrap();
        table.create_segment(&catalog, 6, None, true).unwrap();
        table.create_segment(&catalog, 9, None, true).unwrap();

        assert!(table.committed_view(4).is_none());
        assert_eq!(table.committed_view(7).unwrap().segments.len(), 1);
        assert_eq!(table.committed_view(9).unwrap().segments.len(), 2);
    }
}
