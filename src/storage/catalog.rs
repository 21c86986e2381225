use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::base::{Id, LogIndex};
use crate::storage::block::Block;
use crate::storage::log_entry::{
    BlockLogEntry, LogEntry, LogEntryType, SegmentLogEntry, TableLogEntry,
};
use crate::storage::logstore::LogStore;
use crate::storage::segment::Segment;
use crate::storage::sequence::Sequence;
use crate::storage::table::{Schema, Table, TableSnapshot};
use crate::storage::wal::FileLogStore;

/// Serializable projection of the whole catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    /// Highest commit id visible in this snapshot
    pub commit_id: Id,
    /// Tables in id order
    pub tables: Vec<TableSnapshot>,
}

#[derive(Default)]
struct TableRegistry {
    by_id: BTreeMap<Id, Arc<Table>>,
    /// Live (not soft deleted) tables only
    names: HashMap<String, Id>,
}

/// Root of the metadata tree.
///
/// Owns the id sequence and the log store. Every durable change goes through
/// `commit`, which the mutating operation calls while still holding its own
/// write lock.
pub struct Catalog {
    sequence: Sequence,
    tables: RwLock<TableRegistry>,
    store: Box<dyn LogStore>,
    commit_lock: Mutex<()>,
}

impl Catalog {
    /// Open a catalog over `store`, replaying everything it holds
    pub fn open(store: Box<dyn LogStore>) -> Result<Arc<Catalog>> {
        let catalog = Arc::new(Catalog {
            sequence: Sequence::new(),
            tables: RwLock::new(TableRegistry::default()),
            store,
            commit_lock: Mutex::new(()),
        });
        catalog.replay()?;
        Ok(catalog)
    }

    /// Open the catalog log under `config.data_dir`
    pub fn open_dir(config: &Config) -> Result<Arc<Catalog>> {
        let store = FileLogStore::open(config.wal_path(), config.sync())?;
        Catalog::open(Box::new(store))
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn next_table_id(&self) -> Id {
        self.sequence.next_table_id()
    }

    pub fn next_segment_id(&self) -> Id {
        self.sequence.next_segment_id()
    }

    pub fn next_block_id(&self) -> Id {
        self.sequence.next_block_id()
    }

    /// Fresh transaction id; it doubles as the commit id of the change
    pub fn next_uncommitted_id(&self) -> Id {
        self.sequence.next_commit_id()
    }

    /// Serialize `payload` and append it to the log store
    pub fn commit<P: Serialize>(&self, entry_type: LogEntryType, payload: &P) -> Result<u64> {
        let mut entry = self.store.allocate_empty_entry();
        entry.set_type(entry_type);
        entry.marshal(payload)?;
        let bytes = entry.payload().len();

        let _guard = self.commit_lock.lock();
        let lsn = self.store.append(entry)?;
        debug!(%entry_type, lsn, bytes, "log entry committed");
        Ok(lsn)
    }

    /// Flush the log store
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    pub fn create_table(self: &Arc<Self>, schema: Schema, tran_id: Id, auto_commit: bool) -> Result<Arc<Table>> {
        schema.validate()?;
        let mut tables = self.tables.write();
        if tables.names.contains_key(&schema.name) {
            return Err(Error::DuplicateTable(schema.name));
        }

        let name = schema.name.clone();
        let table = Arc::new(Table::new(
            Arc::downgrade(self),
            self.next_table_id(),
            schema,
            tran_id,
        ));
        self.sequence.try_update_commit_id(tran_id);
        tables.names.insert(name.clone(), table.id());
        tables.by_id.insert(table.id(), table.clone());
        debug!(table_id = table.id(), table = %name, tran_id, "table created");

        if auto_commit {
            let payload = table.to_log_entry(LogEntryType::CreateTable)?;
            self.commit(LogEntryType::CreateTable, &payload)?;
        }
        Ok(table)
    }

    pub fn simple_create_table(self: &Arc<Self>, schema: Schema) -> Result<Arc<Table>> {
        self.create_table(schema, self.next_uncommitted_id(), true)
    }

    /// Soft delete a table and free its name
    pub fn drop_table(&self, table_id: Id, tran_id: Id, auto_commit: bool) -> Result<Arc<Table>> {
        let mut tables = self.tables.write();
        let table = tables
            .by_id
            .get(&table_id)
            .cloned()
            .ok_or(Error::NotFound {
                kind: "table",
                id: table_id,
            })?;
        table.soft_delete(self, tran_id, auto_commit)?;
        tables.names.remove(table.name());
        Ok(table)
    }

    pub fn simple_drop_table(&self, table_id: Id) -> Result<Arc<Table>> {
        self.drop_table(table_id, self.next_uncommitted_id(), true)
    }

    pub fn get_table(&self, id: Id) -> Option<Arc<Table>> {
        self.tables.read().by_id.get(&id).cloned()
    }

    /// Live table named `name`
    pub fn get_table_by_name(&self, name: &str) -> Option<Arc<Table>> {
        let tables = self.tables.read();
        let id = tables.names.get(name)?;
        tables.by_id.get(id).cloned()
    }

    /// Every table, soft deleted ones included, in id order
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.tables.read().by_id.values().cloned().collect()
    }

    pub fn get_segment(&self, id: Id) -> Option<Arc<Segment>> {
        self.tables().iter().find_map(|t| t.get_segment(id))
    }

    pub fn get_block(&self, id: Id) -> Option<Arc<Block>> {
        self.tables()
            .iter()
            .flat_map(|t| t.segments())
            .find_map(|seg| seg.get_block(id))
    }

    /// Applied index of every table that has one
    pub fn applied_indices(&self) -> Vec<(Id, LogIndex)> {
        self.tables()
            .iter()
            .filter_map(|t| t.get_applied_index().map(|idx| (t.id(), LogIndex::new(idx))))
            .collect()
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            commit_id: self.sequence.snapshot().commit_id,
            tables: self.tables().iter().map(|t| t.snapshot()).collect(),
        }
    }

    /// Consistent view of every table as of `commit_id`
    pub fn committed_view(&self, commit_id: Id) -> CatalogSnapshot {
        CatalogSnapshot {
            commit_id,
            tables: self
                .tables()
                .iter()
                .filter_map(|t| t.committed_view(commit_id))
                .collect(),
        }
    }

    fn replay(self: &Arc<Self>) -> Result<()> {
        let mut entries = 0usize;
        for entry in self.store.replay()? {
            self.replay_entry(entry?)?;
            entries += 1;
        }
        let seq = self.sequence.snapshot();
        info!(
            entries,
            tables = self.tables.read().by_id.len(),
            commit_id = seq.commit_id,
            "catalog replayed"
        );
        Ok(())
    }

    fn replay_entry(self: &Arc<Self>, entry: LogEntry) -> Result<()> {
        let entry_type = entry.entry_type()?;
        debug!(%entry_type, bytes = entry.payload().len(), "replaying log entry");
        match entry_type {
            LogEntryType::CreateTable => self.replay_create_table(entry.unmarshal()?),
            LogEntryType::DropTable => self.replay_drop_table(entry.unmarshal()?),
            LogEntryType::CreateSegment => {
                let logged: SegmentLogEntry = entry.unmarshal()?;
                self.replay_table(logged.table_id)?
                    .replay_create_segment(logged, &self.sequence)
            }
            LogEntryType::UpgradeSegment | LogEntryType::DropSegment => {
                let logged: SegmentLogEntry = entry.unmarshal()?;
                self.sequence.observe_entry(&logged.base);
                self.replay_segment(logged.table_id, logged.base.id)?
                    .replay_update(&logged)
            }
            LogEntryType::CreateBlock => {
                let logged: BlockLogEntry = entry.unmarshal()?;
                self.replay_segment(logged.table_id, logged.segment_id)?
                    .replay_create_block(logged, &self.sequence)
            }
            LogEntryType::UpgradeBlock | LogEntryType::DropBlock => {
                let logged: BlockLogEntry = entry.unmarshal()?;
                self.sequence.observe_entry(&logged.base);
                let segment = self.replay_segment(logged.table_id, logged.segment_id)?;
                let block = segment.get_block(logged.base.id).ok_or_else(|| {
                    Error::invariant(format!(
                        "{} for unknown block {} of segment {}",
                        entry_type, logged.base.id, logged.segment_id
                    ))
                })?;
                block.replay_update(&logged)
            }
        }
    }

    fn replay_create_table(self: &Arc<Self>, logged: TableLogEntry) -> Result<()> {
        let TableLogEntry { base, schema } = logged;
        let id = base.id;
        if self.tables.read().by_id.contains_key(&id) {
            return Err(Error::invariant(format!("table {} created twice", id)));
        }
        let snapshot = TableSnapshot {
            base,
            schema,
            segments: Vec::new(),
        };
        let table = Table::rebuild(snapshot, self)?;

        let mut tables = self.tables.write();
        if !table.is_soft_deleted() {
            if let Some(other) = tables.names.get(table.name()) {
                return Err(Error::invariant(format!(
                    "table name {} held by both {} and {}",
                    table.name(),
                    other,
                    id
                )));
            }
            tables.names.insert(table.name().to_string(), id);
        }
        tables.by_id.insert(id, table);
        Ok(())
    }

    fn replay_drop_table(&self, logged: TableLogEntry) -> Result<()> {
        self.sequence.observe_entry(&logged.base);
        let table = self.replay_table(logged.base.id)?;
        table.replay_update(&logged)?;
        if table.is_soft_deleted() {
            let mut tables = self.tables.write();
            if tables.names.get(table.name()) == Some(&table.id()) {
                tables.names.remove(table.name());
            }
        }
        Ok(())
    }

    fn replay_table(&self, table_id: Id) -> Result<Arc<Table>> {
        self.get_table(table_id)
            .ok_or_else(|| Error::invariant(format!("log references unknown table {}", table_id)))
    }

    fn replay_segment(&self, table_id: Id, segment_id: Id) -> Result<Arc<Segment>> {
        self.replay_table(table_id)?.get_segment(segment_id).ok_or_else(|| {
            Error::invariant(format!(
                "log references unknown segment {} of table {}",
                segment_id, table_id
            ))
        })
    }
}
