use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::log_entry::LogEntry;

/// Lazily decoded sequence of log entries
pub type LogIter<'a> = Box<dyn Iterator<Item = Result<LogEntry>> + 'a>;

/// Append-only, crash-safe sequence of serialized catalog changes.
///
/// The catalog only appends while running and only replays at startup.
/// Durability of an appended entry is up to the implementation.
pub trait LogStore: Send + Sync {
    /// Entry for the catalog to fill in before `append`
    fn allocate_empty_entry(&self) -> LogEntry {
        LogEntry::empty()
    }

    /// Append an entry; returns its position in the log
    fn append(&self, entry: LogEntry) -> Result<u64>;

    /// Every entry in append order. Calling it again restarts from the head.
    fn replay(&self) -> Result<LogIter<'_>>;

    /// Flush appended entries to stable storage
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory log store.
///
/// Clones share the same entries, so a test can drop a catalog and reopen a
/// new one over the surviving log.
#[derive(Debug, Clone, Default)]
pub struct MemLogStore {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        MemLogStore::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of every appended entry
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Drop every entry after the first `len`, as if they never reached disk
    pub fn truncate(&self, len: usize) {
        self.entries.lock().truncate(len);
    }

    /// Append a raw entry without going through a catalog
    pub fn push_raw(&self, entry: LogEntry) {
        self.entries.lock().push(entry);
    }
}

impl LogStore for MemLogStore {
    fn append(&self, entry: LogEntry) -> Result<u64> {
        let mut entries = self.entries.lock();
        entries.push(entry);
        Ok(entries.len() as u64 - 1)
    }

    fn replay(&self) -> Result<LogIter<'_>> {
        let entries = self.entries.lock().clone();
        Ok(Box::new(entries.into_iter().map(Ok)))
    }
}
