//! Versioned metadata tree: catalog → table → segment → block.
//!
//! Every node carries a [`BaseEntry`](base::BaseEntry) whose commit chain
//! records its lifecycle. Changes are projected into log entries and appended
//! to a [`LogStore`](logstore::LogStore); opening a catalog replays them.

pub mod base;
pub mod block;
pub mod catalog;
pub mod log_entry;
pub mod logstore;
pub mod segment;
pub mod sequence;
pub mod table;
pub mod wal;

pub use base::{BaseEntry, CommitChain, CommitInfo, Id, LogIndex, Op};
pub use block::{Block, BlockSnapshot};
pub use catalog::{Catalog, CatalogSnapshot};
pub use log_entry::{BlockLogEntry, LogEntry, LogEntryType, SegmentLogEntry, TableLogEntry};
pub use logstore::{LogIter, LogStore, MemLogStore};
pub use segment::{Segment, SegmentSnapshot};
pub use sequence::{Sequence, SequenceSnapshot};
pub use table::{Schema, Table, TableSnapshot};
pub use wal::FileLogStore;
