use std::path::{Path, PathBuf};

use crate::storage::table::Schema;

/// When the file log store flushes appended entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync after every append
    Always,
    /// Leave flushing to the OS (or to an explicit `LogStore::sync`)
    Never,
}

pub struct Config {
    pub(crate) data_dir: PathBuf,
    pub(crate) sync: SyncPolicy,
    pub(crate) segment_max_blocks: u64,
    pub(crate) block_max_rows: u64,
}

pub const WAL_FILE_NAME: &str = "meta.wal";
pub const DEFAULT_SEGMENT_MAX_BLOCKS: u64 = 40;
pub const DEFAULT_BLOCK_MAX_ROWS: u64 = 80_000;

impl Config {
    pub fn from_args() -> Self {
        Config::new(".")
    }

    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Config {
            data_dir: data_dir.as_ref().to_path_buf(),
            sync: SyncPolicy::Always,
            segment_max_blocks: DEFAULT_SEGMENT_MAX_BLOCKS,
            block_max_rows: DEFAULT_BLOCK_MAX_ROWS,
        }
    }

    pub fn with_sync(mut self, sync: SyncPolicy) -> Self {
        self.sync = sync;
        self
    }

    /// Default limits for tables created through `schema`
    pub fn with_limits(mut self, segment_max_blocks: u64, block_max_rows: u64) -> Self {
        self.segment_max_blocks = segment_max_blocks;
        self.block_max_rows = block_max_rows;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn sync(&self) -> SyncPolicy {
        self.sync
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }

    /// Schema for a new table using the configured limits
    pub fn schema(&self, name: impl Into<String>) -> Schema {
        Schema::new(name, self.segment_max_blocks, self.block_max_rows)
    }
}
