#![allow(dead_code)]

use std::sync::{Arc, Once};

use flintmeta::config::{Config, SyncPolicy};
use flintmeta::storage::{Block, Catalog, MemLogStore, Schema, Segment, Table};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test subscriber once per test binary; `RUST_LOG` controls output
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// TestDb manages a file-backed catalog in an isolated temp directory
pub struct TestDb {
    dir: TempDir,
    config: Config,
    catalog: Option<Arc<Catalog>>,
}

impl TestDb {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let config = Config::new(dir.path()).with_sync(SyncPolicy::Never);
        let catalog = Catalog::open_dir(&config).expect("failed to open catalog");
        TestDb {
            dir,
            config,
            catalog: Some(catalog),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.catalog.as_ref().expect("catalog is open")
    }

    /// Drop the in-memory catalog and replay it from the log file
    pub fn restart(&mut self) -> &Arc<Catalog> {
        if let Some(catalog) = self.catalog.take() {
            catalog.sync().expect("sync before restart failed");
        }
        let catalog = Catalog::open_dir(&self.config).expect("failed to reopen catalog");
        self.catalog.insert(catalog)
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

/// Catalog over an in-memory log, plus a handle on that log for restarts
pub fn mem_catalog() -> (MemLogStore, Arc<Catalog>) {
    init_tracing();
    let store = MemLogStore::new();
    let catalog = Catalog::open(Box::new(store.clone())).expect("failed to open catalog");
    (store, catalog)
}

pub fn create_table(catalog: &Arc<Catalog>, name: &str, max_blocks: u64, block_rows: u64) -> Arc<Table> {
    catalog
        .simple_create_table(Schema::new(name, max_blocks, block_rows))
        .expect("create table failed")
}

pub fn fill(block: &Block) {
    let missing = block.capacity() - block.row_count();
    if missing > 0 {
        block.add_rows(missing).expect("fill block failed");
    }
}

/// Create `count` blocks in `segment`, filling all of them
pub fn fill_segment(catalog: &Catalog, segment: &Arc<Segment>, count: usize) -> Vec<Arc<Block>> {
    (0..count)
        .map(|_| {
            let blk = segment
                .simple_create_block(catalog, None)
                .expect("create block failed");
            fill(&blk);
            blk
        })
        .collect()
}
