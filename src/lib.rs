pub mod config;
pub mod error;
pub mod storage;

pub use config::{Config, SyncPolicy};
pub use error::{Error, Result};
pub use storage::{
    Block, Catalog, CatalogSnapshot, FileLogStore, LogIndex, LogStore, MemLogStore, Op, Schema,
    Segment, Table,
};
