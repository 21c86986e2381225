use std::io;

use thiserror::Error;

use crate::storage::base::Id;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by catalog operations.
///
/// Structural-state errors (`UpgradeInfullSegment`, `UpgradeNotNeeded`,
/// `CapacityExceeded`, ...) are ordinary outcomes for the caller to act on.
/// `InvariantViolation`, `Codec` and `Io` are fatal for the current
/// commit or replay pass.
#[derive(Debug, Error)]
pub enum Error {
    /// Upgrade requested before every block of the segment is full
    #[error("upgrade infull segment {segment_id}")]
    UpgradeInfullSegment { segment_id: Id },

    /// Upgrade requested on a block that still accepts rows
    #[error("upgrade infull block {block_id}")]
    UpgradeInfullBlock { block_id: Id },

    /// Entry was already upgraded
    #[error("{kind} {id} already upgraded")]
    UpgradeNotNeeded { kind: &'static str, id: Id },

    /// Append attempted on a full block
    #[error("block {block_id} full: {row_count}/{capacity} rows, {requested} more requested")]
    CapacityExceeded {
        block_id: Id,
        row_count: u64,
        capacity: u64,
        requested: u64,
    },

    /// Segment does not accept new blocks
    #[error("segment {segment_id} cannot take more blocks")]
    SegmentFull { segment_id: Id },

    #[error("{kind} {id} is soft deleted")]
    AlreadyDeleted { kind: &'static str, id: Id },

    #[error("table already exists: {0}")]
    DuplicateTable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Id },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Corrupted state or log; aborts the enclosing commit or replay
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::InvariantViolation(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }

    /// True when the error must stop the current commit or replay pass
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvariantViolation(_) | Error::Codec(_) | Error::Io(_)
        )
    }
}
