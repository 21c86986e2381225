use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier for tables, segments, blocks and transactions
pub type Id = u64;

/// State transition recorded by a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// Entry was created
    Create,
    /// Block reached its row capacity
    UpgradeFull,
    /// Segment was sorted and sealed
    UpgradeSorted,
    /// Entry was dropped but is still referenced by older views
    SoftDelete,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Create => write!(f, "create"),
            Op::UpgradeFull => write!(f, "upgrade-full"),
            Op::UpgradeSorted => write!(f, "upgrade-sorted"),
            Op::SoftDelete => write!(f, "soft-delete"),
        }
    }
}

/// Position in the external ingestion log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogIndex {
    /// Batch id in the ingestion log
    pub id: u64,
    /// First row of the batch covered by this index
    pub start: u64,
    /// Rows of the batch covered by this index
    pub count: u64,
    /// Total rows in the batch
    pub capacity: u64,
}

impl LogIndex {
    pub fn new(id: u64) -> Self {
        LogIndex {
            id,
            start: 0,
            count: 0,
            capacity: 0,
        }
    }

    pub fn with_range(id: u64, start: u64, count: u64, capacity: u64) -> Self {
        LogIndex {
            id,
            start,
            count,
            capacity,
        }
    }

    /// True when every row of the batch has been consumed
    pub fn is_batch_applied(&self) -> bool {
        self.start + self.count >= self.capacity
    }
}

/// One record in an entry's version chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub tran_id: Id,
    pub commit_id: Id,
    pub op: Op,
    pub applied_index: Option<LogIndex>,
    pub external_index: Option<LogIndex>,
    pub prev_index: Option<LogIndex>,
}

impl CommitInfo {
    /// Record committed under its own transaction id
    pub fn new(tran_id: Id, op: Op) -> Self {
        CommitInfo {
            tran_id,
            commit_id: tran_id,
            op,
            applied_index: None,
            external_index: None,
            prev_index: None,
        }
    }

    pub fn with_external_index(mut self, index: Option<LogIndex>) -> Self {
        self.external_index = index;
        self
    }

    pub fn with_applied_index(mut self, index: Option<LogIndex>) -> Self {
        self.applied_index = index;
        self
    }

    pub fn with_prev_index(mut self, index: Option<LogIndex>) -> Self {
        self.prev_index = index;
        self
    }
}

/// Append-only list of commit records ordered by commit id.
///
/// Records are never mutated or removed. The chain always holds at least the
/// record that created the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitChain {
    records: Vec<CommitInfo>,
}

impl CommitChain {
    pub fn new(first: CommitInfo) -> Self {
        CommitChain {
            records: vec![first],
        }
    }

    /// Append a record; its commit id must be greater than the last one
    pub fn append(&mut self, record: CommitInfo) -> Result<()> {
        let last = self.current().commit_id;
        if record.commit_id <= last {
            return Err(Error::invariant(format!(
                "commit id {} does not follow {}",
                record.commit_id, last
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn current(&self) -> &CommitInfo {
        // never empty
        &self.records[self.records.len() - 1]
    }

    pub fn first(&self) -> &CommitInfo {
        &self.records[0]
    }

    /// Last record with `commit_id <= id`, scanning from the newest
    pub fn as_of(&self, id: Id) -> Option<&CommitInfo> {
        self.records.iter().rev().find(|r| r.commit_id <= id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CommitInfo> {
        self.records.iter()
    }

    fn is_sorted(&self) -> bool {
        self.records.windows(2).all(|w| w[0].commit_id < w[1].commit_id)
    }
}

/// Identity plus version chain, embedded in every catalog object.
///
/// A `BaseEntry` has no lock of its own: the object embedding it guards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseEntry {
    pub id: Id,
    chain: CommitChain,
}

impl BaseEntry {
    pub fn new(id: Id, first: CommitInfo) -> Self {
        BaseEntry {
            id,
            chain: CommitChain::new(first),
        }
    }

    pub fn chain(&self) -> &CommitChain {
        &self.chain
    }

    pub fn current(&self) -> &CommitInfo {
        self.chain.current()
    }

    pub fn as_of(&self, commit_id: Id) -> Option<&CommitInfo> {
        self.chain.as_of(commit_id)
    }

    pub fn append_commit(&mut self, record: CommitInfo) -> Result<()> {
        self.chain.append(record)
    }

    /// Commit id at which the entry came into existence
    pub fn created_at(&self) -> Id {
        self.chain.first().commit_id
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.current().op == Op::SoftDelete
    }

    pub fn is_sorted(&self) -> bool {
        self.current().op == Op::UpgradeSorted
    }

    pub fn is_full(&self) -> bool {
        self.current().op == Op::UpgradeFull
    }

    pub fn get_applied_index(&self) -> Option<u64> {
        self.current().applied_index.map(|idx| idx.id)
    }

    /// Check a deserialized entry before it is attached to the tree
    pub fn validate(&self) -> Result<()> {
        if self.chain.is_empty() {
            return Err(Error::invariant(format!(
                "entry {} has an empty commit chain",
                self.id
            )));
        }
        if !self.chain.is_sorted() {
            return Err(Error::invariant(format!(
                "commit chain of entry {} is not ordered by commit id",
                self.id
            )));
        }
        Ok(())
    }

    /// Entry as it was at `commit_id`; `None` if it did not exist yet
    pub fn committed(&self, commit_id: Id) -> Option<BaseEntry> {
        let kept = self
            .chain
            .records
            .iter()
            .take_while(|r| r.commit_id <= commit_id)
            .cloned()
            .collect::<Vec<_>>();
        if kept.is_empty() {
            return None;
        }
        Some(BaseEntry {
            id: self.id,
            chain: CommitChain { records: kept },
        })
    }

    /// Append the records of a logged copy of this entry that are newer than
    /// ours. Both chains must agree on every record they share.
    pub fn merge(&mut self, logged: &BaseEntry) -> Result<usize> {
        if logged.id != self.id {
            return Err(Error::invariant(format!(
                "cannot merge entry {} into entry {}",
                logged.id, self.id
            )));
        }
        logged.validate()?;
        let shared = self.chain.len().min(logged.chain.len());
        if self.chain.records[..shared] != logged.chain.records[..shared] {
            return Err(Error::invariant(format!(
                "logged chain of entry {} diverges from replayed state",
                self.id
            )));
        }
        let mut appended = 0;
        for record in &logged.chain.records[shared..] {
            self.chain.append(record.clone())?;
            appended += 1;
        }
        Ok(appended)
    }
}

impl fmt::Display for BaseEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cur = self.current();
        write!(
            f,
            "id={} op={} commit={} tran={} versions={}",
            self.id,
            cur.op,
            cur.commit_id,
            cur.tran_id,
            self.chain.len()
        )
    }
}
