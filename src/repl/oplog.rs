//! Replication log
//!
//! An in-memory ordered log of transaction records. Reserved positions that
//! have not been written yet are holes: they are tracked by the storage
//! engine and gate the all-committed boundary until filled or released.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::optime::{OplogSlot, Timestamp};
use crate::data::Document;
use crate::storage::engine::storage_engine;
use crate::txn::TxnNumber;

/// A single replicated write buffered by a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplOperation {
    pub kind: OperationKind,
    /// Target namespace, `db.collection`
    pub namespace: String,
    pub document: Document,
}

/// Kind of replicated write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl ReplOperation {
    pub fn insert(namespace: impl Into<String>, document: Document) -> Self {
        Self {
            kind: OperationKind::Insert,
            namespace: namespace.into(),
            document,
        }
    }

    pub fn update(namespace: impl Into<String>, document: Document) -> Self {
        Self {
            kind: OperationKind::Update,
            namespace: namespace.into(),
            document,
        }
    }

    pub fn delete(namespace: impl Into<String>, document: Document) -> Self {
        Self {
            kind: OperationKind::Delete,
            namespace: namespace.into(),
            document,
        }
    }

    /// Serialized size of this operation. This is an underestimate of the
    /// size of the eventual log entry, which carries framing overhead.
    pub fn serialized_size(&self) -> u64 {
        bincode::serialized_size(self).unwrap_or(0)
    }
}

/// Kind of transaction record in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Unprepared commit: the data and the commit decision in one record
    ApplyOps,
    Prepare,
    Commit,
    Abort,
}

/// A record written to the replication log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub timestamp: Timestamp,
    pub term: u64,
    pub kind: EntryKind,
    pub session_id: u64,
    pub txn_number: TxnNumber,
    /// Number of buffered operations folded into an ApplyOps record
    pub operation_count: usize,
    /// Commit timestamp carried by a prepared-commit record
    pub commit_timestamp: Option<Timestamp>,
}

/// The node's replication log
pub struct Oplog {
    entries: RwLock<BTreeMap<Timestamp, OplogEntry>>,
}

impl Oplog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Write an entry at a previously reserved position. Filling the
    /// position releases the corresponding hole and advances the
    /// last-applied boundary.
    pub fn write_at(&self, slot: OplogSlot, entry: OplogEntry) {
        let ts = slot.op_time.timestamp;
        assert!(!ts.is_null(), "cannot write an oplog entry at the null position");
        let mut entries = self.entries.write();
        assert!(
            !entries.contains_key(&ts),
            "oplog position {} already written",
            ts
        );
        entries.insert(ts, entry);
        drop(entries);

        storage_engine().release_reservation(ts);
        storage_engine().note_applied(ts);
    }

    /// Entry at an exact position, if written
    pub fn entry_at(&self, ts: Timestamp) -> Option<OplogEntry> {
        self.entries.read().get(&ts).cloned()
    }

    /// All written entries in log order
    pub fn entries(&self) -> Vec<OplogEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Latest written position
    pub fn latest_timestamp(&self) -> Timestamp {
        self.entries
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Timestamp::NULL)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for Oplog {
    fn default() -> Self {
        Self::new()
    }
}
