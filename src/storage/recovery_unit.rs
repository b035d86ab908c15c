//! Recovery unit
//!
//! A handle on one storage-engine transaction: a point-in-time snapshot
//! plus a write buffer. A recovery unit that is dropped without an explicit
//! commit aborts, so no storage transaction leaks on exception paths.

use super::engine::storage_engine;
use crate::repl::Timestamp;

/// Where a snapshot's read timestamp is taken from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadSource {
    /// The all-committed boundary, gated by open oplog holes
    #[default]
    AllCommittedSnapshot,
    /// The newest position applied on this node
    LastAppliedSnapshot,
}

/// One storage-engine transaction
#[derive(Debug)]
pub struct RecoveryUnit {
    read_source: ReadSource,
    read_ts: Option<Timestamp>,
    prepare_ts: Option<Timestamp>,
    commit_ts: Option<Timestamp>,
    prepared: bool,
    committed: bool,
    aborted: bool,
    /// Oplog positions this unit holds open
    reserved_positions: Vec<Timestamp>,
}

impl RecoveryUnit {
    pub(super) fn new() -> Self {
        Self {
            read_source: ReadSource::default(),
            read_ts: None,
            prepare_ts: None,
            commit_ts: None,
            prepared: false,
            committed: false,
            aborted: false,
            reserved_positions: Vec::new(),
        }
    }

    /// Choose the boundary the snapshot will read at. Re-picks the read
    /// timestamp if a snapshot was already allocated from another source.
    pub fn set_timestamp_read_source(&mut self, source: ReadSource) {
        if self.read_source != source {
            self.read_source = source;
            self.read_ts = None;
        }
    }

    pub fn timestamp_read_source(&self) -> ReadSource {
        self.read_source
    }

    /// Establish the point-in-time snapshot now instead of lazily on the
    /// first read. Idempotent once a snapshot is allocated.
    pub fn preallocate_snapshot(&mut self) {
        assert!(self.is_active(), "cannot allocate a snapshot on a finished recovery unit");
        if self.read_ts.is_none() {
            self.read_ts = Some(match self.read_source {
                ReadSource::AllCommittedSnapshot => storage_engine().all_committed_timestamp(),
                ReadSource::LastAppliedSnapshot => storage_engine().last_applied_timestamp(),
            });
        }
    }

    /// The snapshot's read timestamp, if one has been allocated
    pub fn point_in_time_read_timestamp(&self) -> Option<Timestamp> {
        self.read_ts
    }

    pub fn set_prepare_timestamp(&mut self, ts: Timestamp) {
        assert!(!self.prepared, "prepare timestamp set after prepare");
        assert!(!ts.is_null(), "prepare timestamp cannot be null");
        storage_engine().observe_timestamp(ts);
        self.prepare_ts = Some(ts);
    }

    pub fn prepare_timestamp(&self) -> Option<Timestamp> {
        self.prepare_ts
    }

    /// Durably reserve this unit's locks and write intent at the prepare
    /// timestamp, awaiting an external commit decision.
    pub fn prepare(&mut self) {
        assert!(self.is_active(), "prepare on a finished recovery unit");
        assert!(
            self.prepare_ts.is_some(),
            "prepare requires a prepare timestamp"
        );
        self.prepared = true;
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn set_commit_timestamp(&mut self, ts: Timestamp) {
        assert!(!ts.is_null(), "commit timestamp cannot be null");
        storage_engine().observe_timestamp(ts);
        self.commit_ts = Some(ts);
    }

    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        self.commit_ts
    }

    /// Commit the storage transaction. Writes become visible at the commit
    /// timestamp when one was set, otherwise at a fresh timestamp.
    pub fn commit_unit_of_work(&mut self) {
        assert!(self.is_active(), "commit on a finished recovery unit");
        let ts = match self.commit_ts {
            Some(ts) => ts,
            None => storage_engine().next_timestamp(),
        };
        storage_engine().note_committed(ts);
        self.release_reserved_positions();
        self.committed = true;
    }

    /// Abort the storage transaction, releasing any oplog positions it
    /// holds open. Idempotent.
    pub fn abort_unit_of_work(&mut self) {
        if !self.is_active() {
            return;
        }
        self.release_reserved_positions();
        self.prepared = false;
        self.aborted = true;
    }

    /// Whether the unit has neither committed nor aborted
    pub fn is_active(&self) -> bool {
        !self.committed && !self.aborted
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Attach an oplog position this unit keeps open until it finishes
    pub fn note_reserved_position(&mut self, ts: Timestamp) {
        self.reserved_positions.push(ts);
    }

    fn release_reserved_positions(&mut self) {
        for ts in self.reserved_positions.drain(..) {
            storage_engine().release_reservation(ts);
        }
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        if self.is_active() {
            self.abort_unit_of_work();
        }
    }
}
