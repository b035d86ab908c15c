//! Replication coordinator
//!
//! Supplies the current replication term and allocates ordered oplog
//! positions. Allocating a position registers a hole with the storage
//! engine; the hole is tied to the recovery unit of the requesting
//! operation so that aborting the side transaction releases it.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;

use super::oplog::Oplog;
use super::optime::OpTime;
use crate::ops::OperationContext;
use crate::storage::engine::storage_engine;

static REPLICATION_COORDINATOR: Lazy<ReplicationCoordinator> =
    Lazy::new(ReplicationCoordinator::new);

/// Get the global replication coordinator
pub fn replication_coordinator() -> &'static ReplicationCoordinator {
    &REPLICATION_COORDINATOR
}

pub struct ReplicationCoordinator {
    term: AtomicU64,
    oplog: Oplog,
}

impl ReplicationCoordinator {
    fn new() -> Self {
        Self {
            term: AtomicU64::new(1),
            oplog: Oplog::new(),
        }
    }

    /// Current replication term
    pub fn get_term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    /// Advance the term (election)
    pub fn step_up(&self) -> u64 {
        self.term.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reserve the next position in the oplog. The position is a hole that
    /// blocks snapshot and after-cluster-time readers until the caller
    /// either writes an entry there or aborts the reserving recovery unit.
    pub fn get_next_op_time(&self, op_ctx: &mut OperationContext) -> OpTime {
        let ts = storage_engine().reserve_timestamp();
        op_ctx.recovery_unit_mut().note_reserved_position(ts);
        OpTime::new(ts, self.get_term())
    }

    /// The node's replication log
    pub fn oplog(&self) -> &Oplog {
        &self.oplog
    }
}
