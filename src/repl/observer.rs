//! Operation observer
//!
//! The seam through which the participant publishes transaction records to
//! the replication log. Every callback re-enters the participant, so the
//! participant releases its mutex before invoking any of them and
//! re-validates the active transaction after reacquiring it.

use std::sync::Arc;

use once_cell::sync::Lazy;

use super::coordinator::replication_coordinator;
use super::oplog::{EntryKind, OplogEntry};
use super::optime::{OplogSlot, Timestamp};
use crate::ops::OperationContext;
use crate::txn::UNINITIALIZED_TXN_NUMBER;
use crate::Result;

/// Observer of transaction lifecycle events
pub trait OpObserver: Send + Sync {
    /// The transaction reached the prepared state; its record belongs at
    /// the reserved slot.
    fn on_transaction_prepare(&self, op_ctx: &mut OperationContext, slot: OplogSlot) -> Result<()>;

    /// The transaction is committing. A prepared commit supplies the
    /// reserved commit slot and the commit timestamp; an unprepared commit
    /// supplies neither and folds its operations into a single record.
    fn on_transaction_commit(
        &self,
        op_ctx: &mut OperationContext,
        commit_slot: Option<OplogSlot>,
        commit_timestamp: Option<Timestamp>,
    ) -> Result<()>;

    /// The transaction is aborting.
    fn on_transaction_abort(&self, op_ctx: &mut OperationContext) -> Result<()>;
}

static OP_OBSERVER: Lazy<OplogWriter> = Lazy::new(|| OplogWriter);

/// Get the node's operation observer
pub fn op_observer() -> &'static dyn OpObserver {
    &*OP_OBSERVER
}

/// The production observer: writes transaction records into the oplog
pub struct OplogWriter;

impl OplogWriter {
    fn make_entry(
        op_ctx: &OperationContext,
        slot: OplogSlot,
        kind: EntryKind,
        operation_count: usize,
        commit_timestamp: Option<Timestamp>,
    ) -> OplogEntry {
        OplogEntry {
            timestamp: slot.op_time.timestamp,
            term: slot.op_time.term,
            kind,
            session_id: op_ctx.session().session_id(),
            txn_number: op_ctx.txn_number().unwrap_or(UNINITIALIZED_TXN_NUMBER),
            operation_count,
            commit_timestamp,
        }
    }
}

impl OpObserver for OplogWriter {
    fn on_transaction_prepare(&self, op_ctx: &mut OperationContext, slot: OplogSlot) -> Result<()> {
        let session = Arc::clone(op_ctx.session());
        let operations = session
            .participant()
            .end_transaction_and_retrieve_operations(op_ctx)?;

        let entry = Self::make_entry(op_ctx, slot, EntryKind::Prepare, operations.len(), None);
        replication_coordinator().oplog().write_at(slot, entry);
        log::debug!(
            "wrote prepare oplog entry for transaction {} at {}",
            op_ctx.txn_number().unwrap_or(UNINITIALIZED_TXN_NUMBER),
            slot.op_time
        );
        Ok(())
    }

    fn on_transaction_commit(
        &self,
        op_ctx: &mut OperationContext,
        commit_slot: Option<OplogSlot>,
        commit_timestamp: Option<Timestamp>,
    ) -> Result<()> {
        match commit_slot {
            Some(slot) => {
                // Prepared commit: the record fills the reserved slot.
                let entry =
                    Self::make_entry(op_ctx, slot, EntryKind::Commit, 0, commit_timestamp);
                replication_coordinator().oplog().write_at(slot, entry);
            }
            None => {
                // Unprepared commit: data and decision in one record.
                let session = Arc::clone(op_ctx.session());
                let operations = session
                    .participant()
                    .end_transaction_and_retrieve_operations(op_ctx)?;
                if operations.is_empty() {
                    return Ok(());
                }
                let op_time = replication_coordinator().get_next_op_time(op_ctx);
                let slot = OplogSlot::new(op_time);
                let entry =
                    Self::make_entry(op_ctx, slot, EntryKind::ApplyOps, operations.len(), None);
                replication_coordinator().oplog().write_at(slot, entry);
            }
        }
        Ok(())
    }

    fn on_transaction_abort(&self, op_ctx: &mut OperationContext) -> Result<()> {
        if op_ctx.txn_number().is_none() {
            return Ok(());
        }
        let op_time = replication_coordinator().get_next_op_time(op_ctx);
        let slot = OplogSlot::new(op_time);
        let entry = Self::make_entry(op_ctx, slot, EntryKind::Abort, 0, None);
        replication_coordinator().oplog().write_at(slot, entry);
        Ok(())
    }
}
