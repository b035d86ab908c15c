//! Transaction resource capsules
//!
//! `TxnResources` detaches a transaction's lock state, recovery unit, and
//! write-unit-of-work checkpoint from an operation context so the
//! transaction can survive between statements; `release` reattaches them.
//! `OplogSlotReserver` holds one reserved oplog position open through a
//! side transaction. `SideTransactionBlock` suspends an active transaction
//! around a nested unit of work. All three abort their embedded storage
//! transaction on drop if they were never handed back, so exception paths
//! cannot leak a storage transaction.

use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::lock::{ClientState, LockState};
use crate::ops::OperationContext;
use crate::repl::coordinator::replication_coordinator;
use crate::repl::{OplogSlot, ReadConcernArgs};
use crate::storage::{storage_engine, RecoveryUnit, RecoveryUnitState};
use crate::Result;

// ============================================================================
// TxnResources
// ============================================================================

/// A transaction's resources, detached from any operation context
pub struct TxnResources {
    lock_state: Option<LockState>,
    recovery_unit: Option<RecoveryUnit>,
    wuow_checkpoint: RecoveryUnitState,
    read_concern: ReadConcernArgs,
    released: bool,
}

impl TxnResources {
    /// Capture the transaction resources off `op_ctx`, leaving it with a
    /// fresh empty lock state and recovery unit. `keep_ticket` retains the
    /// execution ticket on the captured lock state; stashing between
    /// statements gives the ticket back.
    pub fn capture(op_ctx: &mut OperationContext, keep_ticket: bool) -> Self {
        let client = Arc::clone(op_ctx.client());
        let client_lock = client.lock();

        let wuow_checkpoint = op_ctx.release_write_unit_of_work();

        let mut lock_state = op_ctx.swap_lock_state(&client_lock, LockState::new());
        if !keep_ticket {
            lock_state.release_ticket();
        }
        lock_state.unset_thread_tag();

        // This transaction must still respect the transaction lock timeout,
        // since it can prevent the transaction from making progress.
        let max_lock_millis = config::max_transaction_lock_request_timeout_millis();
        if max_lock_millis >= 0 {
            lock_state.set_max_lock_timeout(Duration::from_millis(max_lock_millis as u64));
        }

        let (recovery_unit, _) = op_ctx.replace_recovery_unit(
            &client_lock,
            storage_engine().new_recovery_unit(),
            RecoveryUnitState::NotInUnitOfWork,
        );
        drop(client_lock);

        let read_concern = op_ctx.read_concern().clone();

        Self {
            lock_state: Some(lock_state),
            recovery_unit: Some(recovery_unit),
            wuow_checkpoint,
            read_concern,
            released: false,
        }
    }

    /// Reattach the captured resources to `op_ctx`. The ticket is
    /// reacquired before anything is marked released, so a failure leaves
    /// the resources stashable.
    pub fn release(&mut self, op_ctx: &mut OperationContext) -> Result<()> {
        assert!(!self.released, "resources released twice");

        let lock_state = self
            .lock_state
            .as_mut()
            .expect("released resources have no lock state");
        if !lock_state.has_ticket() {
            op_ctx.check_for_interrupt()?;
            lock_state.reacquire_ticket()?;
        }

        self.released = true;

        let client = Arc::clone(op_ctx.client());
        let client_lock = client.lock();
        assert_eq!(
            op_ctx.lock_state().client_state(),
            ClientState::Inactive,
            "cannot swap the lock state of an operation inside the lock manager"
        );

        let mut restored = self.lock_state.take().expect("lock state taken twice");
        restored.tag_current_thread();
        // The swapped-out lock state is just the empty one installed at
        // capture time; it is dropped here.
        let _empty = op_ctx.swap_lock_state(&client_lock, restored);

        let restored_ru = self.recovery_unit.take().expect("recovery unit taken twice");
        let (_old_ru, old_state) =
            op_ctx.replace_recovery_unit(&client_lock, restored_ru, RecoveryUnitState::NotInUnitOfWork);
        assert_eq!(
            old_state,
            RecoveryUnitState::NotInUnitOfWork,
            "recovery unit state was {:?}",
            old_state
        );
        drop(client_lock);

        op_ctx.resume_write_unit_of_work(self.wuow_checkpoint);
        op_ctx.set_read_concern(self.read_concern.clone());
        Ok(())
    }

    pub fn lock_state(&self) -> Option<&LockState> {
        self.lock_state.as_ref()
    }

    pub fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }
}

impl Drop for TxnResources {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Only reached when aborting a transaction that is not active, e.g.
        // starting a new transaction before completing an old one. The
        // embedded unit of work is at nesting level 1.
        if let (Some(mut lock_state), Some(mut recovery_unit)) =
            (self.lock_state.take(), self.recovery_unit.take())
        {
            lock_state.end_write_unit_of_work();
            assert!(!lock_state.in_a_write_unit_of_work());
            recovery_unit.abort_unit_of_work();
        }
    }
}

// ============================================================================
// SideTransactionBlock
// ============================================================================

/// Suspends any active transaction on the operation context for the scope
/// of a nested, independent unit of work, restoring it on every exit path.
pub struct SideTransactionBlock<'a> {
    op_ctx: &'a mut OperationContext,
    resources: Option<TxnResources>,
}

impl<'a> SideTransactionBlock<'a> {
    pub fn enter(op_ctx: &'a mut OperationContext) -> Self {
        let resources = if op_ctx.has_write_unit_of_work() {
            Some(TxnResources::capture(op_ctx, true /* keep ticket */))
        } else {
            None
        };
        Self { op_ctx, resources }
    }

    pub fn op_ctx(&mut self) -> &mut OperationContext {
        self.op_ctx
    }
}

impl Drop for SideTransactionBlock<'_> {
    fn drop(&mut self) {
        if let Some(mut resources) = self.resources.take() {
            // The ticket was kept, so this release cannot block on the
            // pool; a failure here would strand a suspended transaction.
            if resources.release(self.op_ctx).is_err() {
                crate::fatal("failed to restore suspended transaction resources");
            }
        }
    }
}

// ============================================================================
// OplogSlotReserver
// ============================================================================

/// Reserves one oplog position through a side transaction and keeps the
/// resulting log hole open until dropped. The hole blocks snapshot and
/// after-cluster-time readers until the enclosing prepare or commit writes
/// its record at the reserved position.
pub struct OplogSlotReserver {
    slot: OplogSlot,
    lock_state: Option<LockState>,
    recovery_unit: Option<RecoveryUnit>,
}

impl OplogSlotReserver {
    pub fn reserve(op_ctx: &mut OperationContext) -> Self {
        // Stash the active transaction for the duration of the reservation;
        // it is restored onto the context when the block drops below.
        let mut side_txn = SideTransactionBlock::enter(op_ctx);
        let op_ctx = side_txn.op_ctx();

        // Open a fresh unit of work and reserve the next log position.
        op_ctx.begin_write_unit_of_work();
        let op_time = replication_coordinator().get_next_op_time(op_ctx);

        // Detach the unit of work: its abort path now belongs to this
        // reserver, not the operation context.
        let _checkpoint = op_ctx.release_write_unit_of_work();

        let client = Arc::clone(op_ctx.client());
        let client_lock = client.lock();
        assert_eq!(
            op_ctx.lock_state().client_state(),
            ClientState::Inactive,
            "cannot swap the lock state of an operation inside the lock manager"
        );
        let mut lock_state = op_ctx.swap_lock_state(&client_lock, LockState::new());
        lock_state.unset_thread_tag();

        // This thread must still respect the transaction lock timeout,
        // since it can prevent the transaction from making progress.
        let max_lock_millis = config::max_transaction_lock_request_timeout_millis();
        if max_lock_millis >= 0 {
            op_ctx
                .lock_state_mut()
                .set_max_lock_timeout(Duration::from_millis(max_lock_millis as u64));
        }

        let (recovery_unit, _) = op_ctx.replace_recovery_unit(
            &client_lock,
            storage_engine().new_recovery_unit(),
            RecoveryUnitState::NotInUnitOfWork,
        );
        drop(client_lock);

        Self {
            slot: OplogSlot::new(op_time),
            lock_state: Some(lock_state),
            recovery_unit: Some(recovery_unit),
        }
    }

    /// The reserved log position
    pub fn reserved_slot(&self) -> OplogSlot {
        self.slot
    }
}

impl Drop for OplogSlotReserver {
    fn drop(&mut self) {
        // The side unit of work is at nesting level 1, only the top level
        // for the reservation. Aborting the recovery unit releases the log
        // hole if no record was written at the reserved position.
        if let (Some(mut lock_state), Some(mut recovery_unit)) =
            (self.lock_state.take(), self.recovery_unit.take())
        {
            lock_state.end_write_unit_of_work();
            assert!(!lock_state.in_a_write_unit_of_work());
            recovery_unit.abort_unit_of_work();
        }
    }
}
