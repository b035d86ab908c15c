//! Operation context
//!
//! Each worker thread runs one operation at a time, bound to an
//! `OperationContext` that owns the operation's lock state, recovery unit,
//! and (inside a transaction) the top-level write unit of work. The lock
//! state and recovery unit may only be swapped while holding the client
//! mutex, because the expiration sweeper reads the operation through the
//! client from another thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::lock::LockState;
use crate::repl::{OpTime, ReadConcernArgs};
use crate::session::Session;
use crate::storage::{storage_engine, RecoveryUnit, RecoveryUnitState, WriteUnitOfWork};
use crate::txn::TxnNumber;
use crate::{Result, TxnError};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Client
// ============================================================================

/// Replication bookkeeping carried per client
#[derive(Debug, Default)]
pub struct ReplClientInfo {
    last_op: OpTime,
}

/// One connected client
pub struct Client {
    id: u64,
    host: String,
    /// Held while the lock state or recovery unit of an operation bound to
    /// this client is swapped
    mutex: Mutex<()>,
    repl_info: Mutex<ReplClientInfo>,
}

/// Witness that the client mutex is held
pub struct ClientGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

impl Client {
    pub fn new(host: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst),
            host: host.into(),
            mutex: Mutex::new(()),
            repl_info: Mutex::new(ReplClientInfo::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Lock the client for a resource swap
    pub fn lock(&self) -> ClientGuard<'_> {
        ClientGuard(self.mutex.lock())
    }

    /// The newest op-time this client has observed
    pub fn last_op(&self) -> OpTime {
        self.repl_info.lock().last_op
    }

    /// Advance the client's observed op-time. Never moves backward.
    pub fn advance_last_op(&self, op_time: OpTime) {
        let mut info = self.repl_info.lock();
        if op_time > info.last_op {
            info.last_op = op_time;
        }
    }
}

// ============================================================================
// Operation Handle
// ============================================================================

/// Shared handle to a running operation, used by the expiration sweeper to
/// kill it from another thread.
pub struct OperationHandle {
    client: Arc<Client>,
    killed: Mutex<Option<TxnError>>,
}

impl OperationHandle {
    fn new(client: Arc<Client>) -> Arc<Self> {
        Arc::new(Self {
            client,
            killed: Mutex::new(None),
        })
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Mark the operation killed. The operation observes this at its next
    /// interrupt check.
    pub fn kill(&self, error: TxnError) {
        let mut killed = self.killed.lock();
        if killed.is_none() {
            *killed = Some(error);
        }
    }

    pub fn killed(&self) -> Option<TxnError> {
        self.killed.lock().clone()
    }
}

// ============================================================================
// Operation Context
// ============================================================================

/// The per-operation execution state a worker thread carries
pub struct OperationContext {
    session: Arc<Session>,
    client: Arc<Client>,
    handle: Arc<OperationHandle>,
    txn_number: Option<TxnNumber>,
    lock_state: LockState,
    recovery_unit: RecoveryUnit,
    ru_state: RecoveryUnitState,
    write_unit: Option<WriteUnitOfWork>,
    read_concern: ReadConcernArgs,
}

impl OperationContext {
    /// Bind a new operation to a session. Takes an execution ticket and
    /// registers the operation with the session for the sweeper.
    pub fn new(
        session: Arc<Session>,
        client: Arc<Client>,
        txn_number: Option<TxnNumber>,
    ) -> Result<Self> {
        let mut lock_state = LockState::new();
        lock_state.acquire_ticket()?;

        let handle = OperationHandle::new(Arc::clone(&client));
        session.set_current_operation(Arc::clone(&handle));

        Ok(Self {
            session,
            client,
            handle,
            txn_number,
            lock_state,
            recovery_unit: storage_engine().new_recovery_unit(),
            ru_state: RecoveryUnitState::NotInUnitOfWork,
            write_unit: None,
            read_concern: ReadConcernArgs::default(),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn handle(&self) -> &Arc<OperationHandle> {
        &self.handle
    }

    pub fn txn_number(&self) -> Option<TxnNumber> {
        self.txn_number
    }

    /// Surface a kill injected by the sweeper or a session kill
    pub fn check_for_interrupt(&self) -> Result<()> {
        match self.handle.killed() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---- read concern ----

    pub fn read_concern(&self) -> &ReadConcernArgs {
        &self.read_concern
    }

    pub fn set_read_concern(&mut self, args: ReadConcernArgs) {
        self.read_concern = args;
    }

    // ---- lock state ----

    pub fn lock_state(&self) -> &LockState {
        &self.lock_state
    }

    pub fn lock_state_mut(&mut self) -> &mut LockState {
        &mut self.lock_state
    }

    /// Swap the operation's lock state. The client mutex must be held.
    pub fn swap_lock_state(&mut self, _client_lock: &ClientGuard<'_>, new: LockState) -> LockState {
        std::mem::replace(&mut self.lock_state, new)
    }

    // ---- recovery unit ----

    pub fn recovery_unit(&self) -> &RecoveryUnit {
        &self.recovery_unit
    }

    pub fn recovery_unit_mut(&mut self) -> &mut RecoveryUnit {
        &mut self.recovery_unit
    }

    pub fn recovery_unit_state(&self) -> RecoveryUnitState {
        self.ru_state
    }

    /// Replace the operation's recovery unit. The client mutex must be
    /// held. Returns the prior unit and its state.
    pub fn replace_recovery_unit(
        &mut self,
        _client_lock: &ClientGuard<'_>,
        new: RecoveryUnit,
        new_state: RecoveryUnitState,
    ) -> (RecoveryUnit, RecoveryUnitState) {
        let old_state = std::mem::replace(&mut self.ru_state, new_state);
        let old = std::mem::replace(&mut self.recovery_unit, new);
        (old, old_state)
    }

    // ---- write unit of work ----

    pub fn write_unit_of_work(&self) -> Option<&WriteUnitOfWork> {
        self.write_unit.as_ref()
    }

    pub fn has_write_unit_of_work(&self) -> bool {
        self.write_unit.is_some()
    }

    /// Open the top-level write unit of work for a transaction statement
    pub fn begin_write_unit_of_work(&mut self) {
        assert!(
            self.write_unit.is_none(),
            "write unit of work already active"
        );
        self.lock_state.begin_write_unit_of_work();
        self.ru_state = RecoveryUnitState::ActiveUnitOfWork;
        self.write_unit = Some(WriteUnitOfWork::new());
    }

    /// Detach the active write unit of work, leaving the storage snapshot
    /// running. Returns the checkpoint needed to resume it. The lock
    /// state's nesting is intentionally untouched: it travels with the
    /// captured lock state.
    pub fn release_write_unit_of_work(&mut self) -> RecoveryUnitState {
        let wuow = self
            .write_unit
            .take()
            .expect("no write unit of work to release");
        wuow.release()
    }

    /// Rebuild the write unit of work from a released checkpoint
    pub fn resume_write_unit_of_work(&mut self, state: RecoveryUnitState) {
        assert!(self.write_unit.is_none(), "write unit of work already active");
        self.write_unit = Some(WriteUnitOfWork::resume_from(state));
        self.ru_state = RecoveryUnitState::ActiveUnitOfWork;
    }

    /// Prepare the active write unit of work at the recovery unit's
    /// prepare timestamp.
    pub fn prepare_write_unit_of_work(&mut self) {
        let wuow = self
            .write_unit
            .as_mut()
            .expect("no write unit of work to prepare");
        self.recovery_unit.prepare();
        wuow.mark_prepared();
    }

    /// Commit the active write unit of work and the storage transaction
    /// under it.
    pub fn commit_write_unit_of_work(&mut self) {
        let mut wuow = self
            .write_unit
            .take()
            .expect("no write unit of work to commit");
        self.recovery_unit.commit_unit_of_work();
        wuow.mark_committed();
        self.lock_state.end_write_unit_of_work();
        self.ru_state = RecoveryUnitState::NotInUnitOfWork;
    }

    /// Drop the active write unit of work without committing, aborting the
    /// storage transaction under it. No-op when none is active.
    pub fn clear_write_unit_of_work(&mut self) {
        if let Some(wuow) = self.write_unit.take() {
            if !wuow.is_committed() {
                self.lock_state.end_write_unit_of_work();
                self.recovery_unit.abort_unit_of_work();
            }
            self.ru_state = RecoveryUnitState::NotInUnitOfWork;
        }
    }
}

impl Drop for OperationContext {
    fn drop(&mut self) {
        self.session.clear_current_operation(&self.handle);
    }
}
