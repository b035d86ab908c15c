//! Transaction participant
//!
//! One participant per session. All lifecycle state lives behind the
//! participant mutex; the metrics observer has its own mutex, always
//! acquired strictly inside the participant mutex. The mutex is released
//! before every call into the operation observer (which re-enters the
//! participant) and before storage commit on the prepared path, and the
//! active-transaction invariant is re-checked after each reacquisition,
//! because session migration or kill may have advanced state in between.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::config::{self, ClusterRole};
use crate::failpoint::{HANG_AFTER_PREALLOCATE_SNAPSHOT, HANG_AFTER_RESERVING_PREPARE_TIMESTAMP};
use crate::ops::OperationContext;
use crate::repl::coordinator::replication_coordinator;
use crate::repl::{op_observer, OpTime, OplogSlot, ReadConcernArgs, ReplOperation, Timestamp};
use crate::session::{RefreshState, SessionState};
use crate::storage::{storage_engine, ReadSource, RecoveryUnitState};
use crate::txn::metrics::TransactionMetricsObserver;
use crate::txn::resources::{OplogSlotReserver, TxnResources};
use crate::txn::state::{StateMachine, StateSet, TransactionState, TransitionValidation};
use crate::txn::{
    gating, TxnNumber, MAX_TRANSACTION_OPERATIONS_BYTES, UNINITIALIZED_TXN_NUMBER,
};
use crate::{fatal, Result, TxnError};

/// Which boundary the transaction's speculative snapshot reads at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeculativeTransactionOpTime {
    AllCommitted,
    LastApplied,
}

/// The per-session transaction participant
pub struct TransactionParticipant {
    session: Arc<SessionState>,
    inner: Mutex<ParticipantInner>,
    metrics: Mutex<TransactionMetricsObserver>,
}

pub(super) struct ParticipantInner {
    pub(super) active_txn_number: TxnNumber,
    pub(super) state: StateMachine,
    /// None for retryable writes, Some(false) for multi-document
    /// transactions. Commands can never specify autocommit=true.
    pub(super) autocommit: Option<bool>,
    pub(super) stash: Option<TxnResources>,
    operations: Vec<ReplOperation>,
    operation_bytes: u64,
    prepare_op_time: OpTime,
    /// Timestamp of the first oplog entry written by this transaction. Set
    /// exactly once per prepared-transaction lifetime.
    oldest_oplog_entry_ts: Option<Timestamp>,
    speculative_read_op_time: OpTime,
    expire_date: Option<Instant>,
    last_refresh_count: u64,
    /// The outstanding restart-after-prepared-abort case, surfaced so
    /// callers can distinguish it from an ordinary aborted restart.
    aborted_after_prepare: bool,
    in_shutdown: bool,
}

impl TransactionParticipant {
    pub fn new(session: Arc<SessionState>) -> Self {
        Self {
            session,
            inner: Mutex::new(ParticipantInner {
                active_txn_number: UNINITIALIZED_TXN_NUMBER,
                state: StateMachine::new(),
                autocommit: None,
                stash: None,
                operations: Vec::new(),
                operation_bytes: 0,
                prepare_op_time: OpTime::null(),
                oldest_oplog_entry_ts: None,
                speculative_read_op_time: OpTime::null(),
                expire_date: None,
                last_refresh_count: 0,
                aborted_after_prepare: false,
                in_shutdown: false,
            }),
            metrics: Mutex::new(TransactionMetricsObserver::new()),
        }
    }

    // ========================================================================
    // Begin / continue
    // ========================================================================

    /// Entry point of every statement carrying a transaction number.
    /// Requests without `autocommit` are retryable writes; `autocommit`
    /// must otherwise be false, with `start_transaction` beginning a new
    /// multi-document transaction.
    pub fn begin_or_continue(
        &self,
        txn_number: TxnNumber,
        autocommit: Option<bool>,
        start_transaction: Option<bool>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();

        if let Some(refresh) = self.session.last_refresh_state() {
            self.update_state(&mut inner, refresh);
        }

        let autocommit = match autocommit {
            None => {
                if start_transaction.is_some() {
                    return Err(TxnError::InvalidOptions(
                        "cannot specify startTransaction on a retryable write".to_string(),
                    ));
                }
                return self.begin_or_continue_retryable_write(&mut inner, txn_number);
            }
            Some(true) => {
                return Err(TxnError::InvalidOptions(
                    "autocommit can only be specified as false on a multi-statement transaction"
                        .to_string(),
                ));
            }
            Some(false) => false,
        };
        debug_assert!(!autocommit);

        let start_transaction = match start_transaction {
            None => return self.continue_multi_document_transaction(&mut inner, txn_number),
            Some(false) => {
                return Err(TxnError::InvalidOptions(
                    "startTransaction can only be specified as true".to_string(),
                ));
            }
            Some(true) => true,
        };
        debug_assert!(start_transaction);

        // Servers in a sharded cluster can start a new transaction at the
        // active transaction number to allow internal retries by routers on
        // re-targeting errors.
        if txn_number == inner.active_txn_number {
            if config::cluster_role() == ClusterRole::None {
                return Err(TxnError::ConflictingOperationInProgress(
                    "only servers in a sharded cluster can start a new transaction at the \
                     active transaction number"
                        .to_string(),
                ));
            }
            // The active transaction number can only be reused if the
            // transaction is not in a state that indicates it has been
            // involved in a two phase commit.
            let restartable = TransactionState::InProgress | TransactionState::Aborted;
            if !inner.state.is_in_set(restartable) {
                return Err(TxnError::ConflictingOperationInProgress(format!(
                    "cannot start a transaction at given transaction number {}; a transaction \
                     with the same number is in state {}",
                    txn_number,
                    inner.state.current()
                )));
            }
        }

        self.begin_multi_document_transaction(&mut inner, txn_number)
    }

    /// Migration/recovery entry point: starts a transaction without the
    /// state checks of `begin_or_continue`.
    pub fn begin_transaction_unconditionally(&self, txn_number: TxnNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        self.begin_multi_document_transaction(&mut inner, txn_number)
    }

    fn begin_or_continue_retryable_write(
        &self,
        inner: &mut ParticipantInner,
        txn_number: TxnNumber,
    ) -> Result<()> {
        if txn_number > inner.active_txn_number {
            // New retryable write.
            self.set_new_txn_number(inner, txn_number)?;
            inner.autocommit = None;
            return Ok(());
        }
        if txn_number < inner.active_txn_number {
            return Err(TxnError::NoSuchTransaction(format!(
                "transaction number {} is older than the active transaction number {}",
                txn_number, inner.active_txn_number
            )));
        }
        // Retrying a retryable write.
        if !inner.state.is_none() {
            return Err(TxnError::InvalidOptions(
                "must specify autocommit=false on all operations of a multi-statement \
                 transaction"
                    .to_string(),
            ));
        }
        debug_assert!(inner.autocommit.is_none());
        Ok(())
    }

    fn continue_multi_document_transaction(
        &self,
        inner: &mut ParticipantInner,
        txn_number: TxnNumber,
    ) -> Result<()> {
        if txn_number != inner.active_txn_number || inner.state.is_none() {
            return Err(TxnError::NoSuchTransaction(format!(
                "given transaction number {} does not match any in-progress transactions; the \
                 active transaction number is {}",
                txn_number, inner.active_txn_number
            )));
        }

        if inner.state.is_in_progress() && inner.stash.is_none() {
            // The first command in the transaction failed but did not
            // implicitly abort it. It is not safe to continue, in
            // particular because the readConcern of the first statement was
            // never saved.
            self.abort_transaction_on_session(inner);
            return Err(TxnError::NoSuchTransaction(format!(
                "transaction {} has been aborted",
                txn_number
            )));
        }

        Ok(())
    }

    fn begin_multi_document_transaction(
        &self,
        inner: &mut ParticipantInner,
        txn_number: TxnNumber,
    ) -> Result<()> {
        // Aborts any in-progress transaction.
        self.set_new_txn_number(inner, txn_number)?;
        inner.autocommit = Some(false);

        inner
            .state
            .transition_to(TransactionState::InProgress, TransitionValidation::Validate);

        let now = Instant::now();
        let lifetime = config::transaction_lifetime_limit_seconds().max(1) as u64;
        inner.expire_date = Some(now + Duration::from_secs(lifetime));

        self.metrics.lock().on_start(inner.autocommit, now);
        assert!(inner.operations.is_empty());
        Ok(())
    }

    fn set_new_txn_number(&self, inner: &mut ParticipantInner, txn_number: TxnNumber) -> Result<()> {
        if txn_number < inner.active_txn_number {
            return Err(TxnError::NoSuchTransaction(format!(
                "transaction number {} is older than the active transaction number {}",
                txn_number, inner.active_txn_number
            )));
        }

        // The session rejects the advance while the number is locked to a
        // prepared transaction.
        self.session.advance_txn_number(txn_number)?;

        assert!(
            !inner
                .state
                .is_in_set(TransactionState::Prepared | TransactionState::CommittingWithPrepare),
            "cannot change the transaction number of a prepared transaction"
        );

        // Abort the existing transaction if it is in progress.
        if inner.state.is_in_progress() {
            self.abort_transaction_on_session(inner);
        }

        inner.active_txn_number = txn_number;
        inner
            .state
            .transition_to(TransactionState::None, TransitionValidation::Validate);
        self.metrics.lock().reset(txn_number);
        inner.prepare_op_time = OpTime::null();
        inner.oldest_oplog_entry_ts = None;
        inner.speculative_read_op_time = OpTime::null();
        inner.expire_date = None;
        inner.aborted_after_prepare = false;
        inner.autocommit = None;
        Ok(())
    }

    /// Install the session's number if migration advanced it past ours
    pub fn check_for_new_txn_number(&self) -> Result<()> {
        let session_number = self.session.active_txn_number();
        let mut inner = self.inner.lock();
        if session_number > inner.active_txn_number {
            self.set_new_txn_number(&mut inner, session_number)?;
        }
        Ok(())
    }

    fn update_state(&self, inner: &mut ParticipantInner, refresh: RefreshState) {
        if refresh.refresh_count <= inner.last_refresh_count {
            return;
        }

        inner.active_txn_number = refresh.txn_number;
        if refresh.is_committed {
            inner
                .state
                .transition_to(TransactionState::Committed, TransitionValidation::Relax);
        }

        inner.last_refresh_count = refresh.refresh_count;
    }

    // ========================================================================
    // Stash / unstash
    // ========================================================================

    /// Release stashed resources onto the operation, or set up fresh ones
    /// for the first statement of a transaction. The point-in-time read
    /// timestamp is fixed here, under a global intent-exclusive lock.
    pub fn unstash_transaction_resources(
        &self,
        op_ctx: &mut OperationContext,
        cmd_name: &str,
    ) -> Result<()> {
        let txn_number = op_ctx
            .txn_number()
            .expect("cannot unstash without a transaction number");

        {
            let mut inner = self.inner.lock();

            // Always check the session's txnNumber and the state, since
            // they can be modified by session kill and migration, which do
            // not check out the session.
            self.check_is_active_transaction(&inner, txn_number, false)?;
            if inner.state.is_none() {
                assert!(inner.stash.is_none());
                return Ok(());
            }

            self.check_is_command_valid_with_txn_state(&inner, txn_number, cmd_name)?;

            if inner.stash.is_some() {
                // Resources already exist for this transaction; transfer
                // them from the stash to the operation context.
                if !op_ctx.read_concern().is_empty() {
                    return Err(TxnError::InvalidOptions(
                        "only the first command in a transaction may specify a readConcern"
                            .to_string(),
                    ));
                }
                let mut stash = inner.stash.take().expect("stash vanished under the mutex");
                if let Err(err) = stash.release(op_ctx) {
                    // A failed ticket reacquisition leaves the resources
                    // stashable; put them back.
                    inner.stash = Some(stash);
                    return Err(err);
                }
                self.metrics.lock().on_unstash(Instant::now());
                return Ok(());
            }

            // If there are no stashed resources we cannot be prepared: a
            // prepared transaction is always stashed between statements.
            assert!(
                !inner.state.is_prepared(),
                "prepared transaction must have stashed resources"
            );
            if !inner.state.is_in_progress() {
                // Either committed and this is a 'commitTransaction' retry,
                // or in the process of committing.
                return Ok(());
            }

            // First statement: set up the transaction resources on the
            // operation context.
            op_ctx.begin_write_unit_of_work();

            let max_lock_millis = config::max_transaction_lock_request_timeout_millis();
            if max_lock_millis >= 0 {
                op_ctx
                    .lock_state_mut()
                    .set_max_lock_timeout(Duration::from_millis(max_lock_millis as u64));
            }

            self.metrics.lock().on_unstash(Instant::now());
        }

        // Storage engine transactions may be started lazily. By starting
        // here we ensure a point-in-time snapshot is established during the
        // first operation of the transaction. We pessimistically acquire an
        // intent-exclusive lock because the transaction may write, and it
        // is not deadlock-safe to upgrade IS to IX.
        op_ctx.lock_state_mut().lock_global_intent_exclusive()?;
        op_ctx.recovery_unit_mut().preallocate_snapshot();

        if HANG_AFTER_PREALLOCATE_SNAPSHOT.is_set() {
            HANG_AFTER_PREALLOCATE_SNAPSHOT.pause_while_set();
        }
        Ok(())
    }

    /// Capture the operation's transaction resources into the stash
    /// between statements. No-op outside a multi-document transaction.
    pub fn stash_transaction_resources(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let txn_number = op_ctx
            .txn_number()
            .expect("cannot stash without a transaction number");
        let mut inner = self.inner.lock();

        // We intentionally do not error if the state is Aborted, since this
        // is called at the end of the 'abortTransaction' command.
        self.check_is_active_transaction(&inner, txn_number, false)?;

        if !inner.state.in_multi_document_transaction() {
            return Ok(());
        }

        self.stash_active_transaction(&mut inner, op_ctx);
        Ok(())
    }

    fn stash_active_transaction(&self, inner: &mut ParticipantInner, op_ctx: &mut OperationContext) {
        if inner.in_shutdown {
            return;
        }

        assert_eq!(Some(inner.active_txn_number), op_ctx.txn_number());
        {
            let mut metrics = self.metrics.lock();
            metrics.on_stash(Instant::now());
            metrics.on_transaction_operation(op_ctx.client().host());
        }

        assert!(inner.stash.is_none());
        inner.stash = Some(TxnResources::capture(op_ctx, false /* keep ticket */));
    }

    /// Choose the read source and fix the speculative read op-time. Must
    /// be called before the transaction's first data read.
    pub fn set_speculative_transaction_op_time(
        &self,
        op_ctx: &mut OperationContext,
        choice: SpeculativeTransactionOpTime,
    ) {
        let mut inner = self.inner.lock();
        let source = match choice {
            SpeculativeTransactionOpTime::AllCommitted => ReadSource::AllCommittedSnapshot,
            SpeculativeTransactionOpTime::LastApplied => ReadSource::LastAppliedSnapshot,
        };
        op_ctx.recovery_unit_mut().set_timestamp_read_source(source);
        op_ctx.recovery_unit_mut().preallocate_snapshot();
        let read_timestamp = op_ctx
            .recovery_unit()
            .point_in_time_read_timestamp()
            .expect("snapshot preallocation must fix a read timestamp");
        // Transactions do not survive term changes, so combining the term
        // here with the storage read timestamp does not race.
        inner.speculative_read_op_time =
            OpTime::new(read_timestamp, replication_coordinator().get_term());
        self.metrics.lock().on_choose_read_timestamp(read_timestamp);
    }

    // ========================================================================
    // Prepare
    // ========================================================================

    /// Prepare the active transaction. On a primary the prepare position is
    /// reserved here; on a secondary the position from the primary's oplog
    /// entry is supplied and the prepare must not fail.
    pub fn prepare_transaction(
        &self,
        op_ctx: &mut OperationContext,
        prepare_op_time: Option<OpTime>,
    ) -> Result<Timestamp> {
        let on_primary = prepare_op_time.is_none();
        let mut abort_guard_armed = false;

        let result = self.prepare_transaction_impl(op_ctx, prepare_op_time, &mut abort_guard_armed);
        if let Err(err) = &result {
            if !on_primary {
                fatal(&format!("prepare on secondary must not fail: {}", err));
            }
            if abort_guard_armed && self.abort_active_transaction(op_ctx).is_err() {
                fatal("failed to abort transaction after failed prepare");
            }
        }
        result
    }

    fn prepare_transaction_impl(
        &self,
        op_ctx: &mut OperationContext,
        prepare_op_time: Option<OpTime>,
        abort_guard_armed: &mut bool,
    ) -> Result<Timestamp> {
        let txn_number = op_ctx
            .txn_number()
            .expect("cannot prepare without a transaction number");

        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        // Prevent concurrent number changes while the session has a
        // prepared transaction; released on commit or abort.
        self.session.lock_txn_number(
            inner.active_txn_number,
            TxnError::PreparedTransactionInProgress(
                "cannot change transaction number while the session has a prepared transaction"
                    .to_string(),
            ),
        );
        *abort_guard_armed = true;

        inner
            .state
            .transition_to(TransactionState::Prepared, TransitionValidation::Validate);

        let (prepare_slot, _reserver) = match prepare_op_time {
            Some(op_time) => {
                // On a secondary the position is given; the buffered
                // operations are drained into the observer's record.
                (OplogSlot::new(op_time), None)
            }
            None => {
                // Reserve a position for the prepare timestamp. This
                // creates a hole in the oplog that makes snapshot and
                // after-cluster-time readers block until this transaction
                // is done being prepared. When the reserver drops, the
                // side storage-transaction keeping the hole open aborts
                // and the hole vanishes.
                let reserver = OplogSlotReserver::reserve(op_ctx);
                let slot = reserver.reserved_slot();
                assert!(
                    inner.prepare_op_time.is_null(),
                    "this transaction has already reserved a prepare op time at {}",
                    inner.prepare_op_time
                );
                inner.prepare_op_time = slot.op_time;

                if HANG_AFTER_RESERVING_PREPARE_TIMESTAMP.is_set() {
                    // This log line is used by tests for synchronization.
                    log::info!(
                        "transaction - hangAfterReservingPrepareTimestamp fail point enabled; \
                         blocking until fail point is disabled, prepare op time: {}",
                        slot.op_time
                    );
                    HANG_AFTER_RESERVING_PREPARE_TIMESTAMP.pause_while_set();
                }
                (slot, Some(reserver))
            }
        };

        op_ctx
            .recovery_unit_mut()
            .set_prepare_timestamp(prepare_slot.op_time.timestamp);
        op_ctx.prepare_write_unit_of_work();

        // The observer calls back into the participant; release the mutex
        // and re-validate afterwards.
        drop(inner);
        op_observer().on_transaction_prepare(op_ctx, prepare_slot)?;

        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;
        *abort_guard_armed = false;

        assert!(
            inner.oldest_oplog_entry_ts.is_none(),
            "this transaction's oldest oplog entry timestamp has already been set to {:?}",
            inner.oldest_oplog_entry_ts
        );
        inner.oldest_oplog_entry_ts = Some(prepare_slot.op_time.timestamp);

        self.metrics.lock().on_prepare();

        Ok(prepare_slot.op_time.timestamp)
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Commit a transaction that was never prepared: the data and the
    /// commit decision replicate as a single record.
    pub fn commit_unprepared_transaction(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let txn_number = op_ctx
            .txn_number()
            .expect("cannot commit without a transaction number");

        let inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        if inner.state.is_prepared() {
            return Err(TxnError::InvalidOptions(
                "commitTransaction must provide commitTimestamp to a prepared transaction"
                    .to_string(),
            ));
        }

        // Unprepared transactions replicate exactly one oplog entry.
        assert!(
            inner.oldest_oplog_entry_ts.is_none(),
            "the oldest oplog entry timestamp should not be set on an unprepared transaction, \
             but it is {:?}",
            inner.oldest_oplog_entry_ts
        );

        // The observer calls back into the participant.
        drop(inner);
        op_observer().on_transaction_commit(op_ctx, None, None)?;

        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        // No externally visible change has happened yet; anything that
        // threw before this point leaves the transaction abortable by the
        // entry point.
        inner.state.transition_to(
            TransactionState::CommittingWithoutPrepare,
            TransitionValidation::Validate,
        );

        drop(inner);
        self.commit_storage_transaction(op_ctx);

        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, false)?;
        assert!(
            inner.state.is_committing_without_prepare(),
            "current state: {}",
            inner.state.current()
        );

        self.finish_commit_transaction(&mut inner, op_ctx);
        Ok(())
    }

    /// Commit a prepared transaction at `commit_timestamp`. Once the
    /// commit decision is validated, failure is fatal: committing a
    /// prepared transaction must not fail.
    pub fn commit_prepared_transaction(
        &self,
        op_ctx: &mut OperationContext,
        commit_timestamp: Timestamp,
    ) -> Result<()> {
        let txn_number = op_ctx
            .txn_number()
            .expect("cannot commit without a transaction number");

        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        if !inner.state.is_prepared() {
            return Err(TxnError::InvalidOptions(
                "commitTransaction cannot provide commitTimestamp to an unprepared transaction"
                    .to_string(),
            ));
        }
        if commit_timestamp.is_null() {
            return Err(TxnError::InvalidOptions(
                "'commitTimestamp' cannot be null".to_string(),
            ));
        }
        if commit_timestamp < inner.prepare_op_time.timestamp {
            return Err(TxnError::InvalidOptions(
                "'commitTimestamp' must be greater than or equal to 'prepareTimestamp'"
                    .to_string(),
            ));
        }

        inner.state.transition_to(
            TransactionState::CommittingWithPrepare,
            TransitionValidation::Validate,
        );
        op_ctx.recovery_unit_mut().set_commit_timestamp(commit_timestamp);

        // Reserve an oplog slot before committing so that no write causally
        // related to this commit enters the oplog at an earlier timestamp.
        let reserver = OplogSlotReserver::reserve(op_ctx);
        let commit_slot = reserver.reserved_slot();
        assert!(
            commit_slot.op_time.timestamp >= commit_timestamp,
            "commit oplog entry must be greater than or equal to the commit timestamp due to \
             causal consistency; commit timestamp: {}, commit oplog entry op time: {}",
            commit_timestamp,
            commit_slot.op_time
        );

        // Release the mutex: the observer re-enters the participant, and
        // storage must not commit under the mutex.
        drop(inner);
        self.commit_storage_transaction(op_ctx);

        if let Err(err) =
            op_observer().on_transaction_commit(op_ctx, Some(commit_slot), Some(commit_timestamp))
        {
            fatal(&format!(
                "caught exception during commit of prepared transaction {}: {}",
                txn_number, err
            ));
        }

        let mut inner = self.inner.lock();
        if let Err(err) = self.check_is_active_transaction(&inner, txn_number, true) {
            fatal(&format!(
                "transaction {} invalidated during prepared commit: {}",
                txn_number, err
            ));
        }

        self.finish_commit_transaction(&mut inner, op_ctx);
        self.session.unlock_txn_number();
        Ok(())
    }

    /// Commit the storage transaction under the operation. Failure here is
    /// illegal, so invariant violations terminate the process rather than
    /// surface.
    fn commit_storage_transaction(&self, op_ctx: &mut OperationContext) {
        assert!(op_ctx.has_write_unit_of_work());
        op_ctx.commit_write_unit_of_work();

        // Clear the recovery unit and lock settings for the retryable-write
        // record and oplog writes that follow the commit.
        let client = Arc::clone(op_ctx.client());
        let client_lock = client.lock();
        let _ = op_ctx.replace_recovery_unit(
            &client_lock,
            storage_engine().new_recovery_unit(),
            RecoveryUnitState::NotInUnitOfWork,
        );
        drop(client_lock);

        op_ctx.lock_state_mut().unset_max_lock_timeout();
    }

    fn finish_commit_transaction(&self, inner: &mut ParticipantInner, op_ctx: &mut OperationContext) {
        // If no writes were done, push the client op-time forward to the
        // read timestamp so a write-concern wait covers all data read.
        let speculative = inner.speculative_read_op_time;
        if !speculative.is_null() {
            op_ctx.client().advance_last_op(speculative);
        }

        inner
            .state
            .transition_to(TransactionState::Committed, TransitionValidation::Validate);
        inner.prepare_op_time = OpTime::null();
        inner.oldest_oplog_entry_ts = None;

        self.metrics.lock().on_commit(Instant::now());

        self.clean_up_txn_resources_on_op_ctx(inner, op_ctx, TransactionState::Committed);
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// Abort the active transaction from InProgress or Prepared. The abort
    /// record is written before storage aborts so no causally-related
    /// subsequent write lands at a smaller timestamp.
    pub fn abort_active_transaction(&self, op_ctx: &mut OperationContext) -> Result<()> {
        let txn_number = op_ctx
            .txn_number()
            .expect("cannot abort without a transaction number");
        let inner = self.inner.lock();
        // This function must not throw if the transaction is already
        // aborted.
        self.check_is_active_transaction(&inner, txn_number, false)?;
        self.abort_active_transaction_with_lock(
            inner,
            op_ctx,
            TransactionState::InProgress | TransactionState::Prepared,
        )
    }

    /// Error handler for failures inside a statement: aborts an unprepared
    /// transaction, stashes a prepared one (the commit decision is not
    /// ours to make). Failure here is fatal.
    pub fn abort_active_unprepared_or_stash_prepared_transaction(
        &self,
        op_ctx: &mut OperationContext,
    ) {
        let result = (|| -> Result<()> {
            let mut inner = self.inner.lock();
            if inner.state.is_none() {
                return Ok(());
            }

            let txn_number = op_ctx
                .txn_number()
                .expect("cannot abort without a transaction number");
            // By convention this re-check cannot fail here; if it does,
            // failing is fatal.
            self.check_is_active_transaction(&inner, txn_number, false)?;

            if inner.state.is_prepared() {
                self.stash_active_transaction(&mut inner, op_ctx);
                return Ok(());
            }

            // Unprepared transactions replicate exactly one oplog entry.
            assert!(
                inner.oldest_oplog_entry_ts.is_none(),
                "the oldest oplog entry timestamp should not be set on an unprepared \
                 transaction, but it is {:?}",
                inner.oldest_oplog_entry_ts
            );

            self.abort_active_transaction_with_lock(
                inner,
                op_ctx,
                StateSet::from(TransactionState::InProgress),
            )
        })();

        if let Err(err) = result {
            fatal(&format!(
                "caught exception during transaction abort or stash: {}",
                err
            ));
        }
    }

    fn abort_active_transaction_with_lock(
        &self,
        inner: MutexGuard<'_, ParticipantInner>,
        op_ctx: &mut OperationContext,
        expected_states: StateSet,
    ) -> Result<()> {
        assert!(inner.stash.is_none());
        assert!(!inner.state.is_committing_with_prepare());

        // Write the abort oplog entry before aborting the transaction so
        // that no write causally related to the abort enters the oplog at
        // an earlier timestamp. The observer re-enters the participant, so
        // the mutex is released around the call.
        drop(inner);
        op_observer().on_transaction_abort(op_ctx)?;
        let mut inner = self.inner.lock();

        // Only abort the transaction on the session if it is still in an
        // expected state; another thread may have aborted it while the
        // mutex was released.
        if inner.state.is_in_set(expected_states) {
            assert_eq!(Some(inner.active_txn_number), op_ctx.txn_number());
            self.abort_transaction_on_session(&mut inner);
        } else if op_ctx.txn_number() == Some(inner.active_txn_number) {
            if inner.state.is_none() {
                // The active transaction is not a multi-document
                // transaction.
                assert!(!op_ctx.has_write_unit_of_work());
                return Ok(());
            }

            // Cannot abort these states unless expected_states names them
            // explicitly.
            let unabortable = TransactionState::Prepared
                | TransactionState::CommittingWithPrepare
                | TransactionState::CommittingWithoutPrepare
                | TransactionState::Committed;
            assert!(
                !inner.state.is_in_set(unabortable),
                "cannot abort transaction in {}",
                inner.state.current()
            );
        } else {
            // A higher transaction number means the transaction was already
            // aborted.
            assert!(inner
                .state
                .is_in_set(TransactionState::None | TransactionState::Aborted));
        }

        // Clean up the operation context even if the transaction on the
        // session was not aborted here; this aborts the storage
        // transaction.
        self.clean_up_txn_resources_on_op_ctx(&mut inner, op_ctx, TransactionState::Aborted);
        Ok(())
    }

    /// Sweeper entry: abort iff the transaction is in progress. A prepared
    /// transaction is never aborted without an explicit command.
    pub fn abort_arbitrary_transaction(&self) {
        let mut inner = self.inner.lock();
        if !inner.state.is_in_progress() {
            return;
        }
        self.abort_transaction_on_session(&mut inner);
    }

    /// Sweeper entry: abort an in-progress transaction that has outlived
    /// `transaction_lifetime_limit_seconds`, killing any operation still
    /// running on the session.
    pub fn abort_arbitrary_transaction_if_expired(&self) {
        let mut inner = self.inner.lock();
        let expired = inner.state.is_in_progress()
            && matches!(inner.expire_date, Some(deadline) if deadline <= Instant::now());
        if !expired {
            return;
        }

        if let Some(operation) = self.session.current_operation() {
            // If an operation is still running for this transaction when it
            // expires, kill it.
            let _client_lock = operation.client().lock();
            operation.kill(TxnError::ExceededTimeLimit(
                "transaction exceeded its lifetime limit and was aborted".to_string(),
            ));
        }

        // Log after killing the current operation: tests wait on this line
        // to know the kill happened.
        log::info!(
            "aborting transaction with txnNumber {} on session {} because it has been running \
             for longer than 'transactionLifetimeLimitSeconds'",
            inner.active_txn_number,
            self.session.session_id()
        );

        self.abort_transaction_on_session(&mut inner);
    }

    fn abort_transaction_on_session(&self, inner: &mut ParticipantInner) {
        let now = Instant::now();
        let was_prepared = inner.state.is_prepared();

        if let Some(stash) = inner.stash.take() {
            // The transaction was inactive; its resources abort with the
            // stash drop below.
            self.metrics.lock().on_abort(now);
            let lock_stats = stash
                .lock_state()
                .map(|l| l.stats())
                .unwrap_or_else(|| serde_json::json!({}));
            self.log_slow_transaction(
                inner,
                lock_stats,
                TransactionState::Aborted,
                stash.read_concern().clone(),
            );
            drop(stash);
        } else {
            self.metrics.lock().on_abort(now);
        }

        inner.operation_bytes = 0;
        inner.operations.clear();
        inner
            .state
            .transition_to(TransactionState::Aborted, TransitionValidation::Validate);
        inner.prepare_op_time = OpTime::null();
        inner.oldest_oplog_entry_ts = None;
        inner.speculative_read_op_time = OpTime::null();
        inner.aborted_after_prepare = was_prepared;

        self.session.unlock_txn_number();
    }

    fn clean_up_txn_resources_on_op_ctx(
        &self,
        inner: &mut ParticipantInner,
        op_ctx: &mut OperationContext,
        termination_cause: TransactionState,
    ) {
        self.log_slow_transaction(
            inner,
            op_ctx.lock_state().stats(),
            termination_cause,
            op_ctx.read_concern().clone(),
        );

        // Drop the write unit of work without committing; empty
        // transactions without one abort cleanly too.
        op_ctx.clear_write_unit_of_work();

        // Clear the recovery unit and lock settings so post-transaction
        // writes run without transactional settings such as a read
        // timestamp.
        let client = Arc::clone(op_ctx.client());
        let client_lock = client.lock();
        let _ = op_ctx.replace_recovery_unit(
            &client_lock,
            storage_engine().new_recovery_unit(),
            RecoveryUnitState::NotInUnitOfWork,
        );
        drop(client_lock);

        op_ctx.lock_state_mut().unset_max_lock_timeout();
    }

    /// Drop any stashed resources; the session is shutting down
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.in_shutdown = true;
        inner.stash = None;
    }

    // ========================================================================
    // Buffered operations
    // ========================================================================

    /// Buffer a replicated write for the in-progress transaction. The
    /// cumulative serialized size is bounded; the in-memory figure is an
    /// underestimate of the eventual record, so rejection can come early.
    pub fn add_transaction_operation(
        &self,
        op_ctx: &OperationContext,
        operation: ReplOperation,
    ) -> Result<()> {
        let txn_number = op_ctx
            .txn_number()
            .expect("cannot add operations without a transaction number");
        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        assert!(
            inner.state.is_in_progress(),
            "current state: {}",
            inner.state.current()
        );
        assert!(
            inner.autocommit == Some(false) && inner.active_txn_number != UNINITIALIZED_TXN_NUMBER
        );
        assert!(op_ctx.lock_state().in_a_write_unit_of_work());

        let size = operation.serialized_size();
        if inner.operation_bytes + size > MAX_TRANSACTION_OPERATIONS_BYTES {
            return Err(TxnError::TransactionTooLarge {
                actual: inner.operation_bytes + size,
                limit: MAX_TRANSACTION_OPERATIONS_BYTES,
            });
        }
        inner.operations.push(operation);
        inner.operation_bytes += size;
        Ok(())
    }

    /// Drain the buffered operations for the commit or prepare record
    pub fn end_transaction_and_retrieve_operations(
        &self,
        op_ctx: &mut OperationContext,
    ) -> Result<Vec<ReplOperation>> {
        let txn_number = op_ctx
            .txn_number()
            .expect("cannot end a transaction without a transaction number");
        let mut inner = self.inner.lock();
        self.check_is_active_transaction(&inner, txn_number, true)?;

        assert!(
            inner
                .state
                .is_in_set(TransactionState::Prepared | TransactionState::InProgress),
            "current state: {}",
            inner.state.current()
        );
        assert!(inner.autocommit.is_some());

        inner.operation_bytes = 0;
        Ok(std::mem::take(&mut inner.operations))
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn check_is_active_transaction(
        &self,
        inner: &ParticipantInner,
        request_txn_number: TxnNumber,
        check_abort: bool,
    ) -> Result<()> {
        let session_txn_number = self.session.active_txn_number();
        if session_txn_number != inner.active_txn_number {
            return Err(TxnError::ConflictingOperationInProgress(format!(
                "cannot perform operations on transaction {} on session {} because a different \
                 transaction {} is now active",
                inner.active_txn_number,
                self.session.session_id(),
                session_txn_number
            )));
        }

        if request_txn_number != inner.active_txn_number {
            return Err(TxnError::ConflictingOperationInProgress(format!(
                "cannot perform operations on requested transaction {} on session {} because a \
                 different transaction {} is now active",
                request_txn_number,
                self.session.session_id(),
                inner.active_txn_number
            )));
        }

        if check_abort && inner.state.is_aborted() {
            return Err(TxnError::NoSuchTransaction(format!(
                "transaction {} has been aborted",
                request_txn_number
            )));
        }

        Ok(())
    }

    fn check_is_command_valid_with_txn_state(
        &self,
        inner: &ParticipantInner,
        txn_number: TxnNumber,
        cmd_name: &str,
    ) -> Result<()> {
        // NoSuchTransaction instead of a bare aborted error: this is the
        // entry point of transaction execution.
        if inner.state.is_aborted() {
            return Err(TxnError::NoSuchTransaction(format!(
                "transaction {} has been aborted",
                txn_number
            )));
        }

        // A committed transaction cannot change, but commitTransaction may
        // be retried.
        if inner.state.is_committed() && cmd_name != "commitTransaction" {
            return Err(TxnError::TransactionCommitted(txn_number));
        }

        if inner.state.is_prepared() && !gating::is_command_allowed_on_prepared(cmd_name) {
            return Err(TxnError::PreparedTransactionInProgress(
                "cannot call any operation other than abort, prepare or commit on a prepared \
                 transaction"
                    .to_string(),
            ));
        }

        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state.current()
    }

    pub fn active_txn_number(&self) -> TxnNumber {
        self.inner.lock().active_txn_number
    }

    pub fn prepare_op_time(&self) -> OpTime {
        self.inner.lock().prepare_op_time
    }

    pub fn speculative_read_op_time(&self) -> OpTime {
        self.inner.lock().speculative_read_op_time
    }

    pub fn oldest_oplog_entry_timestamp(&self) -> Option<Timestamp> {
        self.inner.lock().oldest_oplog_entry_ts
    }

    pub fn has_stashed_resources(&self) -> bool {
        self.inner.lock().stash.is_some()
    }

    /// Whether the current aborted state followed a prepare, the case a
    /// same-number restart cannot yet distinguish from an ordinary abort.
    pub fn restart_blocked_after_prepare_abort(&self) -> bool {
        let inner = self.inner.lock();
        inner.state.is_aborted() && inner.aborted_after_prepare
    }

    pub(super) fn session_state(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub(super) fn lock_inner(&self) -> MutexGuard<'_, ParticipantInner> {
        self.inner.lock()
    }

    pub(super) fn lock_metrics(&self) -> MutexGuard<'_, TransactionMetricsObserver> {
        self.metrics.lock()
    }

    fn log_slow_transaction(
        &self,
        inner: &ParticipantInner,
        lock_stats: serde_json::Value,
        termination_cause: TransactionState,
        read_concern: ReadConcernArgs,
    ) {
        // Only multi-document transactions are logged.
        if inner.state.is_none() {
            return;
        }
        debug_assert!(
            termination_cause == TransactionState::Committed
                || termination_cause == TransactionState::Aborted
        );

        let now = Instant::now();
        let metrics = self.metrics.lock();
        let stats = metrics.stats();
        let duration = stats.duration(now);
        if duration.as_millis() as u64 <= config::slow_transaction_threshold_millis() {
            return;
        }

        let cause = if termination_cause == TransactionState::Committed {
            "committed"
        } else {
            "aborted"
        };
        log::info!(
            "transaction parameters:{{ lsid: {}, txnNumber: {}, autocommit: {} }} \
             readTimestamp:{} readConcern:{:?} terminationCause:{} timeActiveMicros:{} \
             timeInactiveMicros:{} numYields:0 locks:{} {}ms",
            self.session.session_id(),
            inner.active_txn_number,
            inner.autocommit.unwrap_or(true),
            stats.read_timestamp(),
            read_concern,
            cause,
            stats.time_active(now).as_micros(),
            stats.time_inactive(now).as_micros(),
            lock_stats,
            duration.as_millis()
        );
    }

    #[cfg(test)]
    pub(crate) fn set_expire_date_for_test(&self, deadline: Instant) {
        self.inner.lock().expire_date = Some(deadline);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use once_cell::sync::Lazy;

    use super::*;
    use crate::data::{Document, Value};
    use crate::ops::Client;
    use crate::repl::{EntryKind, OplogEntry};
    use crate::session::Session;

    static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(100);

    /// Serializes tests that flip the process-wide cluster role.
    static CLUSTER_ROLE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn make_session() -> Arc<Session> {
        Session::new(NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst))
    }

    fn make_op(session: &Arc<Session>, txn_number: TxnNumber) -> OperationContext {
        OperationContext::new(
            Arc::clone(session),
            Client::new("test-host:27017"),
            Some(txn_number),
        )
        .unwrap()
    }

    fn make_doc(name: &str) -> Document {
        let mut doc = Document::new();
        doc.insert("_id".to_string(), Value::Int(1));
        doc.insert("name".to_string(), Value::String(name.to_string()));
        doc
    }

    fn insert_op(name: &str) -> ReplOperation {
        ReplOperation::insert("test.users", make_doc(name))
    }

    fn entries_for(session: &Arc<Session>) -> Vec<OplogEntry> {
        replication_coordinator()
            .oplog()
            .entries()
            .into_iter()
            .filter(|entry| entry.session_id == session.session_id())
            .collect()
    }

    #[test]
    fn test_commit_unprepared_transaction() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        assert_eq!(participant.state(), TransactionState::InProgress);
        assert_eq!(participant.active_txn_number(), 5);

        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        participant
            .add_transaction_operation(&op_ctx, insert_op("alice"))
            .unwrap();
        participant.commit_unprepared_transaction(&mut op_ctx).unwrap();

        assert_eq!(participant.state(), TransactionState::Committed);
        assert_eq!(participant.active_txn_number(), 5);

        let entries = entries_for(&session);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::ApplyOps);
        assert_eq!(entries[0].operation_count, 1);
        assert_eq!(entries[0].txn_number, 5);
    }

    #[test]
    fn test_prepare_then_commit_prepared() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "update")
            .unwrap();
        participant
            .add_transaction_operation(&op_ctx, ReplOperation::update("test.users", make_doc("a")))
            .unwrap();

        let prepare_ts = participant.prepare_transaction(&mut op_ctx, None).unwrap();
        assert_eq!(participant.state(), TransactionState::Prepared);
        assert_eq!(participant.prepare_op_time().timestamp, prepare_ts);
        assert_eq!(
            participant.oldest_oplog_entry_timestamp(),
            Some(prepare_ts)
        );

        let commit_ts = Timestamp(prepare_ts.0 + 1);
        participant
            .commit_prepared_transaction(&mut op_ctx, commit_ts)
            .unwrap();
        assert_eq!(participant.state(), TransactionState::Committed);

        let entries = entries_for(&session);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Prepare);
        assert_eq!(entries[0].timestamp, prepare_ts);
        assert_eq!(entries[1].kind, EntryKind::Commit);
        assert_eq!(entries[1].commit_timestamp, Some(commit_ts));
        // The commit record cannot land before the commit timestamp.
        assert!(entries[1].timestamp >= commit_ts);
    }

    #[test]
    fn test_commit_prepared_rejects_timestamp_before_prepare() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "update")
            .unwrap();

        let prepare_ts = participant.prepare_transaction(&mut op_ctx, None).unwrap();
        let err = participant
            .commit_prepared_transaction(&mut op_ctx, Timestamp(prepare_ts.0 - 1))
            .unwrap_err();
        assert!(matches!(err, TxnError::InvalidOptions(_)));
        assert_eq!(participant.state(), TransactionState::Prepared);

        // Null is rejected too.
        let err = participant
            .commit_prepared_transaction(&mut op_ctx, Timestamp::NULL)
            .unwrap_err();
        assert!(matches!(err, TxnError::InvalidOptions(_)));
        assert_eq!(participant.state(), TransactionState::Prepared);

        participant.abort_active_transaction(&mut op_ctx).unwrap();
    }

    #[test]
    fn test_commit_unprepared_rejected_on_prepared_transaction() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        participant.prepare_transaction(&mut op_ctx, None).unwrap();

        let err = participant
            .commit_unprepared_transaction(&mut op_ctx)
            .unwrap_err();
        assert!(matches!(err, TxnError::InvalidOptions(_)));
        assert_eq!(participant.state(), TransactionState::Prepared);

        participant.abort_active_transaction(&mut op_ctx).unwrap();
    }

    #[test]
    fn test_new_txn_number_aborts_in_progress_transaction() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        participant.begin_or_continue(6, Some(false), Some(true)).unwrap();

        assert_eq!(participant.active_txn_number(), 6);
        assert_eq!(participant.state(), TransactionState::InProgress);
    }

    #[test]
    fn test_txn_numbers_are_monotonic() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(7, Some(false), Some(true)).unwrap();
        let err = participant
            .begin_or_continue(6, Some(false), Some(true))
            .unwrap_err();
        assert!(matches!(err, TxnError::NoSuchTransaction(_)));
        assert_eq!(participant.active_txn_number(), 7);

        let err = participant.begin_or_continue(3, None, None).unwrap_err();
        assert!(matches!(err, TxnError::NoSuchTransaction(_)));
        assert_eq!(participant.active_txn_number(), 7);
    }

    #[test]
    fn test_restart_at_active_number_requires_shard_server() {
        let _role = CLUSTER_ROLE_LOCK.lock();
        config::set_cluster_role(ClusterRole::None);

        let session = make_session();
        let participant = session.participant();
        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();

        let err = participant
            .begin_or_continue(5, Some(false), Some(true))
            .unwrap_err();
        assert!(matches!(err, TxnError::ConflictingOperationInProgress(_)));
        assert_eq!(participant.state(), TransactionState::InProgress);
    }

    #[test]
    fn test_restart_at_active_number_on_shard_server() {
        let _role = CLUSTER_ROLE_LOCK.lock();
        config::set_cluster_role(ClusterRole::ShardServer);

        let session = make_session();
        let participant = session.participant();
        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        assert_eq!(participant.state(), TransactionState::InProgress);
        assert_eq!(participant.active_txn_number(), 5);

        config::set_cluster_role(ClusterRole::None);
    }

    #[test]
    fn test_count_is_gated_and_transaction_survives() {
        let session = make_session();
        let participant = session.participant();
        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();

        let err = gating::check_command_allowed("test", "count").unwrap_err();
        assert!(matches!(
            err,
            TxnError::OperationNotSupportedInTransaction(_)
        ));
        assert_eq!(participant.state(), TransactionState::InProgress);
    }

    #[test]
    fn test_expired_transaction_is_swept() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();

        participant.set_expire_date_for_test(Instant::now());
        participant.abort_arbitrary_transaction_if_expired();

        assert!(matches!(
            op_ctx.check_for_interrupt(),
            Err(TxnError::ExceededTimeLimit(_))
        ));
        assert_eq!(participant.state(), TransactionState::Aborted);

        // Continuing the aborted transaction fails at the next statement.
        participant.begin_or_continue(5, Some(false), None).unwrap();
        let mut op_ctx2 = make_op(&session, 5);
        let err = participant
            .unstash_transaction_resources(&mut op_ctx2, "insert")
            .unwrap_err();
        assert!(matches!(err, TxnError::NoSuchTransaction(_)));
    }

    #[test]
    fn test_sweeper_never_touches_prepared_transactions() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        participant.prepare_transaction(&mut op_ctx, None).unwrap();

        participant.set_expire_date_for_test(Instant::now());
        participant.abort_arbitrary_transaction_if_expired();
        participant.abort_arbitrary_transaction();
        assert_eq!(participant.state(), TransactionState::Prepared);

        participant.abort_active_transaction(&mut op_ctx).unwrap();
    }

    #[test]
    fn test_sweeper_abort_is_idempotent() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        participant.abort_arbitrary_transaction();
        assert_eq!(participant.state(), TransactionState::Aborted);
        participant.abort_arbitrary_transaction();
        assert_eq!(participant.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_stash_round_trip_preserves_snapshot() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "find")
            .unwrap();
        let read_ts = op_ctx.recovery_unit().point_in_time_read_timestamp();
        assert!(read_ts.is_some());

        participant.stash_transaction_resources(&mut op_ctx).unwrap();
        // Stash exclusivity: the stash exists iff the operation context
        // holds no transaction unit of work.
        assert!(participant.has_stashed_resources());
        assert!(!op_ctx.has_write_unit_of_work());
        drop(op_ctx);

        let mut op_ctx2 = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx2, "find")
            .unwrap();
        assert!(!participant.has_stashed_resources());
        assert!(op_ctx2.has_write_unit_of_work());
        assert_eq!(op_ctx2.recovery_unit().point_in_time_read_timestamp(), read_ts);

        participant.commit_unprepared_transaction(&mut op_ctx2).unwrap();
        assert_eq!(participant.state(), TransactionState::Committed);
        // An empty transaction commits without writing an oplog entry.
        assert!(entries_for(&session).is_empty());
    }

    #[test]
    fn test_read_concern_rejected_on_continuation() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "find")
            .unwrap();
        participant.stash_transaction_resources(&mut op_ctx).unwrap();
        drop(op_ctx);

        let mut op_ctx2 = make_op(&session, 5);
        op_ctx2.set_read_concern(crate::repl::ReadConcernArgs::new(
            crate::repl::ReadConcernLevel::Snapshot,
        ));
        let err = participant
            .unstash_transaction_resources(&mut op_ctx2, "find")
            .unwrap_err();
        assert!(matches!(err, TxnError::InvalidOptions(_)));
        assert!(participant.has_stashed_resources());
    }

    #[test]
    fn test_failed_unstash_leaves_resources_stashed() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "find")
            .unwrap();
        participant.stash_transaction_resources(&mut op_ctx).unwrap();
        drop(op_ctx);

        // A killed operation cannot reacquire the execution ticket; the
        // release fails before anything is marked released.
        let mut killed_op = make_op(&session, 5);
        killed_op
            .handle()
            .kill(TxnError::ExceededTimeLimit("killed".to_string()));
        let err = participant
            .unstash_transaction_resources(&mut killed_op, "find")
            .unwrap_err();
        assert!(matches!(err, TxnError::ExceededTimeLimit(_)));
        assert!(participant.has_stashed_resources());
        drop(killed_op);

        // A healthy operation can still pick the transaction up.
        let mut op_ctx2 = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx2, "find")
            .unwrap();
        assert!(!participant.has_stashed_resources());
    }

    #[test]
    fn test_abort_entry_precedes_post_abort_writes() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "update")
            .unwrap();
        let prepare_ts = participant.prepare_transaction(&mut op_ctx, None).unwrap();

        participant.abort_active_transaction(&mut op_ctx).unwrap();
        assert_eq!(participant.state(), TransactionState::Aborted);
        assert_eq!(participant.prepare_op_time(), OpTime::null());
        assert_eq!(participant.oldest_oplog_entry_timestamp(), None);

        let entries = entries_for(&session);
        let abort_entry = entries
            .iter()
            .find(|entry| entry.kind == EntryKind::Abort)
            .expect("abort entry written");
        assert!(abort_entry.timestamp > prepare_ts);

        // Any write after the abort lands at a strictly larger timestamp.
        let later = storage_engine().next_timestamp();
        assert!(later > abort_entry.timestamp);
    }

    #[test]
    fn test_error_handler_stashes_prepared_transaction() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        participant.prepare_transaction(&mut op_ctx, None).unwrap();

        participant.abort_active_unprepared_or_stash_prepared_transaction(&mut op_ctx);
        assert_eq!(participant.state(), TransactionState::Prepared);
        assert!(participant.has_stashed_resources());

        // Unprepared transactions are aborted by the same entry point.
        let session2 = make_session();
        let participant2 = session2.participant();
        participant2.begin_or_continue(4, Some(false), Some(true)).unwrap();
        let mut op_ctx2 = make_op(&session2, 4);
        participant2
            .unstash_transaction_resources(&mut op_ctx2, "insert")
            .unwrap();
        participant2.abort_active_unprepared_or_stash_prepared_transaction(&mut op_ctx2);
        assert_eq!(participant2.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_prepared_transaction_locks_txn_number() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        let prepare_ts = participant.prepare_transaction(&mut op_ctx, None).unwrap();

        let err = participant
            .begin_or_continue(7, Some(false), Some(true))
            .unwrap_err();
        assert!(matches!(err, TxnError::PreparedTransactionInProgress(_)));
        assert_eq!(participant.state(), TransactionState::Prepared);
        assert_eq!(participant.active_txn_number(), 5);

        // Committing releases the number lock.
        participant
            .commit_prepared_transaction(&mut op_ctx, Timestamp(prepare_ts.0 + 1))
            .unwrap();
        participant.begin_or_continue(7, Some(false), Some(true)).unwrap();
        assert_eq!(participant.active_txn_number(), 7);
    }

    #[test]
    fn test_prepared_gating_between_statements() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        let prepare_ts = participant.prepare_transaction(&mut op_ctx, None).unwrap();
        participant.stash_transaction_resources(&mut op_ctx).unwrap();
        drop(op_ctx);

        let mut op_ctx2 = make_op(&session, 5);
        let err = participant
            .unstash_transaction_resources(&mut op_ctx2, "insert")
            .unwrap_err();
        assert!(matches!(err, TxnError::PreparedTransactionInProgress(_)));

        participant
            .unstash_transaction_resources(&mut op_ctx2, "commitTransaction")
            .unwrap();
        participant
            .commit_prepared_transaction(&mut op_ctx2, Timestamp(prepare_ts.0 + 1))
            .unwrap();
        assert_eq!(participant.state(), TransactionState::Committed);
    }

    #[test]
    fn test_committed_transaction_allows_commit_retry_only() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        participant.commit_unprepared_transaction(&mut op_ctx).unwrap();
        drop(op_ctx);

        let mut op_ctx2 = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx2, "commitTransaction")
            .unwrap();
        let err = participant
            .unstash_transaction_resources(&mut op_ctx2, "insert")
            .unwrap_err();
        assert!(matches!(err, TxnError::TransactionCommitted(_)));
    }

    #[test]
    fn test_retryable_write_cannot_mix_with_transaction() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, None, None).unwrap();
        assert_eq!(participant.state(), TransactionState::None);
        // Retrying the same retryable write is fine.
        participant.begin_or_continue(5, None, None).unwrap();

        participant.begin_or_continue(6, Some(false), Some(true)).unwrap();
        let err = participant.begin_or_continue(6, None, None).unwrap_err();
        assert!(matches!(err, TxnError::InvalidOptions(_)));
    }

    #[test]
    fn test_continue_without_begin_fails() {
        let session = make_session();
        let participant = session.participant();

        let err = participant
            .begin_or_continue(5, Some(false), None)
            .unwrap_err();
        assert!(matches!(err, TxnError::NoSuchTransaction(_)));
    }

    #[test]
    fn test_continue_after_failed_first_statement_aborts() {
        let session = make_session();
        let participant = session.participant();

        // The first statement began the transaction but never ran (no
        // resources were ever stashed), so continuing is unsafe.
        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let err = participant
            .begin_or_continue(5, Some(false), None)
            .unwrap_err();
        assert!(matches!(err, TxnError::NoSuchTransaction(_)));
        assert_eq!(participant.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_migration_refresh_invalidates_stale_number() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        session.state().refresh(6, false).unwrap();

        let err = participant
            .begin_or_continue(5, Some(false), None)
            .unwrap_err();
        assert!(matches!(err, TxnError::NoSuchTransaction(_)));
        assert_eq!(participant.active_txn_number(), 6);
    }

    #[test]
    fn test_refresh_jumps_to_committed_with_relaxed_validation() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        session.state().refresh(5, true).unwrap();

        participant.begin_or_continue(5, Some(false), None).unwrap();
        assert_eq!(participant.state(), TransactionState::Committed);
    }

    #[test]
    fn test_speculative_read_op_time() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "find")
            .unwrap();
        participant
            .set_speculative_transaction_op_time(&mut op_ctx, SpeculativeTransactionOpTime::AllCommitted);

        let speculative = participant.speculative_read_op_time();
        assert_eq!(speculative.term, replication_coordinator().get_term());

        // Commit forwards the speculative op-time to the client.
        participant.commit_unprepared_transaction(&mut op_ctx).unwrap();
        if !speculative.is_null() {
            assert!(op_ctx.client().last_op() >= speculative);
        }
    }

    #[test]
    fn test_operation_size_guard_leaves_prior_state_intact() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();

        let big = |tag: &str| {
            let mut doc = Document::new();
            doc.insert(
                tag.to_string(),
                Value::String("x".repeat(9 * 1024 * 1024)),
            );
            ReplOperation::insert("test.blobs", doc)
        };

        participant
            .add_transaction_operation(&op_ctx, big("first"))
            .unwrap();
        let err = participant
            .add_transaction_operation(&op_ctx, big("second"))
            .unwrap_err();
        assert!(matches!(err, TxnError::TransactionTooLarge { .. }));

        // The first operation is still buffered.
        let ops = participant
            .end_transaction_and_retrieve_operations(&mut op_ctx)
            .unwrap();
        assert_eq!(ops.len(), 1);

        participant.abort_active_transaction(&mut op_ctx).unwrap();
    }

    #[test]
    fn test_prepare_on_secondary_uses_supplied_op_time() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();

        let supplied = OpTime::new(storage_engine().next_timestamp(), 1);
        let prepare_ts = participant
            .prepare_transaction(&mut op_ctx, Some(supplied))
            .unwrap();
        assert_eq!(prepare_ts, supplied.timestamp);
        assert_eq!(participant.state(), TransactionState::Prepared);
        // On a secondary the position is the primary's; nothing was
        // reserved locally.
        assert_eq!(participant.prepare_op_time(), OpTime::null());

        participant
            .commit_prepared_transaction(&mut op_ctx, Timestamp(prepare_ts.0 + 1))
            .unwrap();
    }

    #[test]
    fn test_restart_flag_after_prepared_abort() {
        let _role = CLUSTER_ROLE_LOCK.lock();
        config::set_cluster_role(ClusterRole::ShardServer);

        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        participant.prepare_transaction(&mut op_ctx, None).unwrap();
        participant.abort_active_transaction(&mut op_ctx).unwrap();

        assert!(participant.restart_blocked_after_prepare_abort());

        // The conservative behavior still allows the restart; the flag is
        // what surfaces the outstanding case.
        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        assert!(!participant.restart_blocked_after_prepare_abort());
        assert_eq!(participant.state(), TransactionState::InProgress);

        config::set_cluster_role(ClusterRole::None);
    }

    #[test]
    fn test_prepare_failpoint_pauses_until_cleared() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();

        HANG_AFTER_RESERVING_PREPARE_TIMESTAMP.enable();
        let disabler = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            HANG_AFTER_RESERVING_PREPARE_TIMESTAMP.disable();
        });

        let prepare_ts = participant.prepare_transaction(&mut op_ctx, None).unwrap();
        disabler.join().unwrap();
        assert!(!prepare_ts.is_null());

        participant.abort_active_transaction(&mut op_ctx).unwrap();
    }

    #[test]
    fn test_shutdown_drops_stash_and_ignores_later_stashes() {
        let session = make_session();
        let participant = session.participant();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "find")
            .unwrap();
        participant.stash_transaction_resources(&mut op_ctx).unwrap();
        assert!(participant.has_stashed_resources());

        participant.shutdown();
        assert!(!participant.has_stashed_resources());
    }

    #[test]
    fn test_metrics_follow_lifecycle() {
        let session = make_session();
        let participant = session.participant();
        let server = crate::txn::metrics::server_transactions_metrics();

        let started_before = server.total_started();
        let committed_before = server.total_committed();
        let prepared_before = server.total_prepared();

        participant.begin_or_continue(5, Some(false), Some(true)).unwrap();
        let mut op_ctx = make_op(&session, 5);
        participant
            .unstash_transaction_resources(&mut op_ctx, "insert")
            .unwrap();
        let prepare_ts = participant.prepare_transaction(&mut op_ctx, None).unwrap();
        participant
            .commit_prepared_transaction(&mut op_ctx, Timestamp(prepare_ts.0 + 1))
            .unwrap();

        // Other sessions may run concurrently; totals only ever grow.
        assert!(server.total_started() > started_before);
        assert!(server.total_committed() > committed_before);
        assert!(server.total_prepared() > prepared_before);
    }
}
