//! Session
//!
//! One logical session per client connection. The session owns its
//! transaction participant and the per-session facts the participant keeps
//! consulting: the active transaction number, the number lock taken while a
//! transaction is prepared, and the refresh state written by migration and
//! session kill, which do not check out the session.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::ops::OperationHandle;
use crate::txn::{TransactionParticipant, TxnNumber, UNINITIALIZED_TXN_NUMBER};
use crate::{Result, TxnError};

/// State written by a migration or session kill, observed by the
/// participant at its next entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshState {
    pub refresh_count: u64,
    pub txn_number: TxnNumber,
    pub is_committed: bool,
}

/// Session facts shared between the session and its participant
pub struct SessionState {
    session_id: u64,
    active_txn_number: Mutex<TxnNumber>,
    /// While a transaction is prepared, the number is locked and the stored
    /// error is returned to any attempt to advance it.
    txn_number_lock: Mutex<Option<(TxnNumber, TxnError)>>,
    refresh: Mutex<Option<RefreshState>>,
    current_operation: Mutex<Option<Arc<OperationHandle>>>,
}

impl SessionState {
    fn new(session_id: u64) -> Self {
        Self {
            session_id,
            active_txn_number: Mutex::new(UNINITIALIZED_TXN_NUMBER),
            txn_number_lock: Mutex::new(None),
            refresh: Mutex::new(None),
            current_operation: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn active_txn_number(&self) -> TxnNumber {
        *self.active_txn_number.lock()
    }

    /// Advance the session's transaction number. Fails with the stored
    /// error while the number is locked to a different number.
    pub fn advance_txn_number(&self, txn_number: TxnNumber) -> Result<()> {
        let lock = self.txn_number_lock.lock();
        if let Some((locked_number, error)) = lock.as_ref() {
            if txn_number != *locked_number {
                return Err(error.clone());
            }
        }
        drop(lock);

        let mut active = self.active_txn_number.lock();
        if txn_number > *active {
            *active = txn_number;
        }
        Ok(())
    }

    /// Pin the transaction number, storing the error returned to anyone
    /// who tries to change it.
    pub fn lock_txn_number(&self, txn_number: TxnNumber, error: TxnError) {
        *self.txn_number_lock.lock() = Some((txn_number, error));
    }

    pub fn unlock_txn_number(&self) {
        *self.txn_number_lock.lock() = None;
    }

    pub fn last_refresh_state(&self) -> Option<RefreshState> {
        *self.refresh.lock()
    }

    /// Install refreshed session state, as migration does when it moves a
    /// session onto this node without checking it out.
    pub fn refresh(&self, txn_number: TxnNumber, is_committed: bool) -> Result<()> {
        self.advance_txn_number(txn_number)?;
        let mut refresh = self.refresh.lock();
        let refresh_count = refresh.map(|r| r.refresh_count).unwrap_or(0) + 1;
        *refresh = Some(RefreshState {
            refresh_count,
            txn_number,
            is_committed,
        });
        Ok(())
    }

    /// A session kill bumps the refresh counter without changing the
    /// transaction number; the participant reconciles at its next entry.
    pub fn kill(&self) {
        let txn_number = self.active_txn_number();
        let mut refresh = self.refresh.lock();
        let refresh_count = refresh.map(|r| r.refresh_count).unwrap_or(0) + 1;
        *refresh = Some(RefreshState {
            refresh_count,
            txn_number,
            is_committed: false,
        });
    }

    pub fn set_current_operation(&self, handle: Arc<OperationHandle>) {
        *self.current_operation.lock() = Some(handle);
    }

    pub fn current_operation(&self) -> Option<Arc<OperationHandle>> {
        self.current_operation.lock().clone()
    }

    pub fn clear_current_operation(&self, handle: &Arc<OperationHandle>) {
        let mut current = self.current_operation.lock();
        if let Some(existing) = current.as_ref() {
            if Arc::ptr_eq(existing, handle) {
                *current = None;
            }
        }
    }
}

/// A logical session and its transaction participant
pub struct Session {
    state: Arc<SessionState>,
    participant: TransactionParticipant,
}

impl Session {
    pub fn new(session_id: u64) -> Arc<Self> {
        let state = Arc::new(SessionState::new(session_id));
        let participant = TransactionParticipant::new(Arc::clone(&state));
        Arc::new(Self { state, participant })
    }

    pub fn session_id(&self) -> u64 {
        self.state.session_id()
    }

    pub fn participant(&self) -> &TransactionParticipant {
        &self.participant
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn active_txn_number(&self) -> TxnNumber {
        self.state.active_txn_number()
    }

    pub fn set_current_operation(&self, handle: Arc<OperationHandle>) {
        self.state.set_current_operation(handle);
    }

    pub fn current_operation(&self) -> Option<Arc<OperationHandle>> {
        self.state.current_operation()
    }

    pub fn clear_current_operation(&self, handle: &Arc<OperationHandle>) {
        self.state.clear_current_operation(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_number_lock_blocks_advance() {
        let state = SessionState::new(7);
        state.advance_txn_number(5).unwrap();

        state.lock_txn_number(
            5,
            TxnError::PreparedTransactionInProgress(
                "cannot change transaction number while the session has a prepared transaction"
                    .to_string(),
            ),
        );
        let err = state.advance_txn_number(6).unwrap_err();
        assert!(matches!(err, TxnError::PreparedTransactionInProgress(_)));
        assert_eq!(state.active_txn_number(), 5);

        // The locked number itself is still accepted.
        state.advance_txn_number(5).unwrap();

        state.unlock_txn_number();
        state.advance_txn_number(6).unwrap();
        assert_eq!(state.active_txn_number(), 6);
    }

    #[test]
    fn test_txn_number_never_decreases() {
        let state = SessionState::new(7);
        state.advance_txn_number(10).unwrap();
        state.advance_txn_number(3).unwrap();
        assert_eq!(state.active_txn_number(), 10);
    }

    #[test]
    fn test_refresh_bumps_counter() {
        let state = SessionState::new(7);
        assert!(state.last_refresh_state().is_none());

        state.refresh(4, false).unwrap();
        let first = state.last_refresh_state().unwrap();
        assert_eq!(first.refresh_count, 1);
        assert_eq!(first.txn_number, 4);

        state.kill();
        let second = state.last_refresh_state().unwrap();
        assert_eq!(second.refresh_count, 2);
        assert_eq!(second.txn_number, 4);
    }
}
