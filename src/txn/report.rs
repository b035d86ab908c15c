//! Transaction reporting
//!
//! currentOp-style documents describing the transaction bound to a session.
//! A stashed (inactive) transaction reports through the participant mutex;
//! the unstashed report may only take the metrics mutex, because it is
//! produced while the caller holds the client mutex.

use serde_json::{json, Value};

use crate::repl::ReadConcernArgs;
use crate::txn::participant::TransactionParticipant;
use crate::txn::UNINITIALIZED_TXN_NUMBER;

impl TransactionParticipant {
    /// Describe the inactive transaction whose resources are stashed
    /// between statements. Returns nothing when no stash exists.
    pub fn report_stashed_state(&self) -> Option<Value> {
        let inner = self.lock_inner();
        let stash = inner.stash.as_ref()?;
        let lock_state = stash.lock_state()?;
        assert!(inner.active_txn_number != UNINITIALIZED_TXN_NUMBER);

        let metrics = self.lock_metrics();
        let stats = metrics.stats();
        let client = stats.last_client_host().unwrap_or("");

        Some(json!({
            "desc": "inactive transaction",
            "client": client,
            "lsid": self.session_state().session_id(),
            "transaction": {
                "parameters": {
                    "txnNumber": inner.active_txn_number,
                    "autocommit": inner.autocommit.unwrap_or(true),
                    "readConcern": serde_json::to_value(stash.read_concern()).ok(),
                },
                "readTimestamp": stats.read_timestamp().0,
            },
            "waitingForLock": false,
            "active": false,
            "locks": lock_state.stats(),
        }))
    }

    /// Describe the transaction when it is a retryable write, active on an
    /// operation, or already ended. Takes only the metrics mutex.
    pub fn report_unstashed_state(&self, read_concern: &ReadConcernArgs) -> Option<Value> {
        let metrics = self.lock_metrics();
        let stats = metrics.stats();

        // A transaction is unstashed if it is not actually a multi-document
        // transaction, or is active, or has ended; any stash would have
        // been cleared by then.
        if stats.is_for_multi_document_transaction() && !stats.is_active() && !stats.is_ended() {
            return None;
        }

        Some(json!({
            "transaction": {
                "parameters": {
                    "txnNumber": stats.txn_number(),
                    "autocommit": stats.auto_commit().unwrap_or(true),
                    "readConcern": serde_json::to_value(read_concern).ok(),
                },
                "readTimestamp": stats.read_timestamp().0,
            },
        }))
    }
}
