//! NimbusBase Transaction Core
//!
//! The per-session transaction participant of a replicated document database
//! node. Owns the transaction state machine, binds transactions to the
//! storage engine's snapshot and locking primitives, reserves ordered
//! positions in the replication log for prepare/commit/abort records, and
//! enforces the invariants that make two-phase commit across replicas
//! correct.

pub mod config;
pub mod data;
pub mod failpoint;
pub mod lock;
pub mod ops;
pub mod repl;
pub mod session;
pub mod storage;
pub mod txn;

// Re-export main types
pub use ops::OperationContext;
pub use repl::{OpTime, OplogSlot, Timestamp};
pub use session::Session;
pub use txn::{TransactionParticipant, TransactionState};

/// Transaction core error type
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TxnError {
    #[error("no such transaction: {0}")]
    NoSuchTransaction(String),

    #[error("conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("prepared transaction in progress: {0}")]
    PreparedTransactionInProgress(String),

    #[error("transaction too large: total operation size {actual} exceeds {limit}")]
    TransactionTooLarge { actual: u64, limit: u64 },

    #[error("operation not supported in transaction: {0}")]
    OperationNotSupportedInTransaction(String),

    #[error("transaction {0} has been committed")]
    TransactionCommitted(i64),

    #[error("operation exceeded time limit: {0}")]
    ExceededTimeLimit(String),

    #[error("lock request timed out: {0}")]
    LockTimeout(String),

    #[error("no execution tickets available")]
    TicketExhausted,
}

pub type Result<T> = std::result::Result<T, TxnError>;

/// Abort the process after logging. Used on paths where failure would leave
/// a prepared storage transaction in an undefined state.
pub(crate) fn fatal(msg: &str) -> ! {
    log::error!("fatal transaction error, terminating process: {}", msg);
    std::process::abort();
}
