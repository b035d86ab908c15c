//! Transaction participant - multi-document transaction support
//!
//! Owns the per-session transaction lifecycle for both multi-document
//! transactions and retryable writes.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │           TransactionParticipant                  │
//! │  - Active txn number, state machine, stash       │
//! │  - Buffered operations, prepare/read timestamps  │
//! │  - Expiration deadline, metrics observer         │
//! ├──────────────────────────────────────────────────┤
//! │  TxnResources / OplogSlotReserver /              │
//! │  SideTransactionBlock                            │
//! │  - Movable capsules over lock state, recovery    │
//! │    unit, and write-unit-of-work checkpoint       │
//! ├──────────────────────────────────────────────────┤
//! │  StateMachine                                    │
//! │  - Validated transitions, relaxed mode for       │
//! │    refresh/recovery paths                        │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod gating;
pub mod metrics;
pub mod participant;
pub mod report;
pub mod resources;
pub mod state;

pub use participant::{SpeculativeTransactionOpTime, TransactionParticipant};
pub use resources::{OplogSlotReserver, SideTransactionBlock, TxnResources};
pub use state::{StateMachine, StateSet, TransactionState, TransitionValidation};

/// A session-scoped transaction number
pub type TxnNumber = i64;

/// The number a participant carries before any transaction has started
pub const UNINITIALIZED_TXN_NUMBER: TxnNumber = -1;

/// Max cumulative serialized size of the operations buffered by one
/// transaction (the maximum internal document size).
pub const MAX_TRANSACTION_OPERATIONS_BYTES: u64 = 16 * 1024 * 1024 + 16 * 1024;
