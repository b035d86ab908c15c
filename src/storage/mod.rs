//! Storage module - engine bindings for transactions
//!
//! Recovery units (one storage transaction each), write units of work, and
//! the process-wide engine that hands out timestamps and tracks the
//! visibility boundaries snapshot readers advance to.

pub mod engine;
pub mod recovery_unit;
pub mod write_unit;

pub use engine::{storage_engine, StorageEngine};
pub use recovery_unit::{ReadSource, RecoveryUnit};
pub use write_unit::{RecoveryUnitState, WriteUnitOfWork};
