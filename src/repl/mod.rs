//! Replication module - terms, log positions, and the oplog
//!
//! The coordinator allocates ordered log positions (creating holes that
//! gate snapshot readers), the oplog stores transaction records, and the
//! operation observer is the seam the participant publishes through.

pub mod coordinator;
pub mod observer;
pub mod oplog;
pub mod optime;
pub mod read_concern;

pub use coordinator::{replication_coordinator, ReplicationCoordinator};
pub use observer::{op_observer, OpObserver, OplogWriter};
pub use oplog::{EntryKind, Oplog, OplogEntry, OperationKind, ReplOperation};
pub use optime::{OpTime, OplogSlot, Timestamp};
pub use read_concern::{ReadConcernArgs, ReadConcernLevel};
