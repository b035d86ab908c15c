//! Storage engine
//!
//! Process-wide timestamp source and visibility boundaries. The engine
//! tracks open position reservations (oplog holes): the all-committed
//! boundary never advances past the oldest open reservation, which is what
//! forces snapshot readers to wait out an in-flight prepare.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::recovery_unit::RecoveryUnit;
use crate::repl::Timestamp;

static STORAGE_ENGINE: Lazy<StorageEngine> = Lazy::new(StorageEngine::new);

/// Get the global storage engine
pub fn storage_engine() -> &'static StorageEngine {
    &STORAGE_ENGINE
}

pub struct StorageEngine {
    /// Global timestamp generator
    next_ts: AtomicU64,
    /// Highest committed storage timestamp
    latest_committed: AtomicU64,
    /// Highest oplog position applied on this node
    last_applied: AtomicU64,
    /// Open position reservations, ordered
    reservations: Mutex<BTreeSet<u64>>,
}

impl StorageEngine {
    fn new() -> Self {
        Self {
            next_ts: AtomicU64::new(1),
            latest_committed: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            reservations: Mutex::new(BTreeSet::new()),
        }
    }

    /// Open a new storage transaction handle
    pub fn new_recovery_unit(&self) -> RecoveryUnit {
        RecoveryUnit::new()
    }

    /// Allocate the next timestamp
    pub fn next_timestamp(&self) -> Timestamp {
        Timestamp(self.next_ts.fetch_add(1, Ordering::SeqCst))
    }

    /// Fold an externally supplied timestamp into the clock so later
    /// allocations order after it.
    pub fn observe_timestamp(&self, ts: Timestamp) {
        self.next_ts.fetch_max(ts.0 + 1, Ordering::SeqCst);
    }

    /// Allocate the next timestamp and hold it open as a reservation
    pub fn reserve_timestamp(&self) -> Timestamp {
        let mut reservations = self.reservations.lock();
        let ts = self.next_timestamp();
        reservations.insert(ts.0);
        ts
    }

    /// Release a reservation. Idempotent: the position may already have
    /// been released by the log write that filled it.
    pub fn release_reservation(&self, ts: Timestamp) {
        self.reservations.lock().remove(&ts.0);
    }

    /// Record a committed storage timestamp
    pub fn note_committed(&self, ts: Timestamp) {
        self.latest_committed.fetch_max(ts.0, Ordering::SeqCst);
    }

    /// Record an applied oplog position
    pub fn note_applied(&self, ts: Timestamp) {
        self.last_applied.fetch_max(ts.0, Ordering::SeqCst);
    }

    /// The all-committed boundary: everything at or below this timestamp is
    /// committed and there is no open hole at or below it.
    pub fn all_committed_timestamp(&self) -> Timestamp {
        let committed = self.latest_committed.load(Ordering::SeqCst);
        let reservations = self.reservations.lock();
        match reservations.iter().next() {
            Some(&oldest_hole) => Timestamp(committed.min(oldest_hole - 1)),
            None => Timestamp(committed),
        }
    }

    /// The last-applied boundary
    pub fn last_applied_timestamp(&self) -> Timestamp {
        Timestamp(self.last_applied.load(Ordering::SeqCst))
    }

    /// Whether a reservation is still open at `ts`
    pub fn has_reservation(&self, ts: Timestamp) -> bool {
        self.reservations.lock().contains(&ts.0)
    }

    /// Number of open reservations (for monitoring)
    pub fn open_reservation_count(&self) -> usize {
        self.reservations.lock().len()
    }
}
