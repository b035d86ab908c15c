//! Failpoints
//!
//! Named pause points for test synchronization. An enabled failpoint parks
//! the calling worker on a condvar until it is disabled from another thread.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

/// A single named failpoint
pub struct FailPoint {
    name: &'static str,
    enabled: Mutex<bool>,
    cv: Condvar,
}

impl FailPoint {
    const fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enable(&self) {
        *self.enabled.lock() = true;
    }

    pub fn disable(&self) {
        let mut enabled = self.enabled.lock();
        *enabled = false;
        self.cv.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.enabled.lock()
    }

    /// Block the calling thread until the failpoint is disabled.
    pub fn pause_while_set(&self) {
        let mut enabled = self.enabled.lock();
        while *enabled {
            self.cv.wait(&mut enabled);
        }
    }
}

/// Pauses an operation just after allocating the point-in-time storage
/// engine snapshot.
pub static HANG_AFTER_PREALLOCATE_SNAPSHOT: Lazy<FailPoint> =
    Lazy::new(|| FailPoint::new("hangAfterPreallocateSnapshot"));

/// Pauses a prepare just after its oplog position has been reserved.
pub static HANG_AFTER_RESERVING_PREPARE_TIMESTAMP: Lazy<FailPoint> =
    Lazy::new(|| FailPoint::new("hangAfterReservingPrepareTimestamp"));
