//! Lock manager
//!
//! Per-operation lock bookkeeping (`LockState`), the execution ticket pool
//! that bounds concurrent storage access, and the global lock table used
//! for intent-exclusive admission of transactional statements.

use std::thread::ThreadId;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::{Result, TxnError};

/// Default number of execution tickets
const TICKET_POOL_CAPACITY: u32 = 128;

// ============================================================================
// Ticket Pool
// ============================================================================

static TICKET_POOL: Lazy<TicketPool> = Lazy::new(|| TicketPool::new(TICKET_POOL_CAPACITY));

/// Get the global execution ticket pool
pub fn ticket_pool() -> &'static TicketPool {
    &TICKET_POOL
}

/// Bounded pool of execution tickets
pub struct TicketPool {
    available: Mutex<u32>,
    capacity: u32,
}

impl TicketPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            available: Mutex::new(capacity),
            capacity,
        }
    }

    /// Take a ticket if one is available
    pub fn try_acquire(&self) -> bool {
        let mut available = self.available.lock();
        if *available == 0 {
            return false;
        }
        *available -= 1;
        true
    }

    /// Return a ticket to the pool
    pub fn release(&self) {
        let mut available = self.available.lock();
        assert!(*available < self.capacity, "ticket released twice");
        *available += 1;
    }

    pub fn available(&self) -> u32 {
        *self.available.lock()
    }
}

// ============================================================================
// Global Lock Table
// ============================================================================

static GLOBAL_LOCK_TABLE: Lazy<GlobalLockTable> = Lazy::new(GlobalLockTable::new);

/// Get the global lock table
pub fn global_lock_table() -> &'static GlobalLockTable {
    &GLOBAL_LOCK_TABLE
}

struct GlobalLockTableInner {
    exclusive_held: bool,
    intent_count: u32,
}

/// The node-wide lock gating storage access
pub struct GlobalLockTable {
    inner: Mutex<GlobalLockTableInner>,
    cv: Condvar,
}

impl GlobalLockTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(GlobalLockTableInner {
                exclusive_held: false,
                intent_count: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Acquire in intent-exclusive mode, waiting at most `timeout` if one
    /// is given.
    fn lock_intent_exclusive(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        while inner.exclusive_held {
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut inner, deadline).timed_out() {
                        return Err(TxnError::LockTimeout(
                            "global lock not acquired in intent-exclusive mode within the \
                             transaction lock timeout"
                                .to_string(),
                        ));
                    }
                }
                None => self.cv.wait(&mut inner),
            }
        }
        inner.intent_count += 1;
        Ok(())
    }

    fn unlock_intent_exclusive(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.intent_count > 0, "intent lock released twice");
        inner.intent_count -= 1;
        drop(inner);
        self.cv.notify_all();
    }

    /// Acquire in exclusive mode, blocking out all intent holders.
    pub fn lock_exclusive(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        while inner.exclusive_held || inner.intent_count > 0 {
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut inner, deadline).timed_out() {
                        return Err(TxnError::LockTimeout(
                            "global lock not acquired in exclusive mode".to_string(),
                        ));
                    }
                }
                None => self.cv.wait(&mut inner),
            }
        }
        inner.exclusive_held = true;
        Ok(())
    }

    pub fn unlock_exclusive(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.exclusive_held, "exclusive lock released twice");
        inner.exclusive_held = false;
        drop(inner);
        self.cv.notify_all();
    }
}

// ============================================================================
// Lock State
// ============================================================================

/// Whether the owning operation is currently inside the lock manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Inactive,
    Active,
}

/// Per-operation lock bookkeeping
///
/// Owned by an operation context, captured into a transaction's stashed
/// resources between statements, and swapped out entirely for the duration
/// of a side transaction. Swaps must hold the client mutex.
#[derive(Debug)]
pub struct LockState {
    client_state: ClientState,
    has_ticket: bool,
    max_lock_timeout: Option<Duration>,
    thread_tag: Option<ThreadId>,
    wuow_nesting: u32,
    global_intent_held: u32,
}

impl LockState {
    /// A fresh lock state holding nothing
    pub fn new() -> Self {
        Self {
            client_state: ClientState::Inactive,
            has_ticket: false,
            max_lock_timeout: None,
            thread_tag: Some(std::thread::current().id()),
            wuow_nesting: 0,
            global_intent_held: 0,
        }
    }

    pub fn client_state(&self) -> ClientState {
        self.client_state
    }

    // ---- tickets ----

    /// Take an execution ticket from the pool. Idempotent when one is held.
    pub fn acquire_ticket(&mut self) -> Result<()> {
        if self.has_ticket {
            return Ok(());
        }
        if !ticket_pool().try_acquire() {
            return Err(TxnError::TicketExhausted);
        }
        self.has_ticket = true;
        Ok(())
    }

    /// Return the held ticket to the pool
    pub fn release_ticket(&mut self) {
        if self.has_ticket {
            ticket_pool().release();
            self.has_ticket = false;
        }
    }

    /// Take the ticket back after a stash released it
    pub fn reacquire_ticket(&mut self) -> Result<()> {
        self.acquire_ticket()
    }

    pub fn has_ticket(&self) -> bool {
        self.has_ticket
    }

    // ---- lock timeout ----

    pub fn set_max_lock_timeout(&mut self, timeout: Duration) {
        self.max_lock_timeout = Some(timeout);
    }

    pub fn unset_max_lock_timeout(&mut self) {
        self.max_lock_timeout = None;
    }

    pub fn max_lock_timeout(&self) -> Option<Duration> {
        self.max_lock_timeout
    }

    // ---- thread affinity ----

    pub fn unset_thread_tag(&mut self) {
        self.thread_tag = None;
    }

    pub fn tag_current_thread(&mut self) {
        self.thread_tag = Some(std::thread::current().id());
    }

    pub fn thread_tag(&self) -> Option<ThreadId> {
        self.thread_tag
    }

    // ---- write unit of work nesting ----

    pub fn begin_write_unit_of_work(&mut self) {
        self.wuow_nesting += 1;
    }

    /// End the write unit of work at nesting level 1
    pub fn end_write_unit_of_work(&mut self) {
        assert!(self.wuow_nesting > 0, "not in a write unit of work");
        self.wuow_nesting -= 1;
    }

    pub fn in_a_write_unit_of_work(&self) -> bool {
        self.wuow_nesting > 0
    }

    // ---- global lock ----

    /// Acquire the global lock in intent-exclusive mode, honoring the
    /// configured max lock timeout.
    pub fn lock_global_intent_exclusive(&mut self) -> Result<()> {
        self.client_state = ClientState::Active;
        let result = global_lock_table().lock_intent_exclusive(self.max_lock_timeout);
        self.client_state = ClientState::Inactive;
        result?;
        self.global_intent_held += 1;
        Ok(())
    }

    pub fn global_intent_held(&self) -> u32 {
        self.global_intent_held
    }

    fn release_global_locks(&mut self) {
        while self.global_intent_held > 0 {
            global_lock_table().unlock_intent_exclusive();
            self.global_intent_held -= 1;
        }
    }

    /// Lock statistics for reporting
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "globalIntentExclusive": self.global_intent_held,
            "ticket": self.has_ticket,
        })
    }
}

impl Default for LockState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockState {
    fn drop(&mut self) {
        self.release_global_locks();
        self.release_ticket();
    }
}
