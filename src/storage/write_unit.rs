//! Write unit of work
//!
//! A scoped storage write batch. This system nests only to level 1: the
//! participant's transaction owns the single top-level unit, and side
//! transactions swap the whole recovery unit out rather than nesting.

/// Recovery-unit activity as seen from the operation context. Captured when
/// a write unit of work is released and restored when it resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryUnitState {
    NotInUnitOfWork,
    ActiveUnitOfWork,
}

/// The top-level write batch of a transaction
#[derive(Debug)]
pub struct WriteUnitOfWork {
    committed: bool,
    prepared: bool,
}

impl WriteUnitOfWork {
    pub fn new() -> Self {
        Self {
            committed: false,
            prepared: false,
        }
    }

    /// Rebuild a unit of work on top of a previously released checkpoint,
    /// resuming the storage snapshot it left behind.
    pub fn resume_from(state: RecoveryUnitState) -> Self {
        assert_eq!(
            state,
            RecoveryUnitState::ActiveUnitOfWork,
            "can only resume a released unit of work"
        );
        Self::new()
    }

    /// Detach this unit of work, leaving the storage transaction running.
    /// Returns the checkpoint needed to resume it.
    pub fn release(self) -> RecoveryUnitState {
        RecoveryUnitState::ActiveUnitOfWork
    }

    pub fn mark_prepared(&mut self) {
        self.prepared = true;
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn mark_committed(&mut self) {
        self.committed = true;
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

impl Default for WriteUnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}
