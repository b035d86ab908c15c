//! Transaction state machine
//!
//! Every state change a participant makes goes through `transition_to`,
//! which validates against the legal transition table. The machine lives
//! inside the participant's mutex-guarded state, so it cannot be queried
//! or advanced without holding the participant mutex.

use std::fmt;
use std::ops::BitOr;

/// Lifecycle state of the transaction bound to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// No multi-document transaction: idle, or a retryable write
    None,
    InProgress,
    Prepared,
    CommittingWithoutPrepare,
    CommittingWithPrepare,
    Committed,
    Aborted,
}

impl TransactionState {
    const fn flag(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::None => "None",
            TransactionState::InProgress => "InProgress",
            TransactionState::Prepared => "Prepared",
            TransactionState::CommittingWithoutPrepare => "CommittingWithoutPrepare",
            TransactionState::CommittingWithPrepare => "CommittingWithPrepare",
            TransactionState::Committed => "Committed",
            TransactionState::Aborted => "Aborted",
        };
        write!(f, "TxnState::{}", name)
    }
}

/// A set of states, used for membership checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSet(u8);

impl StateSet {
    pub const fn empty() -> Self {
        StateSet(0)
    }

    pub fn contains(&self, state: TransactionState) -> bool {
        self.0 & state.flag() != 0
    }
}

impl From<TransactionState> for StateSet {
    fn from(state: TransactionState) -> Self {
        StateSet(state.flag())
    }
}

impl BitOr for TransactionState {
    type Output = StateSet;

    fn bitor(self, rhs: TransactionState) -> StateSet {
        StateSet(self.flag() | rhs.flag())
    }
}

impl BitOr<TransactionState> for StateSet {
    type Output = StateSet;

    fn bitor(self, rhs: TransactionState) -> StateSet {
        StateSet(self.0 | rhs.flag())
    }
}

/// Whether a transition is checked against the legal transition table.
/// Recovery and refresh paths may jump states the normal lifecycle cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionValidation {
    Validate,
    Relax,
}

/// The participant's state machine
#[derive(Debug)]
pub struct StateMachine {
    state: TransactionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: TransactionState::None,
        }
    }

    pub fn current(&self) -> TransactionState {
        self.state
    }

    /// Advance to `new_state`. Any transition outside the legal table is a
    /// programming error unless validation is relaxed.
    pub fn transition_to(&mut self, new_state: TransactionState, validation: TransitionValidation) {
        if validation == TransitionValidation::Validate {
            assert!(
                is_legal_transition(self.state, new_state),
                "current state: {}, illegal attempted next state: {}",
                self.state,
                new_state
            );
        }
        self.state = new_state;
    }

    pub fn is_none(&self) -> bool {
        self.state == TransactionState::None
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == TransactionState::InProgress
    }

    pub fn is_prepared(&self) -> bool {
        self.state == TransactionState::Prepared
    }

    pub fn is_committing_without_prepare(&self) -> bool {
        self.state == TransactionState::CommittingWithoutPrepare
    }

    pub fn is_committing_with_prepare(&self) -> bool {
        self.state == TransactionState::CommittingWithPrepare
    }

    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    pub fn is_aborted(&self) -> bool {
        self.state == TransactionState::Aborted
    }

    pub fn is_in_set(&self, set: StateSet) -> bool {
        set.contains(self.state)
    }

    /// Whether a multi-document transaction is underway (active or
    /// prepared, stashed or not).
    pub fn in_multi_document_transaction(&self) -> bool {
        matches!(
            self.state,
            TransactionState::InProgress | TransactionState::Prepared
        )
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn is_legal_transition(old_state: TransactionState, new_state: TransactionState) -> bool {
    use TransactionState::*;
    match old_state {
        None => matches!(new_state, None | InProgress),
        InProgress => matches!(
            new_state,
            None | Prepared | CommittingWithoutPrepare | Aborted
        ),
        Prepared => matches!(new_state, CommittingWithPrepare | Aborted),
        CommittingWithoutPrepare | CommittingWithPrepare => {
            matches!(new_state, None | Committed | Aborted)
        }
        Committed => matches!(new_state, None | InProgress),
        Aborted => matches!(new_state, None | InProgress),
    }
}

#[cfg(test)]
mod tests {
    use super::TransactionState::*;
    use super::*;

    const ALL_STATES: [TransactionState; 7] = [
        None,
        InProgress,
        Prepared,
        CommittingWithoutPrepare,
        CommittingWithPrepare,
        Committed,
        Aborted,
    ];

    fn legal_targets(state: TransactionState) -> Vec<TransactionState> {
        match state {
            None => vec![None, InProgress],
            InProgress => vec![None, Prepared, CommittingWithoutPrepare, Aborted],
            Prepared => vec![CommittingWithPrepare, Aborted],
            CommittingWithoutPrepare => vec![None, Committed, Aborted],
            CommittingWithPrepare => vec![None, Committed, Aborted],
            Committed => vec![None, InProgress],
            Aborted => vec![None, InProgress],
        }
    }

    #[test]
    fn test_every_legal_transition_succeeds() {
        for old in ALL_STATES {
            for new in legal_targets(old) {
                let mut machine = StateMachine::new();
                machine.state = old;
                machine.transition_to(new, TransitionValidation::Validate);
                assert_eq!(machine.current(), new);
            }
        }
    }

    #[test]
    fn test_every_illegal_transition_panics() {
        for old in ALL_STATES {
            let legal = legal_targets(old);
            for new in ALL_STATES {
                if legal.contains(&new) {
                    continue;
                }
                let result = std::panic::catch_unwind(move || {
                    let mut machine = StateMachine::new();
                    machine.state = old;
                    machine.transition_to(new, TransitionValidation::Validate);
                });
                assert!(
                    result.is_err(),
                    "transition {} -> {} should be illegal",
                    old,
                    new
                );
            }
        }
    }

    #[test]
    fn test_relaxed_transition_skips_validation() {
        let mut machine = StateMachine::new();
        machine.transition_to(Committed, TransitionValidation::Relax);
        assert!(machine.is_committed());
    }

    #[test]
    fn test_state_sets() {
        let set = InProgress | Aborted;
        assert!(set.contains(InProgress));
        assert!(set.contains(Aborted));
        assert!(!set.contains(Prepared));

        let wider = set | Prepared;
        assert!(wider.contains(Prepared));
    }

    #[test]
    fn test_multi_document_predicate() {
        let mut machine = StateMachine::new();
        assert!(!machine.in_multi_document_transaction());
        machine.transition_to(InProgress, TransitionValidation::Validate);
        assert!(machine.in_multi_document_transaction());
        machine.transition_to(Prepared, TransitionValidation::Validate);
        assert!(machine.in_multi_document_transaction());
    }
}
