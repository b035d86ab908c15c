//! Log positions
//!
//! A `Timestamp` orders every event in the replication log; an `OpTime`
//! pairs it with the replication term that produced it. Timestamp zero is
//! the null sentinel.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in the logical clock of the replication log
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The null timestamp, ordered before every real one
    pub const NULL: Timestamp = Timestamp(0);

    #[inline]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A timestamp qualified by the replication term that assigned it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpTime {
    pub timestamp: Timestamp,
    pub term: u64,
}

impl OpTime {
    pub fn new(timestamp: Timestamp, term: u64) -> Self {
        Self { timestamp, term }
    }

    /// The null op-time: no position assigned yet
    pub fn null() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.timestamp.is_null()
    }
}

impl PartialOrd for OpTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.term, self.timestamp).cmp(&(other.term, other.timestamp))
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ts: {}, t: {} }}", self.timestamp, self.term)
    }
}

/// A reserved position in the replication log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OplogSlot {
    pub op_time: OpTime,
}

impl OplogSlot {
    pub fn new(op_time: OpTime) -> Self {
        Self { op_time }
    }
}
