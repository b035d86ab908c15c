//! Read concern arguments
//!
//! The read-concern of the first statement of a transaction is captured
//! with the stashed resources and restored on unstash; later statements may
//! not carry their own.

use serde::{Deserialize, Serialize};

use super::optime::Timestamp;

/// Read concern level requested by a statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConcernLevel {
    #[default]
    Local,
    Majority,
    Snapshot,
}

/// Read concern carried by an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadConcernArgs {
    pub level: Option<ReadConcernLevel>,
    pub after_cluster_time: Option<Timestamp>,
}

impl ReadConcernArgs {
    pub fn new(level: ReadConcernLevel) -> Self {
        Self {
            level: Some(level),
            after_cluster_time: None,
        }
    }

    /// Whether the statement carried no read concern of its own
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.after_cluster_time.is_none()
    }
}
