//! Server parameters for the transaction core
//!
//! Tunables are process-wide atomics so the expiration sweeper, command
//! paths, and tests can adjust them without a registry lookup.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};

use crate::{Result, TxnError};

/// Max number of milliseconds that any transaction lock request will wait
/// for lock acquisition. If an operation provides a greater timeout in a
/// lock request, this value overrides it. A negative value deactivates the
/// override entirely.
///
/// 5 milliseconds will help avoid deadlocks but still allows fast-running
/// metadata operations to complete without aborting transactions.
static MAX_TRANSACTION_LOCK_REQUEST_TIMEOUT_MILLIS: AtomicI64 = AtomicI64::new(5);

/// Lifetime given to each transaction, in seconds. Transactions must
/// eventually expire to preempt storage cache pressure immobilizing the
/// system.
static TRANSACTION_LIFETIME_LIMIT_SECONDS: AtomicI64 = AtomicI64::new(60);

/// Threshold above which a terminated transaction is logged as slow.
static SLOW_TRANSACTION_THRESHOLD_MILLIS: AtomicU64 = AtomicU64::new(100);

/// Whether test-only commands are admitted by the transaction allow-lists.
static TEST_COMMANDS_ENABLED: AtomicBool = AtomicBool::new(false);

/// Role of this node in a cluster. Restarting a transaction at the active
/// transaction number is only permitted on shard servers.
static CLUSTER_ROLE: AtomicU8 = AtomicU8::new(0);

/// Cluster role of this server process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    None,
    ShardServer,
}

pub fn max_transaction_lock_request_timeout_millis() -> i64 {
    MAX_TRANSACTION_LOCK_REQUEST_TIMEOUT_MILLIS.load(Ordering::Relaxed)
}

pub fn set_max_transaction_lock_request_timeout_millis(millis: i64) {
    MAX_TRANSACTION_LOCK_REQUEST_TIMEOUT_MILLIS.store(millis, Ordering::Relaxed);
}

pub fn transaction_lifetime_limit_seconds() -> i64 {
    TRANSACTION_LIFETIME_LIMIT_SECONDS.load(Ordering::Relaxed)
}

/// Set the transaction lifetime limit. Values below one second are rejected.
pub fn set_transaction_lifetime_limit_seconds(seconds: i64) -> Result<()> {
    if seconds < 1 {
        return Err(TxnError::InvalidOptions(
            "transactionLifetimeLimitSeconds must be greater than or equal to 1s".to_string(),
        ));
    }
    TRANSACTION_LIFETIME_LIMIT_SECONDS.store(seconds, Ordering::Relaxed);
    Ok(())
}

pub fn slow_transaction_threshold_millis() -> u64 {
    SLOW_TRANSACTION_THRESHOLD_MILLIS.load(Ordering::Relaxed)
}

pub fn set_slow_transaction_threshold_millis(millis: u64) {
    SLOW_TRANSACTION_THRESHOLD_MILLIS.store(millis, Ordering::Relaxed);
}

pub fn test_commands_enabled() -> bool {
    TEST_COMMANDS_ENABLED.load(Ordering::Relaxed)
}

pub fn set_test_commands_enabled(enabled: bool) {
    TEST_COMMANDS_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn cluster_role() -> ClusterRole {
    match CLUSTER_ROLE.load(Ordering::Relaxed) {
        0 => ClusterRole::None,
        _ => ClusterRole::ShardServer,
    }
}

pub fn set_cluster_role(role: ClusterRole) {
    let v = match role {
        ClusterRole::None => 0,
        ClusterRole::ShardServer => 1,
    };
    CLUSTER_ROLE.store(v, Ordering::Relaxed);
}
