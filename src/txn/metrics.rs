//! Transaction metrics
//!
//! A process-wide aggregate plus a per-participant observer. The observer
//! is guarded by the participant's metrics mutex, which is always acquired
//! strictly inside the participant mutex; the aggregate uses lock-free
//! atomics so the fast path never blocks on reporting.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::repl::Timestamp;
use crate::txn::TxnNumber;

// ============================================================================
// Server-wide aggregate
// ============================================================================

static SERVER_TRANSACTIONS_METRICS: Lazy<ServerTransactionsMetrics> =
    Lazy::new(ServerTransactionsMetrics::new);

/// Get the process-wide transaction metrics aggregate
pub fn server_transactions_metrics() -> &'static ServerTransactionsMetrics {
    &SERVER_TRANSACTIONS_METRICS
}

/// Process-wide transaction counters
pub struct ServerTransactionsMetrics {
    current_active: AtomicI64,
    current_inactive: AtomicI64,
    current_open: AtomicI64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    total_prepared: AtomicU64,
}

impl ServerTransactionsMetrics {
    fn new() -> Self {
        Self {
            current_active: AtomicI64::new(0),
            current_inactive: AtomicI64::new(0),
            current_open: AtomicI64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
            total_prepared: AtomicU64::new(0),
        }
    }

    pub fn current_active(&self) -> i64 {
        self.current_active.load(Ordering::Relaxed)
    }

    pub fn current_inactive(&self) -> i64 {
        self.current_inactive.load(Ordering::Relaxed)
    }

    pub fn current_open(&self) -> i64 {
        self.current_open.load(Ordering::Relaxed)
    }

    pub fn total_started(&self) -> u64 {
        self.total_started.load(Ordering::Relaxed)
    }

    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::Relaxed)
    }

    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::Relaxed)
    }

    pub fn total_prepared(&self) -> u64 {
        self.total_prepared.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-transaction stats
// ============================================================================

/// Statistics for the single transaction currently bound to a session
#[derive(Debug, Default, Clone)]
pub struct SingleTransactionStats {
    txn_number: TxnNumber,
    auto_commit: Option<bool>,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
    read_timestamp: Timestamp,
    time_active: Duration,
    time_inactive: Duration,
    active_since: Option<Instant>,
    inactive_since: Option<Instant>,
    last_client_host: Option<String>,
}

impl SingleTransactionStats {
    fn new(txn_number: TxnNumber) -> Self {
        Self {
            txn_number,
            ..Default::default()
        }
    }

    pub fn txn_number(&self) -> TxnNumber {
        self.txn_number
    }

    pub fn auto_commit(&self) -> Option<bool> {
        self.auto_commit
    }

    pub fn is_for_multi_document_transaction(&self) -> bool {
        self.auto_commit == Some(false)
    }

    pub fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn read_timestamp(&self) -> Timestamp {
        self.read_timestamp
    }

    /// Total wall-clock duration since the transaction started
    pub fn duration(&self, now: Instant) -> Duration {
        match self.start_time {
            Some(start) => self.end_time.unwrap_or(now).duration_since(start),
            None => Duration::ZERO,
        }
    }

    /// Time spent with resources checked out onto an operation
    pub fn time_active(&self, now: Instant) -> Duration {
        match self.active_since {
            Some(since) => self.time_active + now.duration_since(since),
            None => self.time_active,
        }
    }

    /// Time spent stashed between statements
    pub fn time_inactive(&self, now: Instant) -> Duration {
        match self.inactive_since {
            Some(since) => self.time_inactive + now.duration_since(since),
            None => self.time_inactive,
        }
    }

    /// Host of the client that last ran a statement of this transaction
    pub fn last_client_host(&self) -> Option<&str> {
        self.last_client_host.as_deref()
    }
}

// ============================================================================
// Per-participant observer
// ============================================================================

/// Observes the lifecycle of the participant's current transaction and
/// keeps the server-wide aggregate in step.
#[derive(Debug, Default)]
pub struct TransactionMetricsObserver {
    stats: SingleTransactionStats,
}

impl TransactionMetricsObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &SingleTransactionStats {
        &self.stats
    }

    /// A new transaction started on the session. Transactions begin
    /// inactive; the first unstash makes them active.
    pub fn on_start(&mut self, auto_commit: Option<bool>, now: Instant) {
        self.stats = SingleTransactionStats::new(self.stats.txn_number);
        self.stats.auto_commit = auto_commit;
        self.stats.start_time = Some(now);
        self.stats.inactive_since = Some(now);

        let server = server_transactions_metrics();
        server.total_started.fetch_add(1, Ordering::Relaxed);
        server.current_open.fetch_add(1, Ordering::Relaxed);
        server.current_inactive.fetch_add(1, Ordering::Relaxed);
    }

    /// Resources were released onto an operation context
    pub fn on_unstash(&mut self, now: Instant) {
        if let Some(since) = self.stats.inactive_since.take() {
            self.stats.time_inactive += now.duration_since(since);
            server_transactions_metrics()
                .current_inactive
                .fetch_sub(1, Ordering::Relaxed);
        }
        if self.stats.active_since.is_none() {
            self.stats.active_since = Some(now);
            server_transactions_metrics()
                .current_active
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Resources were captured back into the stash
    pub fn on_stash(&mut self, now: Instant) {
        if let Some(since) = self.stats.active_since.take() {
            self.stats.time_active += now.duration_since(since);
            server_transactions_metrics()
                .current_active
                .fetch_sub(1, Ordering::Relaxed);
        }
        if self.stats.inactive_since.is_none() {
            self.stats.inactive_since = Some(now);
            server_transactions_metrics()
                .current_inactive
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn on_choose_read_timestamp(&mut self, read_timestamp: Timestamp) {
        self.stats.read_timestamp = read_timestamp;
    }

    /// Record which client ran the statement that just finished
    pub fn on_transaction_operation(&mut self, client_host: &str) {
        self.stats.last_client_host = Some(client_host.to_string());
    }

    pub fn on_prepare(&mut self) {
        server_transactions_metrics()
            .total_prepared
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_commit(&mut self, now: Instant) {
        self.on_end(now);
        server_transactions_metrics()
            .total_committed
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_abort(&mut self, now: Instant) {
        self.on_end(now);
        server_transactions_metrics()
            .total_aborted
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_end(&mut self, now: Instant) {
        let server = server_transactions_metrics();
        if let Some(since) = self.stats.active_since.take() {
            self.stats.time_active += now.duration_since(since);
            server.current_active.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(since) = self.stats.inactive_since.take() {
            self.stats.time_inactive += now.duration_since(since);
            server.current_inactive.fetch_sub(1, Ordering::Relaxed);
        }
        if self.stats.start_time.is_some() && self.stats.end_time.is_none() {
            self.stats.end_time = Some(now);
            server.current_open.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// A new transaction number was installed on the session
    pub fn reset(&mut self, txn_number: TxnNumber) {
        self.stats = SingleTransactionStats::new(txn_number);
    }
}
