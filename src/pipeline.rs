//! Shared pipeline plumbing: stage counters and the shutdown signal.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

// ============================================================
// PIPELINE STATISTICS
// ============================================================

/// Counters across every stage. Updated lock-free by workers.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Submissions seen at admission
    pub submitted: AtomicU64,
    pub accepted: AtomicU64,
    /// Rejected because the queue was full (backpressure)
    pub rejected_full: AtomicU64,

    /// Trades written to the fast store and durable queue
    pub staged: AtomicU64,
    pub insufficient_funds: AtomicU64,
    /// Any other staging failure (not found, contention, store errors)
    pub failed: AtomicU64,
    pub compensations: AtomicU64,

    /// Stream entries published to the event log
    pub bridged: AtomicU64,
    pub bridge_poison: AtomicU64,

    /// Events committed to the ledger
    pub ledger_committed: AtomicU64,
    /// Events dropped by the per-user batch dedup
    pub ledger_dropped: AtomicU64,
    pub ledger_commit_failures: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            staged: self.staged.load(Ordering::Relaxed),
            insufficient_funds: self.insufficient_funds.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            bridged: self.bridged.load(Ordering::Relaxed),
            bridge_poison: self.bridge_poison.load(Ordering::Relaxed),
            ledger_committed: self.ledger_committed.load(Ordering::Relaxed),
            ledger_dropped: self.ledger_dropped.load(Ordering::Relaxed),
            ledger_commit_failures: self.ledger_commit_failures.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of stats (for reporting)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub submitted: u64,
    pub accepted: u64,
    pub rejected_full: u64,
    pub staged: u64,
    pub insufficient_funds: u64,
    pub failed: u64,
    pub compensations: u64,
    pub bridged: u64,
    pub bridge_poison: u64,
    pub ledger_committed: u64,
    pub ledger_dropped: u64,
    pub ledger_commit_failures: u64,
}

impl std::fmt::Display for PipelineStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pipeline Stats: submitted={}, accepted={}, queue_full={}, staged={}, insufficient={}, failed={}, compensated={}, bridged={}, poison={}, committed={}, dropped={}, commit_failures={}",
            self.submitted,
            self.accepted,
            self.rejected_full,
            self.staged,
            self.insufficient_funds,
            self.failed,
            self.compensations,
            self.bridged,
            self.bridge_poison,
            self.ledger_committed,
            self.ledger_dropped,
            self.ledger_commit_failures
        )
    }
}

// ============================================================
// SHUTDOWN SIGNALING
// ============================================================

/// Shutdown signal for graceful pipeline termination
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    shutdown: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }
}
