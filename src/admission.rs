//! Admission queue and worker pool
//!
//! `submit` never blocks: a full queue is rejected immediately and that
//! rejection is the only backpressure signal callers get. Workers pull jobs
//! until the queue is closed *and* empty, so closing drains what was admitted.

use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::{AdmissionError, StageError};
use crate::models::{TradeJob, TradeRequest};
use crate::pipeline::PipelineStats;

/// Processes one admitted job. Implemented by the staging engine.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: TradeJob) -> Result<(), StageError>;
}

/// Bounded FIFO of trade jobs.
pub struct AdmissionQueue {
    queue: ArrayQueue<TradeJob>,
    closed: AtomicBool,
    available: Notify,
    next_job_id: AtomicU64,
    stats: Arc<PipelineStats>,
}

impl AdmissionQueue {
    pub fn new(capacity: usize, stats: Arc<PipelineStats>) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            available: Notify::new(),
            next_job_id: AtomicU64::new(1),
            stats,
        }
    }

    /// Enqueue a trade. Returns the job id on acceptance.
    pub fn submit(&self, trade: TradeRequest) -> Result<u64, AdmissionError> {
        PipelineStats::incr(&self.stats.submitted);
        if self.is_closed() {
            return Err(AdmissionError::Closed);
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        match self.queue.push(TradeJob::new(job_id, trade)) {
            Ok(()) => {
                PipelineStats::incr(&self.stats.accepted);
                self.available.notify_one();
                Ok(job_id)
            }
            Err(job) => {
                PipelineStats::incr(&self.stats.rejected_full);
                tracing::warn!(
                    job_id = job.job_id,
                    user_id = job.trade.user_id,
                    capacity = self.queue.capacity(),
                    "Trade queue is full, rejecting"
                );
                Err(AdmissionError::QueueFull)
            }
        }
    }

    /// Stop accepting. Already admitted jobs are still handed out.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Next job, waiting if the queue is empty. `None` once closed and drained.
    pub async fn next_job(&self) -> Option<TradeJob> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.queue.pop() {
                return Some(job);
            }
            if self.is_closed() {
                // a push may have raced the close
                return self.queue.pop();
            }
            notified.await;
        }
    }
}

/// Fixed set of tasks draining an [`AdmissionQueue`].
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        queue: Arc<AdmissionQueue>,
        handler: Arc<dyn JobHandler>,
        workers: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let queue = queue.clone();
                let handler = handler.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    run_worker(worker_id, queue, handler, stats).await;
                })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit. Call after [`AdmissionQueue::close`].
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Admission worker task failed");
            }
        }
    }
}

async fn run_worker(
    worker_id: usize,
    queue: Arc<AdmissionQueue>,
    handler: Arc<dyn JobHandler>,
    stats: Arc<PipelineStats>,
) {
    tracing::debug!(worker_id, "Admission worker started");
    while let Some(job) = queue.next_job().await {
        let job_id = job.job_id;
        let user_id = job.trade.user_id;
        // one bad job must not take the worker down
        match AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
            Ok(Ok(())) => PipelineStats::incr(&stats.staged),
            Ok(Err(StageError::InsufficientFunds { cost, balance })) => {
                PipelineStats::incr(&stats.insufficient_funds);
                tracing::warn!(job_id, user_id, %cost, %balance, "Insufficient funds");
            }
            Ok(Err(e)) if e.is_terminal() => {
                PipelineStats::incr(&stats.failed);
                tracing::warn!(job_id, user_id, code = e.code(), error = %e, "Trade rejected");
            }
            Ok(Err(e)) => {
                PipelineStats::incr(&stats.failed);
                tracing::error!(job_id, user_id, code = e.code(), error = %e, "Trade staging failed");
            }
            Err(_) => {
                PipelineStats::incr(&stats.failed);
                tracing::error!(job_id, user_id, "Trade handler panicked");
            }
        }
    }
    tracing::debug!(worker_id, "Admission worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StockLine;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn trade(user_id: i64) -> TradeRequest {
        TradeRequest::buy(user_id, vec![StockLine::new("AAPL", dec!(1))])
    }

    /// Sleeps per job and records which users it saw.
    struct SlowHandler {
        delay: Duration,
        handled: AtomicUsize,
        fail_user: Option<i64>,
        panic_user: Option<i64>,
    }

    impl SlowHandler {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                handled: AtomicUsize::new(0),
                fail_user: None,
                panic_user: None,
            }
        }
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, job: TradeJob) -> Result<(), StageError> {
            tokio::time::sleep(self.delay).await;
            if Some(job.trade.user_id) == self.panic_user {
                panic!("boom");
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            if Some(job.trade.user_id) == self.fail_user {
                return Err(StageError::StagingFailed {
                    user_id: job.trade.user_id,
                    reason: "injected".into(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_capacity_two_three_concurrent_submits_one_rejected() {
        // current-thread runtime: workers cannot pop until the submits are done
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let stats = Arc::new(PipelineStats::new());
            let queue = Arc::new(AdmissionQueue::new(2, stats.clone()));
            let handler = Arc::new(SlowHandler::new(Duration::from_millis(20)));
            let pool = WorkerPool::start(queue.clone(), handler.clone(), 2, stats.clone());

            let results: Vec<Result<u64, AdmissionError>> = std::thread::scope(|s| {
                let joins: Vec<_> = (0..3)
                    .map(|i| {
                        let queue = &queue;
                        s.spawn(move || queue.submit(trade(i)))
                    })
                    .collect();
                joins.into_iter().map(|j| j.join().unwrap()).collect()
            });

            let rejected = results
                .iter()
                .filter(|r| matches!(r, Err(AdmissionError::QueueFull)))
                .count();
            assert_eq!(rejected, 1);

            queue.close();
            pool.join().await;
            assert_eq!(handler.handled.load(Ordering::SeqCst), 2);

            let snap = stats.snapshot();
            assert_eq!(snap.submitted, 3);
            assert_eq!(snap.accepted, 2);
            assert_eq!(snap.rejected_full, 1);
            assert_eq!(snap.staged, 2);
        });
    }

    #[tokio::test]
    async fn test_close_drains_admitted_jobs() {
        let stats = Arc::new(PipelineStats::new());
        let queue = Arc::new(AdmissionQueue::new(100, stats.clone()));
        let handler = Arc::new(SlowHandler::new(Duration::from_millis(1)));
        for i in 0..20 {
            queue.submit(trade(i)).unwrap();
        }
        let pool = WorkerPool::start(queue.clone(), handler.clone(), 4, stats.clone());
        queue.close();
        assert_eq!(queue.submit(trade(99)), Err(AdmissionError::Closed));

        pool.join().await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 20);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_worker_survives_failures_and_panics() {
        let stats = Arc::new(PipelineStats::new());
        let queue = Arc::new(AdmissionQueue::new(10, stats.clone()));
        let mut handler = SlowHandler::new(Duration::ZERO);
        handler.fail_user = Some(1);
        handler.panic_user = Some(2);
        let handler = Arc::new(handler);

        // single worker: it must keep going after each bad job
        let pool = WorkerPool::start(queue.clone(), handler.clone(), 1, stats.clone());
        for user in [1, 2, 3, 4] {
            queue.submit(trade(user)).unwrap();
        }
        queue.close();
        pool.join().await;

        assert_eq!(handler.handled.load(Ordering::SeqCst), 3);
        let snap = stats.snapshot();
        assert_eq!(snap.staged, 2);
        assert_eq!(snap.failed, 2);
    }

    #[tokio::test]
    async fn test_idle_workers_wake_on_submit() {
        let stats = Arc::new(PipelineStats::new());
        let queue = Arc::new(AdmissionQueue::new(10, stats.clone()));
        let handler = Arc::new(SlowHandler::new(Duration::ZERO));
        let pool = WorkerPool::start(queue.clone(), handler.clone(), 3, stats.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.submit(trade(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);

        queue.close();
        pool.join().await;
    }
}
