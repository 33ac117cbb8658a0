//! Ledger writer workers
//!
//! Each worker joins the ledger consumer group, accumulates events into a
//! batch and commits it when the batch is full or its flush interval has
//! elapsed. Log offsets are committed only after the ledger transaction
//! succeeds; a batch that keeps failing is released for redelivery.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{Admission, BatchAccumulator, LedgerStore};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::event_log::{EventLog, LogConsumer, LogRecord};
use crate::models::LedgerEvent;
use crate::pipeline::{PipelineStats, ShutdownSignal};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

pub struct LedgerWriter {
    log: Arc<dyn EventLog>,
    ledger: Arc<dyn LedgerStore>,
    topic: String,
    config: LedgerConfig,
    stats: Arc<PipelineStats>,
}

impl LedgerWriter {
    pub fn new(
        log: Arc<dyn EventLog>,
        ledger: Arc<dyn LedgerStore>,
        topic: impl Into<String>,
        config: LedgerConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            log,
            ledger,
            topic: topic.into(),
            config,
            stats,
        }
    }

    /// Start `config.workers` workers named `ledger-<n>`.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Vec<JoinHandle<Result<(), LedgerError>>> {
        (0..self.config.workers.max(1))
            .map(|n| {
                let writer = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let name = format!("ledger-{}", n);
                    let result = writer.run_worker(&name, &shutdown).await;
                    if let Err(e) = &result {
                        tracing::error!(worker = %name, error = %e, "Ledger worker stopped");
                    }
                    result
                })
            })
            .collect()
    }

    /// Consume until shutdown, then flush whatever is still held.
    pub async fn run_worker(&self, name: &str, shutdown: &ShutdownSignal) -> Result<(), LedgerError> {
        let mut consumer = self.log.subscribe(&self.topic, &self.config.group).await?;
        let mut acc = BatchAccumulator::new(self.config.batch_size, self.config.dedup_policy);
        tracing::info!(worker = name, topic = %self.topic, group = %self.config.group, "Ledger worker started");

        while !shutdown.is_shutdown_requested() {
            let polled = tokio::select! {
                res = consumer.poll(self.config.poll()) => res?,
                _ = shutdown.wait() => break,
            };
            if let Some(record) = polled {
                self.accept(consumer.as_mut(), &mut acc, record).await?;
            }
            if acc.is_full() || acc.is_due(self.config.flush_interval()) {
                self.flush(consumer.as_mut(), &mut acc, name).await?;
            }
        }

        while !acc.is_empty() || acc.pending_deferred() > 0 {
            if !self.flush(consumer.as_mut(), &mut acc, name).await? {
                // left for redelivery once this consumer is dropped
                break;
            }
        }
        tracing::info!(worker = name, "Ledger worker exiting");
        Ok(())
    }

    /// Decode a record and add it to the batch. Undecodable records are
    /// committed at once so they are not redelivered forever.
    pub async fn accept(
        &self,
        consumer: &mut dyn LogConsumer,
        acc: &mut BatchAccumulator,
        record: LogRecord,
    ) -> Result<Admission, LedgerError> {
        match LedgerEvent::from_payload(&record.payload) {
            Ok(event) => Ok(acc.offer(record.offset, event)),
            Err(e) => {
                let err = LedgerError::Decode {
                    offset: record.offset,
                    reason: e.to_string(),
                };
                tracing::error!(error = %err, "Skipping ledger record");
                consumer.commit(&[record.offset]).await?;
                Ok(Admission::Dropped)
            }
        }
    }

    /// Seal and commit the current batch. Returns false if the batch was
    /// released after exhausting its commit attempts.
    pub async fn flush(
        &self,
        consumer: &mut dyn LogConsumer,
        acc: &mut BatchAccumulator,
        name: &str,
    ) -> Result<bool, LedgerError> {
        let batch = acc.seal();
        if batch.is_empty() {
            return Ok(true);
        }
        let events = batch.events();
        let offsets = batch.offsets();
        let max_attempts = self.config.max_commit_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ledger.commit_batch(&events).await {
                Ok(summary) => {
                    consumer.commit(&offsets).await?;
                    PipelineStats::add(&self.stats.ledger_committed, events.len() as u64);
                    PipelineStats::add(&self.stats.ledger_dropped, batch.dropped.len() as u64);
                    tracing::info!(
                        worker = name,
                        events = summary.events,
                        fills = summary.fills_inserted,
                        duplicate_fills = summary.fills_duplicate,
                        positions = summary.positions_upserted,
                        balances = summary.balances_updated,
                        dropped = batch.dropped.len(),
                        "Ledger batch committed"
                    );
                    return Ok(true);
                }
                Err(e) if attempt < max_attempts => {
                    tracing::warn!(worker = name, attempt, error = %e, "Ledger commit failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    PipelineStats::incr(&self.stats.ledger_commit_failures);
                    tracing::error!(
                        worker = name,
                        attempts = attempt,
                        events = events.len(),
                        error = %e,
                        "Ledger commit failed, releasing batch for redelivery"
                    );
                    consumer.release(&offsets).await?;
                    return Ok(false);
                }
            }
        }
    }
}
