//! Durable hand-off bridge
//!
//! Workers in one consumer group move staged trades from the `buy_stream`
//! into the event log. Per entry the order is publish, then ack + delete, so a
//! crash in between leaves the entry pending; another worker reclaims it once
//! it has been idle for `claim_idle_ms` and publishes it again. Downstream
//! therefore sees every trade at least once, possibly twice.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::event_log::EventLog;
use crate::models::{LedgerEvent, StreamEntry};
use crate::pipeline::{PipelineStats, ShutdownSignal};
use crate::store::{FastStore, StreamRecord};

pub struct Bridge {
    store: Arc<dyn FastStore>,
    log: Arc<dyn EventLog>,
    config: BridgeConfig,
    stats: Arc<PipelineStats>,
}

impl Bridge {
    pub fn new(
        store: Arc<dyn FastStore>,
        log: Arc<dyn EventLog>,
        config: BridgeConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store,
            log,
            config,
            stats,
        }
    }

    /// Create the consumer group (and the stream) if missing.
    pub async fn init(&self) -> Result<(), BridgeError> {
        self.store
            .xgroup_create(&self.config.stream, &self.config.group)
            .await
            .map_err(BridgeError::Read)
    }

    /// Start `config.workers` workers named `bridge-<n>`.
    pub fn spawn_workers(
        self: &Arc<Self>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Vec<JoinHandle<Result<(), BridgeError>>> {
        (0..self.config.workers.max(1))
            .map(|n| {
                let bridge = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let consumer = format!("bridge-{}", n);
                    let result = bridge.run_worker(&consumer, &shutdown).await;
                    if let Err(e) = &result {
                        tracing::error!(consumer = %consumer, error = %e, "Bridge worker stopped");
                    }
                    result
                })
            })
            .collect()
    }

    /// Loop until shutdown. Returns the read error that stopped it, if any.
    pub async fn run_worker(
        &self,
        consumer: &str,
        shutdown: &ShutdownSignal,
    ) -> Result<(), BridgeError> {
        tracing::info!(consumer, stream = %self.config.stream, "Bridge worker started");
        while !shutdown.is_shutdown_requested() {
            tokio::select! {
                res = self.poll_once(consumer, self.config.block()) => { res?; }
                _ = shutdown.wait() => break,
            }
        }
        tracing::info!(consumer, "Bridge worker exiting");
        Ok(())
    }

    /// Reclaim idle entries, else read new ones (waiting up to `block`), and
    /// forward them. Returns how many entries were handed to the log.
    pub async fn poll_once(&self, consumer: &str, block: Duration) -> Result<usize, BridgeError> {
        let mut records = self
            .store
            .xautoclaim(
                &self.config.stream,
                &self.config.group,
                consumer,
                self.config.claim_idle(),
                self.config.read_count,
            )
            .await
            .map_err(BridgeError::Read)?;
        if !records.is_empty() {
            tracing::info!(consumer, count = records.len(), "Reclaimed idle stream entries");
        } else {
            records = self
                .store
                .xreadgroup(
                    &self.config.stream,
                    &self.config.group,
                    consumer,
                    self.config.read_count,
                    block,
                )
                .await
                .map_err(BridgeError::Read)?;
        }

        let mut forwarded = 0;
        for record in records {
            match self.forward(record).await {
                Ok(()) => forwarded += 1,
                Err(e @ BridgeError::Malformed { .. }) => {
                    tracing::error!(consumer, error = %e, "Dropped malformed stream entry")
                }
                Err(e) => {
                    tracing::warn!(consumer, error = %e, "Stream entry left pending for retry")
                }
            }
        }
        Ok(forwarded)
    }

    /// Publish one entry, then acknowledge and delete it.
    async fn forward(&self, record: StreamRecord) -> Result<(), BridgeError> {
        let stream_id = record.id;
        let payload = StreamEntry::from_fields(stream_id, &record.fields)
            .map(LedgerEvent::from)
            .and_then(|event| event.to_payload().map_err(|e| e.to_string()));
        let payload = match payload {
            Ok(payload) => payload,
            Err(reason) => {
                // never publishable: ack so it stops being reclaimed
                PipelineStats::incr(&self.stats.bridge_poison);
                self.ack_and_delete(record.id).await?;
                return Err(BridgeError::Malformed { stream_id, reason });
            }
        };

        let offset = self
            .log
            .publish(&self.config.topic, &payload)
            .await
            .map_err(|source| BridgeError::Publish { stream_id, source })?;
        self.ack_and_delete(stream_id).await?;

        PipelineStats::incr(&self.stats.bridged);
        tracing::debug!(
            stream_id = %stream_id,
            offset,
            deliveries = record.delivery_count,
            "Stream entry bridged"
        );
        Ok(())
    }

    async fn ack_and_delete(&self, stream_id: crate::core_types::StreamId) -> Result<(), BridgeError> {
        let ids = [stream_id];
        self.store
            .xack(&self.config.stream, &self.config.group, &ids)
            .await
            .map_err(|source| BridgeError::Ack { stream_id, source })?;
        self.store
            .xdel(&self.config.stream, &ids)
            .await
            .map_err(|source| BridgeError::Ack { stream_id, source })?;
        Ok(())
    }
}
