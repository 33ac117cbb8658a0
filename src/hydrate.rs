//! Boot-time hydration of the fast store from the relational ledger.
//!
//! Balances go to the `user_balance` hash and positions to `positions:<uid>`,
//! overwriting whatever the fast store held for those users.
//!
//! Events still sitting in the ledger topic are not in the ledger yet, so the
//! ledger writers must catch up ([`await_ledger_caught_up`]) before hydrating.
//! Otherwise admission would open on balances that predate those events.

use std::time::{Duration, Instant};

use crate::error::HydrateError;
use crate::event_log::LogBroker;
use crate::ledger::LedgerStore;
use crate::store::{FastStore, keys};

const CATCH_UP_POLL: Duration = Duration::from_millis(50);

/// Wait until `group` has committed every record of `topic`.
pub async fn await_ledger_caught_up(
    log: &LogBroker,
    topic: &str,
    group: &str,
    timeout: Duration,
) -> Result<(), HydrateError> {
    let started = Instant::now();
    let initial = log.backlog(topic, group)?;
    if initial > 0 {
        tracing::info!(topic, group, pending = initial, "Waiting for ledger to apply logged events");
    }
    loop {
        let pending = log.backlog(topic, group)?;
        if pending == 0 {
            return Ok(());
        }
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(HydrateError::Backlog { pending, waited });
        }
        tokio::time::sleep(CATCH_UP_POLL).await;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrationSummary {
    pub users: usize,
    pub positions: usize,
}

pub async fn hydrate(
    ledger: &dyn LedgerStore,
    store: &dyn FastStore,
) -> Result<HydrationSummary, HydrateError> {
    let balances = ledger.balances().await?;
    for (user_id, balance) in &balances {
        store
            .hset(keys::USER_BALANCE, &user_id.to_string(), &balance.to_string())
            .await?;
    }

    let positions = ledger.positions().await?;
    for (user_id, symbol, position) in &positions {
        store
            .hset(&keys::positions(*user_id), symbol, &position.to_string())
            .await?;
    }

    let summary = HydrationSummary {
        users: balances.len(),
        positions: positions.len(),
    };
    tracing::info!(
        users = summary.users,
        positions = summary.positions,
        "Fast store hydrated from ledger"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::ledger::test_support::event;
    use crate::models::PositionRecord;
    use crate::store::{MemoryStore, read_balance};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_hydrate_copies_balances_and_positions() {
        let ledger = MemoryLedger::new();
        ledger
            .seed_users(&[(1, dec!(1000)), (2, dec!(250))])
            .await
            .unwrap();
        ledger
            .commit_batch(&[event(1, 1, dec!(500), &[("AAPL", dec!(5), dec!(100))])])
            .await
            .unwrap();

        let store = MemoryStore::new();
        // stale value is overwritten
        store.hset(keys::USER_BALANCE, "1", "1").await.unwrap();

        let summary = hydrate(&ledger, &store).await.unwrap();
        assert_eq!(summary, HydrationSummary { users: 2, positions: 1 });
        assert_eq!(read_balance(&store, 1).await.unwrap(), Some(dec!(500)));
        assert_eq!(read_balance(&store, 2).await.unwrap(), Some(dec!(250)));

        let raw = store.hget(&keys::positions(1), "AAPL").await.unwrap().unwrap();
        assert_eq!(
            raw.parse::<PositionRecord>().unwrap(),
            PositionRecord::new(dec!(5), dec!(100))
        );
    }

    #[tokio::test]
    async fn test_logged_events_applied_before_hydration() {
        use crate::config::LedgerConfig;
        use crate::event_log::EventLog;
        use crate::ledger::LedgerWriter;
        use crate::pipeline::{PipelineStats, ShutdownSignal};
        use std::sync::Arc;

        let ledger = Arc::new(MemoryLedger::new());
        ledger.seed_users(&[(1, dec!(1000))]).await.unwrap();
        ledger
            .commit_batch(&[event(1, 1, dec!(500), &[("AAPL", dec!(5), dec!(100))])])
            .await
            .unwrap();

        // left in the topic by the previous run, not yet in the ledger
        let log = Arc::new(LogBroker::in_memory());
        let pending = event(2, 1, dec!(0), &[("AAPL", dec!(5), dec!(120))]);
        log.publish("trade_events", &pending.to_payload().unwrap())
            .await
            .unwrap();
        assert_eq!(log.backlog("trade_events", "postgres-writer").unwrap(), 1);

        let config = LedgerConfig {
            workers: 1,
            flush_interval_ms: 10,
            poll_ms: 10,
            ..Default::default()
        };
        let writer = Arc::new(LedgerWriter::new(
            log.clone(),
            ledger.clone(),
            "trade_events",
            config,
            Arc::new(PipelineStats::new()),
        ));
        let shutdown = Arc::new(ShutdownSignal::new());
        let handles = writer.spawn_workers(shutdown.clone());

        await_ledger_caught_up(&log, "trade_events", "postgres-writer", Duration::from_secs(5))
            .await
            .unwrap();
        let store = MemoryStore::new();
        hydrate(ledger.as_ref(), &store).await.unwrap();

        assert_eq!(read_balance(&store, 1).await.unwrap(), Some(dec!(0)));
        let raw = store.hget(&keys::positions(1), "AAPL").await.unwrap().unwrap();
        assert_eq!(
            raw.parse::<PositionRecord>().unwrap(),
            PositionRecord::new(dec!(10), dec!(110))
        );

        shutdown.request_shutdown();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_catch_up_times_out_without_writers() {
        use crate::event_log::EventLog;

        let log = LogBroker::in_memory();
        log.publish("trade_events", b"{}").await.unwrap();
        let err = await_ledger_caught_up(&log, "trade_events", "postgres-writer", Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, HydrateError::Backlog { pending: 1, .. }));
    }

    #[tokio::test]
    async fn test_hydrate_empty_ledger() {
        let summary = hydrate(&MemoryLedger::new(), &MemoryStore::new())
            .await
            .unwrap();
        assert_eq!(summary, HydrationSummary::default());
    }
}
