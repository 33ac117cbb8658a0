//! Trade settlement pipeline
//!
//! ```text
//! ┌─────────┐   ┌───────────┐   ┌─────────┐   ┌────────┐   ┌───────────┐   ┌────────┐
//! │ Gateway │──▶│ Admission │──▶│ Staging │──▶│ Stream │──▶│ Event log │──▶│ Ledger │
//! │ (axum)  │   │  (queue)  │   │ (cache) │   │(bridge)│   │  (topic)  │   │ (batch)│
//! └─────────┘   └───────────┘   └─────────┘   └────────┘   └───────────┘   └────────┘
//! ```
//!
//! Usage: `trade_settlement [--env dev] [--port 8080]`

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use trade_settlement::admission::{AdmissionQueue, WorkerPool};
use trade_settlement::bridge::Bridge;
use trade_settlement::config::AppConfig;
use trade_settlement::core_types::UserId;
use trade_settlement::db::Database;
use trade_settlement::event_log::LogBroker;
use trade_settlement::gateway::{self, AppState};
use trade_settlement::hydrate::{await_ledger_caught_up, hydrate};
use trade_settlement::ledger::{LedgerStore, LedgerWriter, MemoryLedger, PgLedger};
use trade_settlement::logging::init_logging;
use trade_settlement::pipeline::{PipelineStats, ShutdownSignal};
use trade_settlement::price_cache::{PriceCache, seed_prices};
use trade_settlement::staging::StagingEngine;
use trade_settlement::store::{FastStore, MemoryStore, keys};

/// Upper bound for letting in-process stages empty before workers stop.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for replaying the ledger topic at startup before admission opens.
const CATCH_UP_TIMEOUT: Duration = Duration::from_secs(60);

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| names.contains(&a.as_str()))
        .and_then(|i| args.get(i + 1).cloned())
}

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_port_override() -> Option<u16> {
    get_arg(&["--port"]).and_then(|p| p.parse().ok())
}

async fn open_ledger(config: &AppConfig) -> anyhow::Result<Arc<dyn LedgerStore>> {
    match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            db.health_check().await?;
            db.init_schema().await?;
            Ok(Arc::new(PgLedger::new(
                db.pool().clone(),
                config.ledger.tx_timeout(),
            )))
        }
        None => {
            tracing::warn!("No postgres_url configured, using in-memory ledger");
            Ok(Arc::new(MemoryLedger::new()))
        }
    }
}

/// Poll `remaining` until it reports zero or the timeout passes.
async fn drain<F, Fut>(stage: &str, mut remaining: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = usize>,
{
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let left = remaining().await;
        if left == 0 {
            return;
        }
        if Instant::now() >= deadline {
            tracing::warn!(stage, left, "Drain timed out");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&config);

    tracing::info!(env = %env, version = env!("GIT_HASH"), "Starting trade settlement pipeline");

    let stats = Arc::new(PipelineStats::new());
    let shutdown = Arc::new(ShutdownSignal::new());

    // Fast store and price cache
    let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
    let seeded = seed_prices(store.as_ref(), &config.prices).await?;
    let prices = Arc::new(PriceCache::new(store.clone()));
    let warmed = prices.warm_up().await?;
    tracing::info!(seeded, warmed, "Price cache ready");

    // Ledger and opening balances
    let ledger = open_ledger(&config).await?;
    let users: Vec<(UserId, Decimal)> = config.users.iter().map(|(u, b)| (*u, *b)).collect();
    let created = ledger.seed_users(&users).await?;
    tracing::info!(configured = users.len(), created, "Ledger users seeded");

    // Event log
    let log = Arc::new(match &config.event_log.data_dir {
        Some(dir) => {
            tracing::info!(dir = %dir, "Opening durable event log");
            LogBroker::open(dir)?
        }
        None => LogBroker::in_memory(),
    });

    // Ledger workers apply what the last run logged before balances are loaded
    let writer = Arc::new(LedgerWriter::new(
        log.clone(),
        ledger.clone(),
        config.bridge.topic.clone(),
        config.ledger.clone(),
        stats.clone(),
    ));
    let ledger_handles = writer.spawn_workers(shutdown.clone());
    await_ledger_caught_up(&log, &config.bridge.topic, &config.ledger.group, CATCH_UP_TIMEOUT).await?;

    if config.hydrate_from_ledger {
        hydrate(ledger.as_ref(), store.as_ref()).await?;
    } else {
        for (user_id, balance) in &users {
            store
                .hset(keys::USER_BALANCE, &user_id.to_string(), &balance.to_string())
                .await?;
        }
    }

    // Bridge
    let bridge = Arc::new(Bridge::new(
        store.clone(),
        log.clone(),
        config.bridge.clone(),
        stats.clone(),
    ));
    bridge.init().await?;
    let bridge_handles = bridge.spawn_workers(shutdown.clone());

    // Admission and staging
    let queue = Arc::new(AdmissionQueue::new(
        config.admission.queue_capacity,
        stats.clone(),
    ));
    let engine = Arc::new(StagingEngine::new(
        store.clone(),
        prices.clone(),
        config.bridge.stream.clone(),
        config.staging.lock_shards,
        config.staging.max_cas_retries,
        stats.clone(),
    ));
    let pool = WorkerPool::start(queue.clone(), engine, config.admission.workers, stats.clone());
    tracing::info!(
        admission_workers = pool.size(),
        bridge_workers = bridge_handles.len(),
        ledger_workers = ledger_handles.len(),
        "Pipeline started"
    );

    // Gateway until ctrl-c
    let port = get_port_override().unwrap_or(config.gateway.port);
    let state = Arc::new(AppState::new(
        queue.clone(),
        store.clone(),
        ledger.clone(),
        prices.clone(),
        stats.clone(),
    ));
    gateway::run_server(&config.gateway.host, port, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
        tracing::info!("Shutdown requested");
    })
    .await?;

    // Graceful shutdown: stop admission, drain each stage in order
    queue.close();
    pool.join().await;
    tracing::info!("Admission drained");

    let stream = config.bridge.stream.clone();
    drain("bridge", || {
        let store = store.clone();
        let stream = stream.clone();
        async move { store.xlen(&stream).await.unwrap_or(0) }
    })
    .await;
    let topic = config.bridge.topic.clone();
    let group = config.ledger.group.clone();
    drain("ledger", || {
        let pending = log.backlog(&topic, &group).unwrap_or(0);
        async move { pending }
    })
    .await;

    shutdown.request_shutdown();
    for handle in bridge_handles {
        if let Ok(Err(e)) = handle.await {
            tracing::error!(error = %e, "Bridge worker ended with error");
        }
    }
    for handle in ledger_handles {
        if let Ok(Err(e)) = handle.await {
            tracing::error!(error = %e, "Ledger worker ended with error");
        }
    }
    log.close();

    tracing::info!("{}", stats.snapshot());
    Ok(())
}
