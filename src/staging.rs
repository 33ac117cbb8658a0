//! Staging & compensation engine
//!
//! Per trade: read the balance, price every line, check funds, snapshot the
//! pre-trade state to the rollback keys, then write the new balance, the new
//! positions and one stream entry as a single guarded batch.
//!
//! Two trades for the same user never interleave: a sharded per-user mutex
//! serializes them inside this process, and the batch is guarded on the
//! balance and position fields that were read, so a writer outside the lock
//! turns into a retry instead of an overdraft.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::admission::JobHandler;
use crate::core_types::{StreamId, Symbol, UserId};
use crate::error::{StageError, StoreError};
use crate::models::{PositionRecord, RollbackSnapshot, StockLine, StreamEntry, TradeJob, TradeRequest};
use crate::pipeline::PipelineStats;
use crate::price_cache::{BalanceSnapshot, PriceCache};
use crate::store::{AtomicBatch, ExecOutcome, FastStore, keys};

/// Result of a successful stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staged {
    pub stream_id: StreamId,
    pub user_id: UserId,
    pub total_cost: Decimal,
    pub balance: Decimal,
    pub positions: Vec<(Symbol, PositionRecord)>,
}

/// Sharded per-user async locks.
pub struct UserLocks {
    shards: Vec<Mutex<()>>,
}

impl UserLocks {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub async fn lock(&self, user_id: UserId) -> MutexGuard<'_, ()> {
        let idx = user_id.rem_euclid(self.shards.len() as i64) as usize;
        self.shards[idx].lock().await
    }
}

enum Attempt {
    Staged(Staged),
    /// A guarded field changed between read and write.
    Conflict,
}

pub struct StagingEngine {
    store: Arc<dyn FastStore>,
    prices: Arc<PriceCache>,
    locks: UserLocks,
    stream: String,
    max_cas_retries: u32,
    stats: Arc<PipelineStats>,
}

impl StagingEngine {
    pub fn new(
        store: Arc<dyn FastStore>,
        prices: Arc<PriceCache>,
        stream: impl Into<String>,
        lock_shards: usize,
        max_cas_retries: u32,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store,
            prices,
            locks: UserLocks::new(lock_shards),
            stream: stream.into(),
            max_cas_retries,
            stats,
        }
    }

    /// Stage one trade. No fast-store state changes unless `Ok` is returned,
    /// except the rollback snapshot.
    pub async fn stage(&self, trade: &TradeRequest) -> Result<Staged, StageError> {
        trade.validate()?;
        let _user = self.locks.lock(trade.user_id).await;

        let mut conflicts = 0;
        loop {
            match self.try_stage(trade).await? {
                Attempt::Staged(staged) => return Ok(staged),
                Attempt::Conflict => {
                    conflicts += 1;
                    if conflicts > self.max_cas_retries {
                        return Err(StageError::Contention(trade.user_id));
                    }
                    tracing::warn!(
                        user_id = trade.user_id,
                        attempt = conflicts,
                        "Balance changed during staging, retrying"
                    );
                }
            }
        }
    }

    async fn try_stage(&self, trade: &TradeRequest) -> Result<Attempt, StageError> {
        let user_id = trade.user_id;
        let uid = user_id.to_string();

        let BalanceSnapshot {
            raw: raw_balance,
            value: balance,
        } = self.prices.balance_snapshot(user_id).await?;

        let mut lines: Vec<StockLine> = Vec::with_capacity(trade.lines.len());
        let mut total_cost = Decimal::ZERO;
        for line in &trade.lines {
            let price = self.prices.get_price(&line.symbol).await?;
            let priced = StockLine {
                symbol: line.symbol.clone(),
                quantity: line.quantity,
                price,
            };
            total_cost += priced.cost();
            lines.push(priced);
        }

        if total_cost > balance {
            return Err(StageError::InsufficientFunds {
                cost: total_cost,
                balance,
            });
        }

        let positions_key = keys::positions(user_id);
        let symbols = trade.symbols();
        let raw_positions = self.store.hmget(&positions_key, &symbols).await?;
        let mut before = Vec::with_capacity(symbols.len());
        for (symbol, raw) in symbols.iter().zip(&raw_positions) {
            let record = match raw {
                Some(raw) => Some(PositionRecord::from_str(raw).map_err(|_| {
                    StoreError::Corrupt {
                        key: format!("{}/{}", positions_key, symbol),
                        value: raw.clone(),
                    }
                })?),
                None => None,
            };
            before.push((symbol.clone(), record));
        }
        let snapshot = RollbackSnapshot {
            user_id,
            balance,
            positions: before,
        };
        write_snapshot(self.store.as_ref(), &snapshot).await?;

        let new_balance = balance - total_cost;
        let mut after: Vec<(Symbol, Option<PositionRecord>)> = snapshot.positions.clone();
        for line in &lines {
            if let Some((_, slot)) = after.iter_mut().find(|(s, _)| *s == line.symbol) {
                *slot = Some(PositionRecord::after_fill(
                    slot.as_ref(),
                    line.quantity,
                    line.price,
                ));
            }
        }
        let positions: Vec<(Symbol, PositionRecord)> = after
            .into_iter()
            .filter_map(|(s, p)| p.map(|p| (s, p)))
            .collect();

        let mut batch = AtomicBatch::new();
        batch.guard_hash_field(keys::USER_BALANCE, &uid, Some(raw_balance));
        for (symbol, raw) in symbols.iter().zip(raw_positions) {
            batch.guard_hash_field(&positions_key, symbol, raw);
        }
        batch.hset(keys::USER_BALANCE, &uid, new_balance.to_string());
        for (symbol, record) in &positions {
            batch.hset(&positions_key, symbol, record.to_string());
        }
        batch.xadd(
            &self.stream,
            StreamEntry::to_fields(user_id, trade.action, new_balance, &lines),
        );

        match self.store.exec_atomic(batch).await {
            Ok(ExecOutcome::Applied(ids)) => {
                let stream_id = ids.first().copied().ok_or_else(|| StageError::StagingFailed {
                    user_id,
                    reason: "batch applied without a stream id".to_string(),
                })?;
                tracing::debug!(
                    user_id,
                    stream_id = %stream_id,
                    cost = %total_cost,
                    balance = %new_balance,
                    "Trade staged"
                );
                Ok(Attempt::Staged(Staged {
                    stream_id,
                    user_id,
                    total_cost,
                    balance: new_balance,
                    positions,
                }))
            }
            Ok(ExecOutcome::Aborted) => Ok(Attempt::Conflict),
            Err(e) => {
                tracing::error!(user_id, error = %e, "Staging batch failed, compensating");
                self.compensate(&snapshot).await;
                Err(StageError::StagingFailed {
                    user_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Put balance and positions back to the snapshot. Best effort: a failure
    /// here is logged and leaves the rollback keys for manual repair.
    async fn compensate(&self, snapshot: &RollbackSnapshot) {
        PipelineStats::incr(&self.stats.compensations);
        let positions_key = keys::positions(snapshot.user_id);

        let mut batch = AtomicBatch::new();
        batch.hset(
            keys::USER_BALANCE,
            snapshot.user_id.to_string(),
            snapshot.balance.to_string(),
        );
        for (symbol, record) in &snapshot.positions {
            match record {
                Some(record) => batch.hset(&positions_key, symbol, record.to_string()),
                None => batch.hdel(&positions_key, symbol),
            };
        }

        match self.store.exec_atomic(batch).await {
            Ok(_) => tracing::warn!(user_id = snapshot.user_id, "Staging compensated"),
            Err(e) => tracing::error!(
                user_id = snapshot.user_id,
                error = %e,
                "Compensation failed; rollback keys hold the pre-trade state"
            ),
        }
    }
}

#[async_trait]
impl JobHandler for StagingEngine {
    async fn handle(&self, job: TradeJob) -> Result<(), StageError> {
        self.stage(&job.trade).await.map(|_| ())
    }
}

fn parse_decimal(key: &str, field: &str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|_| StoreError::Corrupt {
        key: format!("{}/{}", key, field),
        value: raw.to_string(),
    })
}

/// Persist the snapshot under `rollback:balance:<uid>` / `rollback:position:<uid>`.
pub async fn write_snapshot(
    store: &dyn FastStore,
    snapshot: &RollbackSnapshot,
) -> Result<(), StoreError> {
    let position_key = keys::rollback_positions(snapshot.user_id);
    let mut batch = AtomicBatch::new();
    batch
        .del(keys::rollback_balance(snapshot.user_id))
        .del(&position_key)
        .hset(
            keys::rollback_balance(snapshot.user_id),
            keys::ROLLBACK_BALANCE_FIELD,
            snapshot.balance.to_string(),
        );
    for (symbol, record) in &snapshot.positions {
        let value = match record {
            Some(r) => r.to_string(),
            None => keys::ABSENT_POSITION.to_string(),
        };
        batch.hset(&position_key, symbol, value);
    }
    store.exec_atomic(batch).await.map(|_| ())
}

/// Read back the last snapshot written for `user_id`.
pub async fn read_snapshot(
    store: &dyn FastStore,
    user_id: UserId,
) -> Result<Option<RollbackSnapshot>, StoreError> {
    let balance_key = keys::rollback_balance(user_id);
    let Some(raw) = store.hget(&balance_key, keys::ROLLBACK_BALANCE_FIELD).await? else {
        return Ok(None);
    };
    let balance = parse_decimal(&balance_key, keys::ROLLBACK_BALANCE_FIELD, &raw)?;

    let position_key = keys::rollback_positions(user_id);
    let mut positions: Vec<(Symbol, Option<PositionRecord>)> = Vec::new();
    for (symbol, raw) in store.hgetall(&position_key).await? {
        let record = if raw == keys::ABSENT_POSITION {
            None
        } else {
            Some(PositionRecord::from_str(&raw).map_err(|_| StoreError::Corrupt {
                key: format!("{}/{}", position_key, symbol),
                value: raw.clone(),
            })?)
        };
        positions.push((symbol, record));
    }
    positions.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(Some(RollbackSnapshot {
        user_id,
        balance,
        positions,
    }))
}
