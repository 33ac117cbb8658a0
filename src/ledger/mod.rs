//! Batched ledger writer
//!
//! Ledger events are accumulated into batches and committed to the relational
//! ledger, one transaction per batch:
//!
//! 1. insert one `trades` row per stock line, keyed by `(stream_id, line_no)`;
//!    rows already present are skipped,
//! 2. upsert `positions` from the freshly inserted fills only, recomputing
//!    the weighted average in the database,
//! 3. set `users.balance` for users whose event produced fresh fills, unless
//!    the row already carries the balance of a later stream entry.
//!
//! A redelivered event therefore changes nothing: its fills are already in
//! `trades`, so it contributes no position delta and no balance write. An
//! older event committed after a newer one (released batch, two workers)
//! adds its fills but leaves the newer balance in place.

pub mod memory;
pub mod postgres;
pub mod writer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::DedupPolicy;
use crate::core_types::{LogOffset, StreamId, Symbol, UserId};
use crate::error::LedgerError;
use crate::models::{LedgerEvent, PositionRecord, TradeAction};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;
pub use writer::LedgerWriter;

// ============================================================
// LEDGER ROWS
// ============================================================

/// One stock line of one event, as stored in `trades`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeFill {
    pub stream_id: StreamId,
    pub line_no: i32,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub executed_price: Decimal,
    pub trade_type: TradeAction,
}

impl TradeFill {
    pub fn key(&self) -> (StreamId, i32) {
        (self.stream_id, self.line_no)
    }
}

/// Flatten events into fills, numbering lines per event.
pub fn fills_of(events: &[LedgerEvent]) -> Vec<TradeFill> {
    events
        .iter()
        .flat_map(|event| {
            event.stocks.iter().enumerate().map(move |(i, line)| TradeFill {
                stream_id: event.stream_id,
                line_no: i as i32,
                user_id: event.user_id,
                symbol: line.symbol.clone(),
                quantity: line.quantity,
                executed_price: line.price,
                trade_type: event.action,
            })
        })
        .collect()
}

/// Net effect of a batch on one `(user, symbol)` position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionDelta {
    pub user_id: UserId,
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub average_price: Decimal,
}

/// Combine fills per `(user, symbol)` in first-seen order. Each group is
/// folded with the same weighted-average rule the cache uses, so the upsert
/// sees a single row per key.
pub fn aggregate_fills<'a>(fills: impl IntoIterator<Item = &'a TradeFill>) -> Vec<PositionDelta> {
    let mut order: Vec<(UserId, Symbol)> = Vec::new();
    let mut acc: FxHashMap<(UserId, Symbol), PositionRecord> = FxHashMap::default();
    for fill in fills {
        let key = (fill.user_id, fill.symbol.clone());
        let next = PositionRecord::after_fill(acc.get(&key), fill.quantity, fill.executed_price);
        if acc.insert(key.clone(), next).is_none() {
            order.push(key);
        }
    }
    order
        .into_iter()
        .filter_map(|key| {
            acc.remove(&key).map(|pos| PositionDelta {
                user_id: key.0,
                symbol: key.1,
                quantity: pos.quantity,
                average_price: pos.average_price,
            })
        })
        .collect()
}

/// Post-trade balance of a user as of one stream entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub user_id: UserId,
    pub balance: Decimal,
    /// Entry the balance was computed for. A stored balance is only replaced
    /// by one from a later entry.
    pub stream_id: StreamId,
}

/// Post-trade balance per user for events that produced fresh fills. When a
/// user appears more than once the event with the highest stream id wins,
/// whatever the order inside the batch.
pub fn balance_updates(
    events: &[LedgerEvent],
    fresh: &FxHashSet<(StreamId, i32)>,
) -> Vec<BalanceUpdate> {
    let mut out: Vec<BalanceUpdate> = Vec::new();
    for event in events {
        let has_fresh = (0..event.stocks.len()).any(|i| fresh.contains(&(event.stream_id, i as i32)));
        if !has_fresh {
            continue;
        }
        let update = BalanceUpdate {
            user_id: event.user_id,
            balance: event.balance,
            stream_id: event.stream_id,
        };
        match out.iter_mut().find(|u| u.user_id == event.user_id) {
            Some(slot) if slot.stream_id < event.stream_id => *slot = update,
            Some(_) => {}
            None => out.push(update),
        }
    }
    out
}

/// A `trades` row as read back for queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeRecord {
    pub stream_id: String,
    pub line_no: i32,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub executed_price: Decimal,
    pub trade_type: String,
    pub created_at: DateTime<Utc>,
}

/// What one batch commit changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub events: usize,
    pub fills_inserted: usize,
    /// Fills skipped because their `(stream_id, line_no)` was already stored
    pub fills_duplicate: usize,
    pub positions_upserted: usize,
    pub balances_updated: usize,
}

/// Relational ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Apply a batch atomically. On error nothing is applied.
    async fn commit_batch(&self, events: &[LedgerEvent]) -> Result<CommitSummary, LedgerError>;

    /// Create users that do not exist yet. Existing balances are kept.
    async fn seed_users(&self, users: &[(UserId, Decimal)]) -> Result<usize, LedgerError>;

    async fn balances(&self) -> Result<Vec<(UserId, Decimal)>, LedgerError>;

    async fn positions(&self) -> Result<Vec<(UserId, Symbol, PositionRecord)>, LedgerError>;

    /// Most recent first.
    async fn trades_for_user(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<TradeRecord>, LedgerError>;
}

// ============================================================
// BATCH ACCUMULATION
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub offset: LogOffset,
    pub event: LedgerEvent,
}

/// Outcome of offering an event to the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Added,
    /// Same user already in the batch; acknowledged with the batch, never applied.
    Dropped,
    /// Same user already in the batch; carried into the next batch.
    Deferred,
}

/// A closed batch ready to commit.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SealedBatch {
    pub items: Vec<BatchItem>,
    /// Offsets of events discarded by the per-user dedup.
    pub dropped: Vec<LogOffset>,
}

impl SealedBatch {
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.items.iter().map(|i| i.event.clone()).collect()
    }

    /// Everything to acknowledge once the batch is committed.
    pub fn offsets(&self) -> Vec<LogOffset> {
        self.items
            .iter()
            .map(|i| i.offset)
            .chain(self.dropped.iter().copied())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.dropped.is_empty()
    }
}

/// Collects events into batches of at most `batch_size`, one event per user.
pub struct BatchAccumulator {
    batch_size: usize,
    policy: DedupPolicy,
    items: Vec<BatchItem>,
    users: FxHashSet<UserId>,
    dropped: Vec<LogOffset>,
    deferred: VecDeque<BatchItem>,
    opened_at: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize, policy: DedupPolicy) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            policy,
            items: Vec::with_capacity(batch_size),
            users: FxHashSet::default(),
            dropped: Vec::new(),
            deferred: VecDeque::new(),
            opened_at: None,
        }
    }

    pub fn offer(&mut self, offset: LogOffset, event: LedgerEvent) -> Admission {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        if self.users.insert(event.user_id) {
            self.items.push(BatchItem { offset, event });
            return Admission::Added;
        }
        match self.policy {
            DedupPolicy::DropLater => {
                tracing::warn!(
                    user_id = event.user_id,
                    stream_id = %event.stream_id,
                    offset,
                    "Second event for user in batch window, dropping it"
                );
                self.dropped.push(offset);
                Admission::Dropped
            }
            DedupPolicy::Defer => {
                self.deferred.push_back(BatchItem { offset, event });
                Admission::Deferred
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.dropped.is_empty()
    }

    /// Size threshold reached (deferred backlog counts, so it cannot grow unbounded).
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.batch_size || self.deferred.len() >= self.batch_size
    }

    /// Flush interval elapsed since the first event of this batch.
    pub fn is_due(&self, flush_interval: Duration) -> bool {
        self.opened_at
            .is_some_and(|t| t.elapsed() >= flush_interval)
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Close the current batch. Deferred events open the next one.
    pub fn seal(&mut self) -> SealedBatch {
        let sealed = SealedBatch {
            items: std::mem::take(&mut self.items),
            dropped: std::mem::take(&mut self.dropped),
        };
        self.users.clear();
        self.opened_at = None;

        let carried = std::mem::take(&mut self.deferred);
        for item in carried {
            if self.items.len() < self.batch_size && self.users.insert(item.event.user_id) {
                if self.opened_at.is_none() {
                    self.opened_at = Some(Instant::now());
                }
                self.items.push(item);
            } else {
                self.deferred.push_back(item);
            }
        }
        sealed
    }

    /// Offsets of every event held but not yet sealed.
    pub fn held_offsets(&self) -> Vec<LogOffset> {
        self.items
            .iter()
            .map(|i| i.offset)
            .chain(self.dropped.iter().copied())
            .chain(self.deferred.iter().map(|i| i.offset))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::event;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fills_are_numbered_per_event() {
        let events = vec![
            event(1, 1, dec!(0), &[("AAPL", dec!(1), dec!(100)), ("MSFT", dec!(2), dec!(50))]),
            event(2, 2, dec!(0), &[("AAPL", dec!(3), dec!(100))]),
        ];
        let fills = fills_of(&events);
        assert_eq!(fills.len(), 3);
        assert_eq!(fills[0].key(), (StreamId::new(1, 0), 0));
        assert_eq!(fills[1].key(), (StreamId::new(1, 0), 1));
        assert_eq!(fills[2].key(), (StreamId::new(2, 0), 0));
        assert_eq!(fills[1].executed_price, dec!(50));
    }

    #[test]
    fn test_aggregate_folds_same_user_symbol() {
        let events = vec![event(
            1,
            1,
            dec!(0),
            &[("AAPL", dec!(5), dec!(100)), ("MSFT", dec!(1), dec!(10)), ("AAPL", dec!(5), dec!(120))],
        )];
        let deltas = aggregate_fills(&fills_of(&events));
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].symbol, "AAPL");
        assert_eq!(deltas[0].quantity, dec!(10));
        assert_eq!(deltas[0].average_price, dec!(110));
        assert_eq!(deltas[1].symbol, "MSFT");
    }

    #[test]
    fn test_balance_updates_skip_fully_duplicate_events() {
        let events = vec![
            event(1, 1, dec!(500), &[("AAPL", dec!(5), dec!(100))]),
            event(2, 2, dec!(700), &[("AAPL", dec!(3), dec!(100))]),
        ];
        let mut fresh = FxHashSet::default();
        fresh.insert((StreamId::new(2, 0), 0));
        let updates = balance_updates(&events, &fresh);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].user_id, 2);
        assert_eq!(updates[0].balance, dec!(700));
        assert_eq!(updates[0].stream_id, StreamId::new(2, 0));
    }

    #[test]
    fn test_balance_updates_keep_latest_entry_per_user() {
        let events = vec![
            event(5, 1, dec!(0), &[("AAPL", dec!(5), dec!(120))]),
            event(3, 1, dec!(500), &[("AAPL", dec!(5), dec!(100))]),
        ];
        let fresh: FxHashSet<_> = fills_of(&events).iter().map(TradeFill::key).collect();
        let updates = balance_updates(&events, &fresh);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].balance, dec!(0));
        assert_eq!(updates[0].stream_id, StreamId::new(5, 0));
    }

    #[test]
    fn test_drop_later_keeps_first_event_per_user() {
        let mut acc = BatchAccumulator::new(10, DedupPolicy::DropLater);
        assert_eq!(acc.offer(0, event(1, 7, dec!(500), &[])), Admission::Added);
        assert_eq!(acc.offer(1, event(2, 8, dec!(900), &[])), Admission::Added);
        assert_eq!(acc.offer(2, event(3, 7, dec!(0), &[])), Admission::Dropped);

        let sealed = acc.seal();
        assert_eq!(sealed.items.len(), 2);
        assert_eq!(sealed.items[0].event.balance, dec!(500));
        assert_eq!(sealed.dropped, vec![2]);
        assert_eq!(sealed.offsets(), vec![0, 1, 2]);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_defer_carries_event_into_next_batch() {
        let mut acc = BatchAccumulator::new(10, DedupPolicy::Defer);
        acc.offer(0, event(1, 7, dec!(500), &[]));
        assert_eq!(acc.offer(1, event(2, 7, dec!(0), &[])), Admission::Deferred);
        assert_eq!(acc.offer(2, event(3, 7, dec!(0), &[])), Admission::Deferred);

        let first = acc.seal();
        assert_eq!(first.offsets(), vec![0]);
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.pending_deferred(), 1);

        let second = acc.seal();
        assert_eq!(second.offsets(), vec![1]);
        let third = acc.seal();
        assert_eq!(third.offsets(), vec![2]);
        assert!(acc.seal().is_empty());
    }

    #[test]
    fn test_full_and_due() {
        let mut acc = BatchAccumulator::new(2, DedupPolicy::DropLater);
        assert!(!acc.is_due(Duration::ZERO));
        acc.offer(0, event(1, 1, dec!(0), &[]));
        assert!(!acc.is_full());
        assert!(acc.is_due(Duration::ZERO));
        assert!(!acc.is_due(Duration::from_secs(60)));
        acc.offer(1, event(2, 2, dec!(0), &[]));
        assert!(acc.is_full());
        assert_eq!(acc.held_offsets(), vec![0, 1]);
    }
}
