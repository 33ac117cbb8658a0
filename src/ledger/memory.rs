//! In-process ledger with the same commit semantics as the PostgreSQL one.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    CommitSummary, LedgerStore, TradeRecord, aggregate_fills, balance_updates, fills_of,
};
use crate::core_types::{StreamId, Symbol, UserId};
use crate::error::LedgerError;
use crate::models::{LedgerEvent, PositionRecord, round_price};

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<UserId, Decimal>,
    /// Stream entry behind each user's current balance
    last_stream: FxHashMap<UserId, StreamId>,
    positions: BTreeMap<(UserId, Symbol), PositionRecord>,
    trades: Vec<TradeRecord>,
    trade_keys: FxHashSet<(StreamId, i32)>,
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
    fail_commits: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Rejected("ledger mutex poisoned".into()))
    }

    /// Make the next `n` commits fail without applying anything.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn balance(&self, user_id: UserId) -> Option<Decimal> {
        self.lock().ok()?.users.get(&user_id).copied()
    }

    pub fn position(&self, user_id: UserId, symbol: &str) -> Option<PositionRecord> {
        self.lock()
            .ok()?
            .positions
            .get(&(user_id, symbol.to_string()))
            .copied()
    }

    pub fn trade_count(&self) -> usize {
        self.lock().map(|s| s.trades.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn commit_batch(&self, events: &[LedgerEvent]) -> Result<CommitSummary, LedgerError> {
        if self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(LedgerError::Rejected("commit failure injected".into()));
        }

        let mut state = self.lock()?;
        let fills = fills_of(events);

        let mut fresh_keys = FxHashSet::default();
        let mut fresh = Vec::new();
        for fill in &fills {
            if !state.trade_keys.contains(&fill.key()) && fresh_keys.insert(fill.key()) {
                fresh.push(fill);
            }
        }

        // build everything first so a failure leaves state untouched
        let now = Utc::now();
        let new_trades: Vec<TradeRecord> = fresh
            .iter()
            .map(|f| TradeRecord {
                stream_id: f.stream_id.to_string(),
                line_no: f.line_no,
                user_id: f.user_id,
                symbol: f.symbol.clone(),
                quantity: f.quantity,
                executed_price: f.executed_price,
                trade_type: f.trade_type.as_str().to_string(),
                created_at: now,
            })
            .collect();
        let deltas = aggregate_fills(fresh.iter().copied());
        let balances: Vec<_> = balance_updates(events, &fresh_keys)
            .into_iter()
            .filter(|u| {
                state.users.contains_key(&u.user_id)
                    && state
                        .last_stream
                        .get(&u.user_id)
                        .is_none_or(|last| *last < u.stream_id)
            })
            .collect();

        let summary = CommitSummary {
            events: events.len(),
            fills_inserted: fresh.len(),
            fills_duplicate: fills.len() - fresh.len(),
            positions_upserted: deltas.len(),
            balances_updated: balances.len(),
        };

        state.trade_keys.extend(fresh_keys);
        state.trades.extend(new_trades);
        for delta in deltas {
            let key = (delta.user_id, delta.symbol);
            let next = match state.positions.get(&key) {
                // same expression as the SQL upsert
                Some(cur) => {
                    let qty = cur.quantity + delta.quantity;
                    let avg = (cur.quantity * cur.average_price
                        + delta.quantity * delta.average_price)
                        / qty;
                    PositionRecord::new(qty, round_price(avg))
                }
                None => PositionRecord::new(delta.quantity, delta.average_price),
            };
            state.positions.insert(key, next);
        }
        for update in balances {
            state.users.insert(update.user_id, update.balance);
            state.last_stream.insert(update.user_id, update.stream_id);
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(summary)
    }

    async fn seed_users(&self, users: &[(UserId, Decimal)]) -> Result<usize, LedgerError> {
        let mut state = self.lock()?;
        let mut created = 0;
        for (user_id, balance) in users {
            if !state.users.contains_key(user_id) {
                state.users.insert(*user_id, *balance);
                created += 1;
            }
        }
        Ok(created)
    }

    async fn balances(&self) -> Result<Vec<(UserId, Decimal)>, LedgerError> {
        Ok(self.lock()?.users.iter().map(|(u, b)| (*u, *b)).collect())
    }

    async fn positions(&self) -> Result<Vec<(UserId, Symbol, PositionRecord)>, LedgerError> {
        Ok(self
            .lock()?
            .positions
            .iter()
            .map(|((u, s), p)| (*u, s.clone(), *p))
            .collect())
    }

    async fn trades_for_user(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> Result<Vec<TradeRecord>, LedgerError> {
        Ok(self
            .lock()?
            .trades
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::event;
    use rust_decimal_macros::dec;

    async fn ledger_with_user(balance: Decimal) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.seed_users(&[(1, balance)]).await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_commit_applies_trades_positions_balance() {
        let ledger = ledger_with_user(dec!(1000)).await;
        let summary = ledger
            .commit_batch(&[event(1, 1, dec!(500), &[("AAPL", dec!(5), dec!(100))])])
            .await
            .unwrap();
        assert_eq!(summary.fills_inserted, 1);
        assert_eq!(summary.balances_updated, 1);
        assert_eq!(ledger.balance(1), Some(dec!(500)));
        assert_eq!(
            ledger.position(1, "AAPL"),
            Some(PositionRecord::new(dec!(5), dec!(100)))
        );

        ledger
            .commit_batch(&[event(2, 1, dec!(0), &[("AAPL", dec!(5), dec!(120))])])
            .await
            .unwrap();
        assert_eq!(
            ledger.position(1, "AAPL"),
            Some(PositionRecord::new(dec!(10), dec!(110)))
        );
        assert_eq!(ledger.balance(1), Some(dec!(0)));
        assert_eq!(ledger.trade_count(), 2);
    }

    #[tokio::test]
    async fn test_redelivered_event_changes_nothing() {
        let ledger = ledger_with_user(dec!(1000)).await;
        let first = event(1, 1, dec!(500), &[("AAPL", dec!(5), dec!(100))]);
        let second = event(2, 1, dec!(0), &[("AAPL", dec!(5), dec!(120))]);
        ledger.commit_batch(&[first.clone()]).await.unwrap();
        ledger.commit_batch(&[second]).await.unwrap();

        // old event arrives again after a newer one committed
        let summary = ledger.commit_batch(&[first]).await.unwrap();
        assert_eq!(summary.fills_inserted, 0);
        assert_eq!(summary.fills_duplicate, 1);
        assert_eq!(summary.balances_updated, 0);
        assert_eq!(ledger.balance(1), Some(dec!(0)));
        assert_eq!(
            ledger.position(1, "AAPL"),
            Some(PositionRecord::new(dec!(10), dec!(110)))
        );
        assert_eq!(ledger.trade_count(), 2);
    }

    #[tokio::test]
    async fn test_older_event_committed_late_keeps_newer_balance() {
        let ledger = ledger_with_user(dec!(1000)).await;
        let first = event(1, 1, dec!(500), &[("AAPL", dec!(5), dec!(100))]);
        let second = event(2, 1, dec!(0), &[("AAPL", dec!(5), dec!(120))]);

        ledger.commit_batch(&[second]).await.unwrap();
        let summary = ledger.commit_batch(&[first]).await.unwrap();
        assert_eq!(summary.fills_inserted, 1);
        assert_eq!(summary.balances_updated, 0);
        assert_eq!(ledger.balance(1), Some(dec!(0)));
        assert_eq!(
            ledger.position(1, "AAPL"),
            Some(PositionRecord::new(dec!(10), dec!(110)))
        );
    }

    #[tokio::test]
    async fn test_injected_failure_applies_nothing() {
        let ledger = ledger_with_user(dec!(1000)).await;
        ledger.fail_next_commits(1);
        let batch = [event(1, 1, dec!(500), &[("AAPL", dec!(5), dec!(100))])];
        assert!(ledger.commit_batch(&batch).await.is_err());
        assert_eq!(ledger.balance(1), Some(dec!(1000)));
        assert_eq!(ledger.trade_count(), 0);
        assert_eq!(ledger.commit_count(), 0);

        ledger.commit_batch(&batch).await.unwrap();
        assert_eq!(ledger.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_user_gets_no_balance_row() {
        let ledger = MemoryLedger::new();
        let summary = ledger
            .commit_batch(&[event(1, 42, dec!(10), &[("AAPL", dec!(1), dec!(1))])])
            .await
            .unwrap();
        assert_eq!(summary.balances_updated, 0);
        assert_eq!(ledger.balance(42), None);
        assert!(ledger.position(42, "AAPL").is_some());
    }

    #[tokio::test]
    async fn test_seed_keeps_existing_balance_and_trades_query() {
        let ledger = ledger_with_user(dec!(1000)).await;
        assert_eq!(
            ledger.seed_users(&[(1, dec!(5)), (2, dec!(7))]).await.unwrap(),
            1
        );
        assert_eq!(ledger.balance(1), Some(dec!(1000)));

        ledger
            .commit_batch(&[
                event(1, 1, dec!(900), &[("AAPL", dec!(1), dec!(100))]),
                event(2, 2, dec!(0), &[("MSFT", dec!(1), dec!(7))]),
            ])
            .await
            .unwrap();
        ledger
            .commit_batch(&[event(3, 1, dec!(800), &[("MSFT", dec!(2), dec!(50))])])
            .await
            .unwrap();

        let trades = ledger.trades_for_user(1, 10).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].symbol, "MSFT");
        assert_eq!(trades[0].trade_type, "BUY");
        assert_eq!(ledger.trades_for_user(1, 1).await.unwrap().len(), 1);
    }
}
