use axum::{
    body::Bytes,
    extract::{Path, Query, State},
};
use rust_decimal::Decimal;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::sync::Arc;

use crate::core_types::{Symbol, UserId, now_ms};
use crate::error::StageError;
use crate::ledger::TradeRecord;
use crate::models::{PositionRecord, TradeRequest};
use crate::pipeline::PipelineStatsSnapshot;
use crate::portfolio::{LeaderboardEntry, Valuation, rank, value_portfolio};
use crate::price_cache::PriceCache;
use crate::store::{FastStore, keys, read_balance};

use super::state::AppState;
use super::types::{
    ApiError, ApiResult, HealthResponse, PositionView, PositionsResponse, TradeAccepted, accepted,
    ok,
};

const DEFAULT_TRADES_LIMIT: i64 = 50;
const MAX_TRADES_LIMIT: i64 = 500;
const DEFAULT_LEADERBOARD_LIMIT: usize = 10;
const MAX_LEADERBOARD_LIMIT: usize = 100;

/// POST /api/trade
///
/// Admission only: 202 means queued, not staged.
pub async fn submit_trade(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<TradeAccepted> {
    let trade = TradeRequest::parse(&body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected malformed trade");
        ApiError::from(e)
    })?;
    let user_id = trade.user_id;

    let job_id = state.queue.submit(trade).map_err(|e| {
        tracing::warn!(user_id, error = %e, "Trade rejected at admission");
        ApiError::from(e)
    })?;

    tracing::debug!(user_id, job_id, "Trade admitted");
    accepted(TradeAccepted {
        job_id,
        user_id,
        status: "ACCEPTED",
        accepted_at: now_ms(),
    })
}

/// GET /api/health
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    ok(HealthResponse {
        status: if state.queue.is_closed() { "draining" } else { "ok" },
        version: env!("GIT_HASH"),
        timestamp_ms: now_ms(),
        queue_depth: state.queue.len(),
        queue_capacity: state.queue.capacity(),
    })
}

/// GET /api/v1/positions/{user_id}
///
/// Snapshot from the fast store, i.e. including trades not yet in the ledger.
pub async fn get_positions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> ApiResult<PositionsResponse> {
    let balance = read_balance(state.store.as_ref(), user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("User {} not found", user_id)))?;

    let positions = read_positions(state.store.as_ref(), user_id)
        .await?
        .into_iter()
        .map(|(symbol, p)| PositionView {
            symbol,
            quantity: p.quantity,
            average_price: p.average_price,
        })
        .collect();

    ok(PositionsResponse {
        user_id,
        balance,
        positions,
    })
}

/// `positions:<uid>` sorted by symbol. Unparseable fields are skipped.
async fn read_positions(
    store: &dyn FastStore,
    user_id: UserId,
) -> Result<Vec<(Symbol, PositionRecord)>, ApiError> {
    let raw = store.hgetall(&keys::positions(user_id)).await?;
    let mut positions: Vec<(Symbol, PositionRecord)> = raw
        .into_iter()
        .filter_map(|(symbol, value)| match value.parse::<PositionRecord>() {
            Ok(p) => Some((symbol, p)),
            Err(e) => {
                tracing::warn!(user_id, symbol = %symbol, error = %e, "Skipping corrupt position");
                None
            }
        })
        .collect();
    positions.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(positions)
}

/// Current prices for `symbols`; symbols without a price are left out.
async fn price_table(
    prices: &PriceCache,
    symbols: impl IntoIterator<Item = Symbol>,
) -> Result<FxHashMap<Symbol, Decimal>, ApiError> {
    let mut table = FxHashMap::default();
    for symbol in symbols {
        match prices.get_price(&symbol).await {
            Ok(price) => {
                table.insert(symbol, price);
            }
            Err(StageError::PriceNotFound(_)) => {
                tracing::warn!(symbol = %symbol, "No price for held symbol, valued at zero");
            }
            Err(e) => {
                tracing::error!(symbol = %symbol, error = %e, "Price lookup failed");
                return Err(ApiError::internal("Price lookup failed"));
            }
        }
    }
    Ok(table)
}

/// GET /api/v1/portfolio/{user_id}
///
/// Fast-store book marked to current prices.
pub async fn get_portfolio(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
) -> ApiResult<Valuation> {
    let cash = read_balance(state.store.as_ref(), user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("User {} not found", user_id)))?;
    let positions = read_positions(state.store.as_ref(), user_id).await?;
    let symbols: Vec<Symbol> = positions.iter().map(|(s, _)| s.clone()).collect();
    let table = price_table(&state.prices, symbols).await?;
    ok(value_portfolio(user_id, cash, positions, &table))
}

#[derive(Debug, Default, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/leaderboard?limit=10
///
/// Ledger users ranked by net worth at current prices.
pub async fn get_leaderboard(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LeaderboardQuery>,
) -> ApiResult<Vec<LeaderboardEntry>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
        .clamp(1, MAX_LEADERBOARD_LIMIT);
    let balances = state.ledger.balances().await?;

    let mut books: FxHashMap<UserId, Vec<(Symbol, PositionRecord)>> = FxHashMap::default();
    let mut symbols: FxHashSet<Symbol> = FxHashSet::default();
    for (user_id, symbol, position) in state.ledger.positions().await? {
        symbols.insert(symbol.clone());
        books.entry(user_id).or_default().push((symbol, position));
    }
    let table = price_table(&state.prices, symbols).await?;

    let valuations = balances.into_iter().map(|(user_id, cash)| {
        let book = books.remove(&user_id).unwrap_or_default();
        value_portfolio(user_id, cash, book, &table)
    });
    ok(rank(valuations, limit))
}

#[derive(Debug, Default, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<i64>,
}

/// GET /api/v1/trades/{user_id}?limit=50
///
/// Ledger history, most recent first.
pub async fn get_trades(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    Query(params): Query<TradesQuery>,
) -> ApiResult<Vec<TradeRecord>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_TRADES_LIMIT)
        .clamp(1, MAX_TRADES_LIMIT);
    ok(state.ledger.trades_for_user(user_id, limit).await?)
}

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<PipelineStatsSnapshot> {
    ok(state.stats.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionQueue;
    use crate::ledger::test_support::event;
    use crate::ledger::{LedgerStore, MemoryLedger};
    use crate::pipeline::PipelineStats;
    use crate::store::{FastStore, MemoryStore};
    use axum::http::StatusCode;
    use rust_decimal_macros::dec;

    struct Fixture {
        state: Arc<AppState>,
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let stats = Arc::new(PipelineStats::new());
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let queue = Arc::new(AdmissionQueue::new(capacity, stats.clone()));
        let prices = Arc::new(PriceCache::new(store.clone()));
        let state = Arc::new(AppState::new(
            queue,
            store.clone(),
            ledger.clone(),
            prices,
            stats,
        ));
        Fixture {
            state,
            store,
            ledger,
        }
    }

    const TRADE: &str = r#"{"user_id":1,"action":"BUY","stock":[{"symbol":"AAPL","quantity":"5"}]}"#;

    #[tokio::test]
    async fn test_submit_accepted() {
        let f = fixture(4);
        let (status, body) = submit_trade(State(f.state.clone()), Bytes::from(TRADE))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        let data = body.0.data.unwrap();
        assert_eq!(data.user_id, 1);
        assert_eq!(data.status, "ACCEPTED");
        assert_eq!(f.state.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_malformed_is_400() {
        let f = fixture(4);
        let err = submit_trade(State(f.state.clone()), Bytes::from("{not json"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let empty = r#"{"user_id":1,"action":"BUY","stock":[]}"#;
        let err = submit_trade(State(f.state.clone()), Bytes::from(empty))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(f.state.queue.is_empty());
    }

    #[tokio::test]
    async fn test_submit_queue_full_is_503() {
        let f = fixture(1);
        submit_trade(State(f.state.clone()), Bytes::from(TRADE))
            .await
            .unwrap();
        let err = submit_trade(State(f.state.clone()), Bytes::from(TRADE))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(f.state.stats.snapshot().rejected_full, 1);
    }

    #[tokio::test]
    async fn test_positions_snapshot() {
        let f = fixture(1);
        f.store.hset(keys::USER_BALANCE, "1", "500").await.unwrap();
        f.store.hset(&keys::positions(1), "MSFT", "1,120").await.unwrap();
        f.store.hset(&keys::positions(1), "AAPL", "5,100").await.unwrap();

        let (_, body) = get_positions(State(f.state.clone()), Path(1)).await.unwrap();
        let data = body.0.data.unwrap();
        assert_eq!(data.balance, dec!(500));
        assert_eq!(data.positions.len(), 2);
        assert_eq!(data.positions[0].symbol, "AAPL");
        assert_eq!(data.positions[0].average_price, dec!(100));

        let err = get_positions(State(f.state.clone()), Path(99)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trades_from_ledger() {
        let f = fixture(1);
        f.ledger
            .commit_batch(&[event(1, 1, dec!(500), &[("AAPL", dec!(5), dec!(100))])])
            .await
            .unwrap();
        let (_, body) = get_trades(
            State(f.state.clone()),
            Path(1),
            Query(TradesQuery { limit: Some(0) }),
        )
        .await
        .unwrap();
        let trades = body.0.data.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].executed_price, dec!(100));
    }

    #[tokio::test]
    async fn test_portfolio_valuation() {
        let f = fixture(1);
        f.store.hset(keys::USER_BALANCE, "1", "0").await.unwrap();
        f.store.hset(&keys::positions(1), "AAPL", "10,110").await.unwrap();
        f.store.hset(keys::STOCK_PRICES, "AAPL", "121").await.unwrap();

        let (status, body) = get_portfolio(State(f.state.clone()), Path(1)).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let data = body.0.data.unwrap();
        assert_eq!(data.total_investment, dec!(1100));
        assert_eq!(data.current_value, dec!(1210));
        assert_eq!(data.roi_percent, dec!(10));
        assert_eq!(data.holdings[0].current_price, Some(dec!(121)));

        let err = get_portfolio(State(f.state.clone()), Path(99)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_leaderboard_from_ledger() {
        let f = fixture(1);
        f.store.hset(keys::STOCK_PRICES, "AAPL", "200").await.unwrap();
        f.ledger
            .seed_users(&[(1, dec!(1000)), (2, dec!(1000)), (3, dec!(50))])
            .await
            .unwrap();
        f.ledger
            .commit_batch(&[event(1, 2, dec!(500), &[("AAPL", dec!(5), dec!(100))])])
            .await
            .unwrap();

        let (_, body) = get_leaderboard(
            State(f.state.clone()),
            Query(LeaderboardQuery { limit: None }),
        )
        .await
        .unwrap();
        let board = body.0.data.unwrap();
        assert_eq!(board.len(), 3);
        assert_eq!((board[0].user_id, board[0].net_worth), (2, dec!(1500)));
        assert_eq!(board[0].portfolio_value, dec!(1000));
        assert_eq!((board[1].user_id, board[1].rank), (1, 2));
        assert_eq!(board[2].user_id, 3);

        let (_, body) = get_leaderboard(
            State(f.state.clone()),
            Query(LeaderboardQuery { limit: Some(1) }),
        )
        .await
        .unwrap();
        assert_eq!(body.0.data.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let f = fixture(8);
        let (status, body) = health_check(State(f.state.clone())).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let health = body.0.data.unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.queue_capacity, 8);

        f.state.queue.close();
        let (_, body) = health_check(State(f.state.clone())).await.unwrap();
        assert_eq!(body.0.data.unwrap().status, "draining");

        let (_, body) = get_stats(State(f.state.clone())).await.unwrap();
        assert_eq!(body.0.data.unwrap().submitted, 0);
    }
}
