//! Portfolio valuation
//!
//! Cash plus holdings marked to the current price. `total_investment` is cash
//! plus the cost basis of every holding; ROI compares the two in percent.
//! Holdings whose price is unknown are marked at zero.

use rust_decimal::{Decimal, RoundingStrategy};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::core_types::{Symbol, UserId};
use crate::models::PositionRecord;

/// Decimal places for money figures in reports.
const MONEY_SCALE: u32 = 2;

fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Holding {
    pub symbol: Symbol,
    pub quantity: Decimal,
    pub average_price: Decimal,
    /// `None` when no price is known for the symbol
    pub current_price: Option<Decimal>,
    pub cost_basis: Decimal,
    pub market_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Valuation {
    pub user_id: UserId,
    pub cash: Decimal,
    pub holdings: Vec<Holding>,
    pub total_investment: Decimal,
    pub current_value: Decimal,
    pub roi_percent: Decimal,
}

/// Value one user's book. Holdings come out sorted by symbol.
pub fn value_portfolio(
    user_id: UserId,
    cash: Decimal,
    positions: impl IntoIterator<Item = (Symbol, PositionRecord)>,
    prices: &FxHashMap<Symbol, Decimal>,
) -> Valuation {
    let mut holdings: Vec<Holding> = positions
        .into_iter()
        .filter(|(_, p)| !p.quantity.is_zero())
        .map(|(symbol, p)| {
            let current_price = prices.get(&symbol).copied();
            Holding {
                cost_basis: p.quantity * p.average_price,
                market_value: p.quantity * current_price.unwrap_or(Decimal::ZERO),
                symbol,
                quantity: p.quantity,
                average_price: p.average_price,
                current_price,
            }
        })
        .collect();
    holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    let total_investment = cash + holdings.iter().map(|h| h.cost_basis).sum::<Decimal>();
    let current_value = cash + holdings.iter().map(|h| h.market_value).sum::<Decimal>();
    let roi_percent = if total_investment.is_zero() {
        Decimal::ZERO
    } else {
        (current_value - total_investment) / total_investment * Decimal::ONE_HUNDRED
    };

    Valuation {
        user_id,
        cash,
        holdings,
        total_investment: money(total_investment),
        current_value: money(current_value),
        roi_percent: money(roi_percent),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: UserId,
    pub cash: Decimal,
    pub portfolio_value: Decimal,
    pub net_worth: Decimal,
}

/// Rank by net worth, highest first; ties go to the lower user id.
pub fn rank(valuations: impl IntoIterator<Item = Valuation>, limit: usize) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = valuations
        .into_iter()
        .map(|v| LeaderboardEntry {
            rank: 0,
            user_id: v.user_id,
            cash: v.cash,
            portfolio_value: money(v.current_value - v.cash),
            net_worth: v.current_value,
        })
        .collect();
    entries.sort_by(|a, b| b.net_worth.cmp(&a.net_worth).then(a.user_id.cmp(&b.user_id)));
    entries.truncate(limit);
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn prices(pairs: &[(&str, Decimal)]) -> FxHashMap<Symbol, Decimal> {
        pairs.iter().map(|(s, p)| (s.to_string(), *p)).collect()
    }

    #[test]
    fn test_value_marks_holdings_to_market() {
        let v = value_portfolio(
            1,
            dec!(0),
            vec![("AAPL".to_string(), PositionRecord::new(dec!(10), dec!(110)))],
            &prices(&[("AAPL", dec!(121))]),
        );
        assert_eq!(v.total_investment, dec!(1100));
        assert_eq!(v.current_value, dec!(1210));
        assert_eq!(v.roi_percent, dec!(10));
        assert_eq!(v.holdings[0].market_value, dec!(1210));
    }

    #[test]
    fn test_cash_counts_and_unknown_price_is_zero() {
        let v = value_portfolio(
            1,
            dec!(500),
            vec![
                ("MSFT".to_string(), PositionRecord::new(dec!(1), dec!(100))),
                ("AAPL".to_string(), PositionRecord::new(dec!(5), dec!(100))),
            ],
            &prices(&[("AAPL", dec!(100))]),
        );
        assert_eq!(v.holdings[0].symbol, "AAPL");
        assert_eq!(v.holdings[1].current_price, None);
        assert_eq!(v.total_investment, dec!(1100));
        assert_eq!(v.current_value, dec!(1000));
        assert_eq!(v.roi_percent, dec!(-9.09));
    }

    #[test]
    fn test_empty_book_has_zero_roi() {
        let v = value_portfolio(1, dec!(0), Vec::new(), &FxHashMap::default());
        assert_eq!(v.roi_percent, dec!(0));
        assert!(v.holdings.is_empty());
    }

    #[test]
    fn test_rank_orders_by_net_worth() {
        let table = prices(&[("AAPL", dec!(100))]);
        let valuations = vec![
            value_portfolio(1, dec!(100), Vec::new(), &table),
            value_portfolio(
                2,
                dec!(0),
                vec![("AAPL".to_string(), PositionRecord::new(dec!(2), dec!(90)))],
                &table,
            ),
            value_portfolio(3, dec!(200), Vec::new(), &table),
        ];
        let board = rank(valuations, 2);
        assert_eq!(board.len(), 2);
        assert_eq!((board[0].rank, board[0].user_id), (1, 2));
        assert_eq!(board[0].portfolio_value, dec!(200));
        assert_eq!((board[1].rank, board[1].user_id), (2, 3));
    }
}
