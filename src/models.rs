// models.rs - Trade, position and stream record types

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use crate::core_types::{StreamId, Symbol, UserId};
use crate::error::RequestError;

/// Decimal places kept for average prices, in the cache and in Postgres alike.
pub const PRICE_SCALE: u32 = 8;

/// Round an average price the same way Postgres `ROUND(x, 8)` does.
#[inline]
pub fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Trade action. Only buys are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    #[serde(rename = "BUY", alias = "buy", alias = "Buy")]
    Buy,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("buy") {
            Ok(TradeAction::Buy)
        } else {
            Err(format!("unsupported action: {}", s))
        }
    }
}

/// One instrument inside a trade.
///
/// `price` is filled in by the pipeline from the price cache; whatever the
/// caller sends is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    pub symbol: Symbol,
    pub quantity: Decimal,
    #[serde(default)]
    pub price: Decimal,
}

impl StockLine {
    pub fn new(symbol: impl Into<Symbol>, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            price: Decimal::ZERO,
        }
    }

    /// Cost of this line at its resolved price.
    pub fn cost(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Inbound trade as decoded from the HTTP body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub user_id: UserId,
    pub action: TradeAction,
    #[serde(rename = "stock", alias = "stocks")]
    pub lines: Vec<StockLine>,
}

impl TradeRequest {
    pub fn buy(user_id: UserId, lines: Vec<StockLine>) -> Self {
        Self {
            user_id,
            action: TradeAction::Buy,
            lines,
        }
    }

    /// Decode and validate a JSON body.
    pub fn parse(body: &[u8]) -> Result<Self, RequestError> {
        let req: TradeRequest = serde_json::from_slice(body)
            .map_err(|e| RequestError::InvalidJson(e.to_string()))?;
        req.validate()?;
        Ok(req)
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.lines.is_empty() {
            return Err(RequestError::EmptyTrade);
        }
        for line in &self.lines {
            if line.symbol.trim().is_empty() {
                return Err(RequestError::EmptySymbol);
            }
            if line.quantity <= Decimal::ZERO {
                return Err(RequestError::InvalidQuantity(line.quantity.to_string()));
            }
        }
        Ok(())
    }

    /// Distinct symbols in first-seen order.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut out: Vec<Symbol> = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            if !out.contains(&line.symbol) {
                out.push(line.symbol.clone());
            }
        }
        out
    }
}

/// Unit of work in the admission queue.
#[derive(Debug, Clone)]
pub struct TradeJob {
    pub job_id: u64,
    pub trade: TradeRequest,
    pub admitted_at: Instant,
}

impl TradeJob {
    pub fn new(job_id: u64, trade: TradeRequest) -> Self {
        Self {
            job_id,
            trade,
            admitted_at: Instant::now(),
        }
    }
}

// ============================================================
// POSITION
// ============================================================

/// Holding of one symbol for one user.
///
/// `average_price` is the quantity-weighted mean of every fill that built
/// `quantity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub quantity: Decimal,
    pub average_price: Decimal,
}

impl PositionRecord {
    pub fn new(quantity: Decimal, average_price: Decimal) -> Self {
        Self {
            quantity,
            average_price,
        }
    }

    /// Opening position from a first fill.
    pub fn opened(quantity: Decimal, price: Decimal) -> Self {
        Self::new(quantity, round_price(price))
    }

    /// Position after buying `quantity` more at `price`.
    ///
    /// `((q0 * p0) + (q1 * p1)) / (q0 + q1)`, rounded to [`PRICE_SCALE`].
    pub fn apply_fill(&self, quantity: Decimal, price: Decimal) -> Self {
        let total = self.quantity + quantity;
        if total.is_zero() {
            return Self::new(Decimal::ZERO, Decimal::ZERO);
        }
        let avg = (self.quantity * self.average_price + quantity * price) / total;
        Self::new(total, round_price(avg))
    }

    /// Apply a fill to an optional existing position.
    pub fn after_fill(existing: Option<&PositionRecord>, quantity: Decimal, price: Decimal) -> Self {
        match existing {
            Some(pos) => pos.apply_fill(quantity, price),
            None => Self::opened(quantity, price),
        }
    }
}

impl fmt::Display for PositionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.quantity, self.average_price)
    }
}

impl FromStr for PositionRecord {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (qty, avg) = s
            .split_once(',')
            .ok_or_else(|| format!("position must be 'qty,avg': {}", s))?;
        let quantity = Decimal::from_str(qty.trim()).map_err(|e| e.to_string())?;
        let average_price = Decimal::from_str(avg.trim()).map_err(|e| e.to_string())?;
        Ok(Self::new(quantity, average_price))
    }
}

/// Pre-trade state captured before a staging write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackSnapshot {
    pub user_id: UserId,
    pub balance: Decimal,
    /// Every symbol touched by the trade; `None` if the user held none.
    pub positions: Vec<(Symbol, Option<PositionRecord>)>,
}

// ============================================================
// STREAM ENTRY / LEDGER EVENT
// ============================================================

pub mod fields {
    pub const USER_ID: &str = "user_id";
    pub const ACTION: &str = "action";
    pub const BALANCE: &str = "balance";
    pub const STOCKS: &str = "stocks";
}

/// Durable-queue record written by staging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub user_id: UserId,
    pub action: TradeAction,
    /// Balance after the trade, carried unchanged to the ledger.
    pub balance: Decimal,
    pub lines: Vec<StockLine>,
}

impl StreamEntry {
    /// Field list for `XADD` (the ID is assigned by the store).
    pub fn to_fields(
        user_id: UserId,
        action: TradeAction,
        balance: Decimal,
        lines: &[StockLine],
    ) -> Vec<(String, String)> {
        // Vec<StockLine> always serializes
        let stocks = serde_json::to_string(lines).unwrap_or_else(|_| "[]".to_string());
        vec![
            (fields::USER_ID.to_string(), user_id.to_string()),
            (fields::ACTION.to_string(), action.as_str().to_string()),
            (fields::BALANCE.to_string(), balance.to_string()),
            (fields::STOCKS.to_string(), stocks),
        ]
    }

    /// Rebuild from raw stream fields.
    pub fn from_fields(id: StreamId, raw: &[(String, String)]) -> Result<Self, String> {
        let get = |name: &str| {
            raw.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .ok_or_else(|| format!("missing field {}", name))
        };
        let user_id = get(fields::USER_ID)?
            .parse::<UserId>()
            .map_err(|e| format!("invalid user_id: {}", e))?;
        let action = get(fields::ACTION)?.parse::<TradeAction>()?;
        let balance = Decimal::from_str(get(fields::BALANCE)?)
            .map_err(|e| format!("invalid balance: {}", e))?;
        let lines: Vec<StockLine> = serde_json::from_str(get(fields::STOCKS)?)
            .map_err(|e| format!("invalid stocks: {}", e))?;
        if lines.is_empty() {
            return Err("empty stocks".to_string());
        }
        Ok(Self {
            id,
            user_id,
            action,
            balance,
            lines,
        })
    }
}

/// Event-log payload. Same content as the stream entry it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub stream_id: StreamId,
    pub user_id: UserId,
    pub action: TradeAction,
    pub balance: Decimal,
    pub stocks: Vec<StockLine>,
}

impl LedgerEvent {
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

impl From<StreamEntry> for LedgerEvent {
    fn from(entry: StreamEntry) -> Self {
        Self {
            stream_id: entry.id,
            user_id: entry.user_id,
            action: entry.action,
            balance: entry.balance,
            stocks: entry.lines,
        }
    }
}
