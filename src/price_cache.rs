//! Price/Balance cache gateway
//!
//! Prices are read through a process-local map backed by the `stockPrices`
//! hash. Balances are never cached locally: every read goes to the fast store
//! so staging always sees the latest value.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::Arc;

use crate::core_types::{Symbol, UserId};
use crate::error::{StageError, StoreError};
use crate::store::{FastStore, keys};

/// A balance field as read, with its parsed value. `raw` is what a
/// compare-and-set guard on the field has to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub raw: String,
    pub value: Decimal,
}

pub struct PriceCache {
    store: Arc<dyn FastStore>,
    local: DashMap<Symbol, Decimal>,
}

impl PriceCache {
    pub fn new(store: Arc<dyn FastStore>) -> Self {
        Self {
            store,
            local: DashMap::new(),
        }
    }

    /// Preload every `stock:<SYM>` key. Unreadable entries are skipped.
    ///
    /// Returns the number of prices loaded.
    pub async fn warm_up(&self) -> Result<usize, StoreError> {
        let mut loaded = 0;
        for key in self.store.keys(keys::STOCK_PREFIX).await? {
            let Some(symbol) = key.strip_prefix(keys::STOCK_PREFIX) else {
                continue;
            };
            match self.store.get(&key).await {
                Ok(Some(raw)) => match Decimal::from_str(&raw) {
                    Ok(price) => {
                        self.local.insert(symbol.to_string(), price);
                        loaded += 1;
                    }
                    Err(_) => tracing::warn!(key = %key, value = %raw, "Invalid price, skipped"),
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to read price"),
            }
        }
        tracing::info!(count = loaded, "Loaded stock prices into memory");
        Ok(loaded)
    }

    /// Local map first, then the `stockPrices` hash (populating the map).
    pub async fn get_price(&self, symbol: &str) -> Result<Decimal, StageError> {
        if let Some(price) = self.local.get(symbol) {
            return Ok(*price);
        }

        let raw = self
            .store
            .hget(keys::STOCK_PRICES, symbol)
            .await?
            .ok_or_else(|| StageError::PriceNotFound(symbol.to_string()))?;
        let price = Decimal::from_str(&raw).map_err(|_| StoreError::Corrupt {
            key: format!("{}/{}", keys::STOCK_PRICES, symbol),
            value: raw.clone(),
        })?;

        self.local.insert(symbol.to_string(), price);
        Ok(price)
    }

    /// Current balance straight from the fast store.
    pub async fn get_balance(&self, user_id: UserId) -> Result<Decimal, StageError> {
        Ok(self.balance_snapshot(user_id).await?.value)
    }

    /// Current balance field, raw and parsed. Never cached.
    pub async fn balance_snapshot(&self, user_id: UserId) -> Result<BalanceSnapshot, StageError> {
        let field = user_id.to_string();
        let raw = self
            .store
            .hget(keys::USER_BALANCE, &field)
            .await?
            .ok_or(StageError::UserNotFound(user_id))?;
        let value = Decimal::from_str(&raw).map_err(|_| StoreError::Corrupt {
            key: format!("{}/{}", keys::USER_BALANCE, field),
            value: raw.clone(),
        })?;
        Ok(BalanceSnapshot { raw, value })
    }

    /// Drop the local copy so the next lookup reads the store again.
    pub fn invalidate(&self, symbol: &str) -> bool {
        self.local.remove(symbol).is_some()
    }

    pub fn cached_symbols(&self) -> usize {
        self.local.len()
    }
}

/// Write configured prices to both the `stockPrices` hash and `stock:<SYM>` keys.
pub async fn seed_prices<'a>(
    store: &dyn FastStore,
    prices: impl IntoIterator<Item = (&'a String, &'a Decimal)>,
) -> Result<usize, StoreError> {
    let mut count = 0;
    for (symbol, price) in prices {
        let value = price.to_string();
        store.hset(keys::STOCK_PRICES, symbol, &value).await?;
        store.set(&keys::stock(symbol), &value).await?;
        count += 1;
    }
    Ok(count)
}
