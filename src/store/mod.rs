//! Fast key/value store
//!
//! The staging engine and the hand-off bridge talk to the fast store only
//! through [`FastStore`], a Redis-shaped command set: scalar and hash access,
//! an atomic multi-command batch with compare-and-set guards, and streams with
//! consumer groups.
//!
//! [`MemoryStore`] is the in-process implementation used by the binary and the
//! tests.

pub mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::core_types::{StreamId, UserId};
use crate::error::StoreError;

pub use memory::MemoryStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Key layout shared by every component touching the fast store.
pub mod keys {
    use crate::core_types::UserId;

    /// Hash: field = user id, value = balance.
    pub const USER_BALANCE: &str = "user_balance";
    /// Hash: field = symbol, value = price.
    pub const STOCK_PRICES: &str = "stockPrices";
    /// Scalar price keys `stock:<SYM>`, read at warm-up.
    pub const STOCK_PREFIX: &str = "stock:";
    /// Durable queue of staged trades.
    pub const BUY_STREAM: &str = "buy_stream";

    /// Hash: field = symbol, value = `"qty,avg"`.
    pub fn positions(user_id: UserId) -> String {
        format!("positions:{}", user_id)
    }

    pub fn rollback_balance(user_id: UserId) -> String {
        format!("rollback:balance:{}", user_id)
    }

    pub fn rollback_positions(user_id: UserId) -> String {
        format!("rollback:position:{}", user_id)
    }

    pub fn stock(symbol: &str) -> String {
        format!("{}{}", STOCK_PREFIX, symbol)
    }

    /// Field used inside `rollback:balance:<uid>`.
    pub const ROLLBACK_BALANCE_FIELD: &str = "balance";
    /// Marker stored in `rollback:position:<uid>` when the user held nothing.
    pub const ABSENT_POSITION: &str = "-";
}

/// A write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set {
        key: String,
        value: String,
    },
    Del {
        key: String,
    },
    HSet {
        key: String,
        field: String,
        value: String,
    },
    HDel {
        key: String,
        field: String,
    },
    XAdd {
        stream: String,
        fields: Vec<(String, String)>,
    },
}

/// Precondition checked before any command of the batch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Hash field must currently hold `expected` (`None` = field absent).
    HashField {
        key: String,
        field: String,
        expected: Option<String>,
    },
}

/// All-or-nothing write set (MULTI/EXEC with WATCH-style guards).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicBatch {
    pub guards: Vec<Guard>,
    pub commands: Vec<Command>,
}

impl AtomicBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard_hash_field(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        expected: Option<String>,
    ) -> &mut Self {
        self.guards.push(Guard::HashField {
            key: key.into(),
            field: field.into(),
            expected,
        });
        self
    }

    pub fn hset(
        &mut self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.commands.push(Command::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.commands.push(Command::HDel {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(Command::Del { key: key.into() });
        self
    }

    pub fn xadd(&mut self, stream: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.commands.push(Command::XAdd {
            stream: stream.into(),
            fields,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Result of [`FastStore::exec_atomic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Every command applied. Holds the IDs of any `XAdd`s, in order.
    Applied(Vec<StreamId>),
    /// A guard did not match; nothing was written.
    Aborted,
}

/// Stream entry as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: StreamId,
    pub fields: Vec<(String, String)>,
    /// How many times this entry has been delivered to the group.
    pub delivery_count: u32,
}

/// Pending-entries summary for a consumer group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: usize,
    pub consumers: HashMap<String, usize>,
}

/// Command set required from the fast store.
#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hmget(&self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Apply `batch` atomically. Guards are checked first.
    async fn exec_atomic(&self, batch: AtomicBatch) -> StoreResult<ExecOutcome>;

    async fn xadd(&self, stream: &str, fields: Vec<(String, String)>) -> StoreResult<StreamId>;

    /// Create `group` on `stream` (creating the stream if needed), reading
    /// from the start. No-op if the group exists.
    async fn xgroup_create(&self, stream: &str, group: &str) -> StoreResult<()>;

    /// Deliver up to `count` never-delivered entries to `consumer`, waiting at
    /// most `block` for one to arrive. `Duration::ZERO` does not wait.
    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamRecord>>;

    /// Transfer entries pending longer than `min_idle` to `consumer`.
    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamRecord>>;

    async fn xack(&self, stream: &str, group: &str, ids: &[StreamId]) -> StoreResult<usize>;

    async fn xdel(&self, stream: &str, ids: &[StreamId]) -> StoreResult<usize>;

    async fn xlen(&self, stream: &str) -> StoreResult<usize>;

    async fn xpending(&self, stream: &str, group: &str) -> StoreResult<PendingSummary>;
}

/// Read a user's balance field from the `user_balance` hash.
pub async fn read_balance(
    store: &dyn FastStore,
    user_id: UserId,
) -> StoreResult<Option<rust_decimal::Decimal>> {
    use std::str::FromStr;

    match store.hget(keys::USER_BALANCE, &user_id.to_string()).await? {
        Some(raw) => rust_decimal::Decimal::from_str(&raw)
            .map(Some)
            .map_err(|_| StoreError::Corrupt {
                key: format!("{}/{}", keys::USER_BALANCE, user_id),
                value: raw,
            }),
        None => Ok(None),
    }
}
