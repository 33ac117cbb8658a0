//! Error types for every pipeline stage
//!
//! Caller-visible errors carry a stable `code()` and an `http_status()` so the
//! gateway can map them without matching on message text.

use thiserror::Error;

use crate::core_types::{StreamId, UserId};

/// Fast-store command failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("wrong type for key {0}")]
    WrongType(String),

    #[error("no such consumer group {group} on stream {stream}")]
    NoGroup { stream: String, group: String },

    #[error("corrupt value at {key}: {value}")]
    Corrupt { key: String, value: String },
}

/// Event-log command failure.
#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("event log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record in {topic} at offset {offset}")]
    Corrupt { topic: String, offset: u64 },

    #[error("offset {0} was not delivered to this consumer")]
    UnknownOffset(u64),

    #[error("event log closed")]
    Closed,
}

/// Rejection at the admission boundary.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Trade queue is full")]
    QueueFull,

    #[error("Trade queue is closed")]
    Closed,
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::QueueFull => "QUEUE_FULL",
            AdmissionError::Closed => "QUEUE_CLOSED",
        }
    }

    pub fn http_status(&self) -> u16 {
        503
    }
}

/// Malformed inbound payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Trade must contain at least one stock line")]
    EmptyTrade,

    #[error("Symbol must not be empty")]
    EmptySymbol,

    #[error("Quantity must be greater than zero: {0}")]
    InvalidQuantity(String),
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::InvalidJson(_) => "INVALID_JSON",
            RequestError::EmptyTrade => "EMPTY_TRADE",
            RequestError::EmptySymbol => "EMPTY_SYMBOL",
            RequestError::InvalidQuantity(_) => "INVALID_QUANTITY",
        }
    }

    pub fn http_status(&self) -> u16 {
        400
    }
}

/// Outcome of staging a trade that did not produce a stream entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("User {0} not found or has no balance")]
    UserNotFound(UserId),

    #[error("Price not found for symbol {0}")]
    PriceNotFound(String),

    #[error("Insufficient funds: cost {cost} exceeds balance {balance}")]
    InsufficientFunds {
        cost: rust_decimal::Decimal,
        balance: rust_decimal::Decimal,
    },

    #[error("Invalid trade: {0}")]
    InvalidTrade(#[from] RequestError),

    #[error("Balance for user {0} kept changing; gave up after retries")]
    Contention(UserId),

    #[error("Staging failed for user {user_id}: {reason}")]
    StagingFailed { user_id: UserId, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl StageError {
    pub fn code(&self) -> &'static str {
        match self {
            StageError::UserNotFound(_) => "USER_NOT_FOUND",
            StageError::PriceNotFound(_) => "PRICE_NOT_FOUND",
            StageError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            StageError::InvalidTrade(_) => "INVALID_TRADE",
            StageError::Contention(_) => "CONTENTION",
            StageError::StagingFailed { .. } => "STAGING_FAILED",
            StageError::Store(_) => "STORE_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            StageError::UserNotFound(_) | StageError::PriceNotFound(_) => 404,
            StageError::InsufficientFunds { .. } => 403,
            StageError::InvalidTrade(_) => 400,
            StageError::Contention(_) => 409,
            StageError::StagingFailed { .. } | StageError::Store(_) => 500,
        }
    }

    /// Terminal errors are never worth retrying with the same input.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageError::UserNotFound(_)
                | StageError::PriceNotFound(_)
                | StageError::InsufficientFunds { .. }
                | StageError::InvalidTrade(_)
        )
    }
}

/// Hand-off bridge failure.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Fatal for the worker that hit it.
    #[error("stream read failed: {0}")]
    Read(StoreError),

    /// Transient: the entry stays pending and is reclaimed later.
    #[error("publish of {stream_id} failed: {source}")]
    Publish {
        stream_id: StreamId,
        source: EventLogError,
    },

    #[error("ack of {stream_id} failed: {source}")]
    Ack {
        stream_id: StreamId,
        source: StoreError,
    },

    #[error("malformed stream entry {stream_id}: {reason}")]
    Malformed { stream_id: StreamId, reason: String },
}

/// Ledger commit failure. The batch's log offsets must not be acknowledged.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger transaction exceeded {0:?}")]
    Timeout(std::time::Duration),

    #[error("Undecodable ledger event at offset {offset}: {reason}")]
    Decode { offset: u64, reason: String },

    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("Ledger rejected batch: {0}")]
    Rejected(String),
}

/// Boot-time copy of ledger state into the fast store.
#[derive(Error, Debug)]
pub enum HydrateError {
    #[error("reading ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("writing fast store: {0}")]
    Store(#[from] StoreError),

    #[error("reading event log: {0}")]
    EventLog(#[from] EventLogError),

    #[error("ledger still {pending} records behind after {waited:?}")]
    Backlog { pending: usize, waited: std::time::Duration },
}
