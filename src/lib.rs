//! Trade settlement pipeline
//!
//! Buy orders flow through four stages:
//!
//! 1. admission: a bounded queue that rejects when full,
//! 2. staging: funds check and balance/position update in the fast store,
//!    with a rollback snapshot for compensation, appended to a durable stream,
//! 3. bridge: stream entries forwarded to the event log (at-least-once),
//! 4. ledger: batched, idempotent commits to the relational ledger.
//!
//! # Modules
//!
//! - [`core_types`] - Ids and the stream id token
//! - [`models`] - Trade requests, positions, stream entries, ledger events
//! - [`store`] - Fast key/value store command set and in-process store
//! - [`price_cache`] - Price/balance cache gateway
//! - [`admission`] - Admission queue and worker pool
//! - [`staging`] - Staging and compensation engine
//! - [`event_log`] - Append-only event log with consumer groups
//! - [`bridge`] - Stream to event log hand-off
//! - [`ledger`] - Batched ledger writer
//! - [`portfolio`] - Portfolio valuation and leaderboard ranking
//! - [`gateway`] - HTTP front door

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod pipeline;

// Stores
pub mod db;
pub mod event_log;
pub mod store;

// Stages
pub mod admission;
pub mod bridge;
pub mod hydrate;
pub mod ledger;
pub mod portfolio;
pub mod price_cache;
pub mod staging;

pub mod gateway;


// Convenient re-exports at crate root
pub use admission::{AdmissionQueue, JobHandler, WorkerPool};
pub use bridge::Bridge;
pub use core_types::{LogOffset, StreamId, Symbol, UserId};
pub use error::{AdmissionError, BridgeError, LedgerError, StageError, StoreError};
pub use event_log::{EventLog, LogBroker, LogConsumer};
pub use ledger::{LedgerStore, LedgerWriter, MemoryLedger, PgLedger};
pub use models::{LedgerEvent, PositionRecord, StockLine, StreamEntry, TradeAction, TradeRequest};
pub use pipeline::{PipelineStats, PipelineStatsSnapshot, ShutdownSignal};
pub use price_cache::PriceCache;
pub use staging::{Staged, StagingEngine};
pub use store::{FastStore, MemoryStore};
