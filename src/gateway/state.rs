use std::sync::Arc;

use crate::admission::AdmissionQueue;
use crate::ledger::LedgerStore;
use crate::pipeline::PipelineStats;
use crate::price_cache::PriceCache;
use crate::store::FastStore;

/// Shared gateway state
#[derive(Clone)]
pub struct AppState {
    /// Admission queue (hand-off to the staging workers)
    pub queue: Arc<AdmissionQueue>,
    /// Fast store, read for position snapshots
    pub store: Arc<dyn FastStore>,
    /// Relational ledger, read for trade history
    pub ledger: Arc<dyn LedgerStore>,
    /// Prices for portfolio valuation
    pub prices: Arc<PriceCache>,
    pub stats: Arc<PipelineStats>,
}

impl AppState {
    pub fn new(
        queue: Arc<AdmissionQueue>,
        store: Arc<dyn FastStore>,
        ledger: Arc<dyn LedgerStore>,
        prices: Arc<PriceCache>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            queue,
            store,
            ledger,
            prices,
            stats,
        }
    }
}
