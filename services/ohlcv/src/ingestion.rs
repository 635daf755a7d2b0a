//! Deal ingestion layer
//!
//! Decodes raw deal records, drops records that are not real executions,
//! rejects invalid ones, suppresses redelivered deal ids within a bounded
//! window, and forwards the rest to the live store.
//!
//! Inbound feeds are at-least-once and a deal can arrive on more than one
//! path, so every ingester of a service checks the same [`DedupWindow`].

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};
use types::deal::{Deal, DealRecord};
use types::errors::DealError;
use types::ids::DealId;

use crate::metrics::ServiceMetrics;
use crate::store::{DealOutcome, LiveCandleStore, StoreError};

/// Deal ids remembered by default.
pub const DEFAULT_DEDUP_WINDOW: usize = 10_000;

/// Errors that can occur during deal ingestion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestionError {
    #[error("malformed deal record: {0}")]
    Decode(String),

    #[error(transparent)]
    Invalid(#[from] DealError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of ingesting a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionResult {
    /// Deal folded into the store.
    Accepted(DealOutcome),
    /// Record without order ids, dropped before the store.
    Skipped,
    /// Deal id already seen within the dedup window.
    Duplicate,
}

/// Bounded set of recently claimed deal ids, oldest evicted first.
///
/// An id is claimed before its deal reaches the store, so a copy arriving
/// concurrently on another path is dropped. A claim whose deal is not
/// applied is released again.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    state: Mutex<DedupState>,
}

#[derive(Debug, Default)]
struct DedupState {
    order: VecDeque<DealId>,
    ids: HashSet<DealId>,
}

impl DedupWindow {
    /// A window of zero disables dedup.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(DedupState {
                order: VecDeque::with_capacity(capacity),
                ids: HashSet::with_capacity(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim `id`, returning `false` if it is already in the window.
    fn claim(&self, id: &DealId) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let mut state = self.lock();
        if state.ids.contains(id) {
            return false;
        }
        if state.order.len() >= self.capacity {
            if let Some(evicted) = state.order.pop_front() {
                state.ids.remove(&evicted);
            }
        }
        state.ids.insert(id.clone());
        state.order.push_back(id.clone());
        true
    }

    fn release(&self, id: &DealId) {
        let mut state = self.lock();
        if state.ids.remove(id) {
            state.order.retain(|seen| seen != id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DedupState> {
        // the state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

/// Front door of the aggregation pipeline, one per inbound path.
pub struct DealIngester {
    store: Arc<LiveCandleStore>,
    metrics: Arc<ServiceMetrics>,
    dedup: Arc<DedupWindow>,
    deals_accepted: u64,
    deals_skipped: u64,
    deals_duplicate: u64,
    deals_rejected: u64,
}

impl DealIngester {
    pub fn new(
        store: Arc<LiveCandleStore>,
        metrics: Arc<ServiceMetrics>,
        dedup: Arc<DedupWindow>,
    ) -> Self {
        info!(dedup_window = dedup.capacity(), "DealIngester initialized");

        Self {
            store,
            metrics,
            dedup,
            deals_accepted: 0,
            deals_skipped: 0,
            deals_duplicate: 0,
            deals_rejected: 0,
        }
    }

    /// Ingest one JSON encoded record.
    pub async fn ingest_json(&mut self, line: &str) -> Result<IngestionResult, IngestionError> {
        let record: DealRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) => {
                self.reject();
                warn!(error = %e, "Undecodable deal record");
                return Err(IngestionError::Decode(e.to_string()));
            }
        };
        self.ingest_record(&record).await
    }

    /// Ingest one decoded record.
    pub async fn ingest_record(
        &mut self,
        record: &DealRecord,
    ) -> Result<IngestionResult, IngestionError> {
        if !record.has_order_ids() {
            self.deals_skipped += 1;
            self.metrics.record_deal_filtered();
            debug!(deal_id = %record.id, market = %record.market, "Deal without order ids skipped");
            return Ok(IngestionResult::Skipped);
        }

        let deal = match Deal::try_from(record) {
            Ok(deal) => deal,
            Err(e) => {
                self.reject();
                warn!(deal_id = %record.id, market = %record.market, error = %e, "Invalid deal rejected");
                return Err(e.into());
            }
        };

        self.ingest_deal(&deal).await
    }

    /// Ingest one validated deal.
    pub async fn ingest_deal(&mut self, deal: &Deal) -> Result<IngestionResult, IngestionError> {
        if !self.dedup.claim(&deal.id) {
            self.deals_duplicate += 1;
            self.metrics.record_deal_duplicate();
            debug!(deal_id = %deal.id, market = %deal.market, "Dropping duplicate deal");
            return Ok(IngestionResult::Duplicate);
        }

        let outcome = match self.store.add_deal(deal).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.dedup.release(&deal.id);
                self.reject();
                warn!(deal_id = %deal.id, market = %deal.market, error = %e, "Deal not applied");
                return Err(e.into());
            }
        };

        self.deals_accepted += 1;
        self.metrics.record_deal_applied(outcome.skipped as u64);
        Ok(IngestionResult::Accepted(outcome))
    }

    pub fn deals_accepted(&self) -> u64 {
        self.deals_accepted
    }

    pub fn deals_skipped(&self) -> u64 {
        self.deals_skipped
    }

    pub fn deals_duplicate(&self) -> u64 {
        self.deals_duplicate
    }

    pub fn deals_rejected(&self) -> u64 {
        self.deals_rejected
    }

    fn reject(&mut self) {
        self.deals_rejected += 1;
        self.metrics.record_deal_rejected();
    }
}
