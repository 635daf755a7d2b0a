//! Live candle store
//!
//! Holds the current candle of every tracked (market, resolution) pair and
//! publishes each state transition on the update channel. One coarse lock
//! guards both the candle map and the sender, and is held for the whole of
//! every mutating call including emission: a full channel therefore stalls
//! ingestion instead of reordering events.
//!
//! # Lifecycle
//!
//! [`LiveCandleStore::spawn`] runs the minute-aligned refresh loop. When the
//! store's cancellation token fires the loop stops and the sender is dropped;
//! any later emission is an invariant violation.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::deal::{Deal, DealRecord};
use types::errors::{DealError, DecimalError};
use types::ids::MarketId;

use crate::candles::Candle;
use crate::events::CandleEvent;
use crate::metrics::ServiceMetrics;
use crate::resolution::{Calendar, Resolution};
use crate::scheduler::{delay_until_next_minute, Clock};

/// Errors returned by store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid deal: {0}")]
    InvalidDeal(#[from] DealError),

    #[error("candle arithmetic failed: {0}")]
    Decimal(#[from] DecimalError),

    #[error("candle for {candle_market}/{candle_resolution} cannot be stored under {market}/{resolution}")]
    KeyMismatch {
        market: MarketId,
        resolution: Resolution,
        candle_market: MarketId,
        candle_resolution: Resolution,
    },

    #[error("candle emitter is closed")]
    ChannelClosed,

    #[error("malformed candle for {market}/{resolution}")]
    InvalidCandle {
        market: MarketId,
        resolution: Resolution,
    },

    #[error("emission abandoned on shutdown")]
    Cancelled,
}

/// Configuration for the live store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub calendar: Calendar,
    /// Resolutions maintained for every market, in iteration order.
    pub resolutions: Vec<Resolution>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            calendar: Calendar::default(),
            resolutions: Resolution::ALL.to_vec(),
        }
    }
}

/// How a deal was applied across resolutions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DealOutcome {
    /// Resolutions whose live bucket contained the deal.
    pub applied: usize,
    /// Resolutions whose live bucket did not contain the deal.
    pub skipped: usize,
}

struct StoreState {
    candles: BTreeMap<MarketId, BTreeMap<Resolution, Candle>>,
    updates: Option<mpsc::Sender<CandleEvent>>,
}

/// Concurrency-safe map of live candles.
pub struct LiveCandleStore {
    state: Mutex<StoreState>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    metrics: Arc<ServiceMetrics>,
}

impl LiveCandleStore {
    pub fn new(
        config: StoreConfig,
        clock: Arc<dyn Clock>,
        updates: mpsc::Sender<CandleEvent>,
        cancel: CancellationToken,
    ) -> Self {
        info!(
            resolutions = config.resolutions.len(),
            zone = %config.calendar.zone(),
            "LiveCandleStore initialized"
        );

        Self {
            state: Mutex::new(StoreState {
                candles: BTreeMap::new(),
                updates: Some(updates),
            }),
            config,
            clock,
            cancel,
            metrics: Arc::new(ServiceMetrics::new()),
        }
    }

    /// Share a metrics registry with the rest of the service.
    pub fn with_metrics(mut self, metrics: Arc<ServiceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn calendar(&self) -> &Calendar {
        &self.config.calendar
    }

    /// Fold a validated deal into every resolution of its market.
    ///
    /// Candles whose bucket has ended are rolled forward first. A deal outside the resulting bucket is skipped for that
    /// resolution. All folds are computed before anything is stored, so an
    /// arithmetic error leaves every candle untouched.
    pub async fn add_deal(&self, deal: &Deal) -> Result<DealOutcome, StoreError> {
        let calendar = &self.config.calendar;
        let mut state = self.state.lock().await;
        let now = self.clock.now_nanos();

        let existing = state.candles.get(&deal.market);
        let mut planned = Vec::with_capacity(self.config.resolutions.len());
        let mut events = Vec::new();
        let mut outcome = DealOutcome::default();
        let mut rollovers = 0;

        for &resolution in &self.config.resolutions {
            let mut candle = match existing.and_then(|m| m.get(&resolution)) {
                Some(current) if !current.has_ended(now) => current.clone(),
                Some(stale) => {
                    rollovers += 1;
                    let flat = Candle::flat_after(stale, calendar, now);
                    events.push(CandleEvent::Closed(stale.clone()));
                    events.push(CandleEvent::Opened(flat.clone()));
                    flat
                }
                None => {
                    let fresh = Candle::fresh(deal.market.clone(), resolution, calendar, now);
                    events.push(CandleEvent::Opened(fresh.clone()));
                    fresh
                }
            };

            if candle.contains(deal.created_at) {
                let folded = candle.fold(deal.price, deal.amount)?;
                if folded != candle {
                    events.push(CandleEvent::Updated(folded.clone()));
                    candle = folded;
                }
                outcome.applied += 1;
            } else {
                debug!(
                    deal_id = %deal.id,
                    market = %deal.market,
                    resolution = %resolution,
                    created_at = deal.created_at,
                    open_time = candle.open_time,
                    "Deal outside live bucket, skipped"
                );
                outcome.skipped += 1;
            }

            planned.push((resolution, candle));
        }

        let market_candles = state.candles.entry(deal.market.clone()).or_default();
        for (resolution, candle) in planned {
            market_candles.insert(resolution, candle);
        }
        self.metrics.record_rollovers(rollovers);

        self.emit_all(&state, events).await?;
        Ok(outcome)
    }

    /// Validate a raw record and fold it. Invalid records mutate nothing.
    pub async fn add_deal_record(&self, record: &DealRecord) -> Result<DealOutcome, StoreError> {
        let deal = Deal::try_from(record)?;
        self.add_deal(&deal).await
    }

    /// Seed or override the live candle of one pair.
    ///
    /// `None` stores a flat candle for the current bucket, inheriting the
    /// previous close when the pair is already tracked. Returns whether the
    /// stored value changed; storing an equal candle emits nothing.
    pub async fn add_candle(
        &self,
        market: MarketId,
        resolution: Resolution,
        candle: Option<Candle>,
    ) -> Result<bool, StoreError> {
        if let Some(c) = &candle {
            if c.market != market || c.resolution != resolution {
                return Err(StoreError::KeyMismatch {
                    market,
                    resolution,
                    candle_market: c.market.clone(),
                    candle_resolution: c.resolution,
                });
            }
            if !c.is_valid() {
                return Err(StoreError::InvalidCandle { market, resolution });
            }
        }

        let calendar = &self.config.calendar;
        let mut state = self.state.lock().await;
        let now = self.clock.now_nanos();
        let previous = state.candles.get(&market).and_then(|m| m.get(&resolution));

        let candle = match (candle, previous) {
            (Some(c), _) => c,
            // never step back to a bucket before the stored one
            (None, Some(prev)) => Candle::flat_after(prev, calendar, now.max(prev.open_time)),
            (None, None) => Candle::fresh(market.clone(), resolution, calendar, now),
        };

        let event = match previous {
            Some(prev) if *prev == candle => return Ok(false),
            Some(prev) if prev.open_time == candle.open_time => CandleEvent::Updated(candle.clone()),
            _ => CandleEvent::Opened(candle.clone()),
        };

        state
            .candles
            .entry(market)
            .or_default()
            .insert(resolution, candle);
        self.emit_all(&state, vec![event]).await?;
        Ok(true)
    }

    /// Roll every pair whose bucket has ended into a flat candle for the
    /// current bucket.
    ///
    /// Each rollover emits `Closed(previous)` then `Opened(flat)`. Pairs are
    /// visited by market, then by resolution declaration order.
    pub async fn refresh_all(&self) -> Result<usize, StoreError> {
        let calendar = &self.config.calendar;
        let mut state = self.state.lock().await;
        let now = self.clock.now_nanos();

        let mut events = Vec::new();
        for resolutions in state.candles.values_mut() {
            for candle in resolutions.values_mut() {
                if !candle.has_ended(now) {
                    continue;
                }
                let flat = Candle::flat_after(candle, calendar, now);
                let closed = std::mem::replace(candle, flat.clone());
                events.push(CandleEvent::Closed(closed));
                events.push(CandleEvent::Opened(flat));
            }
        }

        let rolled = events.len() / 2;
        if rolled > 0 {
            debug!(rolled, "Candles rolled over");
        }
        self.metrics.record_rollovers(rolled as u64);
        self.emit_all(&state, events).await?;
        Ok(rolled)
    }

    /// Copy of the live candle for one pair.
    pub async fn get_candle(&self, market: &MarketId, resolution: Resolution) -> Option<Candle> {
        let state = self.state.lock().await;
        state
            .candles
            .get(market)
            .and_then(|m| m.get(&resolution))
            .cloned()
    }

    /// All tracked pairs in iteration order.
    pub async fn tracked_pairs(&self) -> Vec<(MarketId, Resolution)> {
        let state = self.state.lock().await;
        state
            .candles
            .iter()
            .flat_map(|(market, resolutions)| {
                resolutions.keys().map(move |r| (market.clone(), *r))
            })
            .collect()
    }

    /// Run the refresh loop until the store is cancelled, then close the
    /// update channel.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Candle refresh scheduler started");
            loop {
                let delay = delay_until_next_minute(self.clock.now_nanos());
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        match self.refresh_all().await {
                            Ok(_) => {}
                            Err(StoreError::Cancelled) => break,
                            Err(e) => warn!(error = %e, "Candle refresh failed"),
                        }
                    }
                }
            }

            let mut state = self.state.lock().await;
            state.updates = None;
            info!("Candle refresh scheduler stopped, emitter closed");
        })
    }

    async fn emit_all(&self, state: &StoreState, events: Vec<CandleEvent>) -> Result<(), StoreError> {
        let count = events.len() as u64;
        for event in events {
            self.emit(state, event).await?;
        }
        self.metrics.record_events_emitted(count);
        Ok(())
    }

    async fn emit(&self, state: &StoreState, event: CandleEvent) -> Result<(), StoreError> {
        let Some(tx) = state.updates.as_ref() else {
            return Err(self.emitter_closed(&event));
        };

        let kind = event.kind_label();
        let candle = event.candle();
        let (market, resolution) = (candle.market.clone(), candle.resolution);

        tokio::select! {
            biased;
            sent = tx.send(event) => sent.map_err(|e| self.emitter_closed(&e.0)),
            _ = self.cancel.cancelled() => {
                warn!(%market, %resolution, kind, "Candle emission abandoned on shutdown");
                Err(StoreError::Cancelled)
            }
        }
    }

    fn emitter_closed(&self, event: &CandleEvent) -> StoreError {
        let candle = event.candle();
        error!(
            market = %candle.market,
            resolution = %candle.resolution,
            kind = event.kind_label(),
            "Emission attempted on closed candle emitter"
        );
        debug_assert!(false, "candle emitter is closed");
        StoreError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::scheduler::ManualClock;
    use chrono::{TimeZone, Utc};
    use types::numeric::{Price, Quantity};

    fn ts(h: u32, m: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(2020, 4, 14, h, m, s)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
    }

    fn make_deal(market: &str, price: &str, amount: &str, created_at: i64) -> Deal {
        Deal::try_from(&DealRecord {
            id: format!("{market}-{created_at}"),
            market: market.to_string(),
            price: price.to_string(),
            amount: amount.to_string(),
            created_at,
            taker_order_id: "t".to_string(),
            maker_order_id: "m".to_string(),
            is_buyer_maker: false,
        })
        .unwrap()
    }

    fn make_store(
        resolutions: Vec<Resolution>,
        now: i64,
    ) -> (LiveCandleStore, Arc<ManualClock>, mpsc::Receiver<CandleEvent>) {
        let clock = Arc::new(ManualClock::new(now));
        let (tx, rx) = events::channel(256);
        let store = LiveCandleStore::new(
            StoreConfig {
                calendar: Calendar::utc(),
                resolutions,
            },
            clock.clone(),
            tx,
            CancellationToken::new(),
        );
        (store, clock, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<CandleEvent>) -> Vec<CandleEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn p(s: &str) -> Option<Price> {
        Some(s.parse().unwrap())
    }

    #[tokio::test]
    async fn test_add_deal_scenario() {
        let (store, _clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        let market = MarketId::new("ETH/BTC");

        store.add_deal(&make_deal("ETH/BTC", "0.019", "14.9", ts(15, 45, 50))).await.unwrap();
        let c = store.get_candle(&market, Resolution::M1).await.unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (p("0.019"), p("0.019"), p("0.019"), p("0.019")));
        assert_eq!(c.volume.to_string(), "14.9");

        store.add_deal(&make_deal("ETH/BTC", "0.013", "1.9", ts(15, 45, 53))).await.unwrap();
        let c = store.get_candle(&market, Resolution::M1).await.unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (p("0.019"), p("0.019"), p("0.013"), p("0.013")));
        assert_eq!(c.volume.to_string(), "16.8");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], CandleEvent::Opened(_)));
        assert!(matches!(events[1], CandleEvent::Updated(_)));
        assert_eq!(events[2], CandleEvent::Updated(c));
    }

    #[tokio::test]
    async fn test_add_deal_all_resolutions() {
        let (store, _clock, mut rx) = make_store(Resolution::ALL.to_vec(), ts(15, 45, 56));
        let outcome = store
            .add_deal(&make_deal("USDT_TRX", "0.0132", "100", ts(15, 45, 50)))
            .await
            .unwrap();
        assert_eq!(outcome, DealOutcome { applied: 12, skipped: 0 });
        assert_eq!(store.tracked_pairs().await.len(), 12);
        // one Opened and one Updated per resolution
        assert_eq!(drain(&mut rx).len(), 24);
    }

    #[tokio::test]
    async fn test_deal_outside_bucket_is_skipped() {
        let (store, _clock, mut rx) = make_store(vec![Resolution::M1, Resolution::H1], ts(15, 45, 56));
        let outcome = store
            .add_deal(&make_deal("ETH/BTC", "0.02", "1", ts(15, 44, 30)))
            .await
            .unwrap();
        assert_eq!(outcome, DealOutcome { applied: 1, skipped: 1 });

        let m1 = store.get_candle(&MarketId::new("ETH/BTC"), Resolution::M1).await.unwrap();
        assert!(m1.close.is_none());
        let h1 = store.get_candle(&MarketId::new("ETH/BTC"), Resolution::H1).await.unwrap();
        assert_eq!(h1.close, p("0.02"));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_add_deal_rolls_stale_candle_first() {
        let (store, clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        store.add_deal(&make_deal("ETH/BTC", "0.019", "14.9", ts(15, 45, 50))).await.unwrap();
        drain(&mut rx);

        clock.set(ts(15, 47, 5));
        store.add_deal(&make_deal("ETH/BTC", "0.021", "1", ts(15, 47, 1))).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        let CandleEvent::Closed(closed) = &events[0] else { panic!("expected Closed") };
        assert_eq!(closed.open_time, ts(15, 45, 0));
        let CandleEvent::Opened(flat) = &events[1] else { panic!("expected Opened") };
        assert_eq!(flat.open_time, ts(15, 47, 0));
        assert_eq!(flat.open, p("0.019"));
        assert!(flat.volume.is_zero());
        let CandleEvent::Updated(updated) = &events[2] else { panic!("expected Updated") };
        // volume was zero, so the deal reopens the bucket
        assert_eq!(updated.open, p("0.021"));
        assert_eq!(updated.low, p("0.019"));
        assert_eq!(updated.high, p("0.021"));
    }

    #[tokio::test]
    async fn test_late_deal_after_boundary_is_skipped() {
        let (store, clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        store.add_deal(&make_deal("ETH/BTC", "0.019", "1", ts(15, 45, 50))).await.unwrap();
        drain(&mut rx);

        clock.set(ts(15, 46, 1));
        let outcome = store
            .add_deal(&make_deal("ETH/BTC", "0.5", "1", ts(15, 45, 59)))
            .await
            .unwrap();
        assert_eq!(outcome.skipped, 1);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events[0].is_final());
        assert_eq!(events[0].candle().close, p("0.019"));
    }

    #[tokio::test]
    async fn test_overflow_mutates_nothing() {
        let (store, _clock, mut rx) = make_store(vec![Resolution::M1, Resolution::M5], ts(15, 45, 56));
        let market = MarketId::new("ETH/BTC");
        let mut big = Candle::fresh(market.clone(), Resolution::M5, store.calendar(), ts(15, 45, 56));
        big.volume = Quantity::try_new(rust_decimal::Decimal::MAX).unwrap();
        store.add_candle(market.clone(), Resolution::M5, Some(big.clone())).await.unwrap();
        store.add_candle(market.clone(), Resolution::M1, None).await.unwrap();
        drain(&mut rx);

        let before = store.get_candle(&market, Resolution::M1).await.unwrap();
        let err = store
            .add_deal(&make_deal("ETH/BTC", "1", "1", ts(15, 45, 50)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Decimal(DecimalError::Overflow { .. })));
        assert_eq!(store.get_candle(&market, Resolution::M1).await.unwrap(), before);
        assert_eq!(store.get_candle(&market, Resolution::M5).await.unwrap(), big);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_add_deal_record_rejects_invalid() {
        let (store, _clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        let record = DealRecord {
            id: "1".to_string(),
            market: "ETH/BTC".to_string(),
            price: "0.0.1".to_string(),
            amount: "1".to_string(),
            created_at: ts(15, 45, 50),
            taker_order_id: "t".to_string(),
            maker_order_id: "m".to_string(),
            is_buyer_maker: false,
        };
        let err = store.add_deal_record(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDeal(DealError::InvalidPrice { .. })));
        assert!(store.tracked_pairs().await.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_add_candle_idempotent() {
        let (store, _clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        let market = MarketId::new("ETH/BTC");
        let candle = Candle::fresh(market.clone(), Resolution::M1, store.calendar(), ts(15, 45, 56))
            .fold("0.019".parse().unwrap(), "14.9".parse().unwrap())
            .unwrap();

        assert!(store.add_candle(market.clone(), Resolution::M1, Some(candle.clone())).await.unwrap());
        assert!(!store.add_candle(market.clone(), Resolution::M1, Some(candle.clone())).await.unwrap());

        let events = drain(&mut rx);
        assert_eq!(events, vec![CandleEvent::Opened(candle)]);
    }

    #[tokio::test]
    async fn test_add_candle_key_mismatch() {
        let (store, _clock, _rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        let candle = Candle::fresh(MarketId::new("ETH/BTC"), Resolution::M1, store.calendar(), 0);
        let err = store
            .add_candle(MarketId::new("BTC/USDT"), Resolution::M1, Some(candle))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyMismatch { .. }));
    }

    #[tokio::test]
    async fn test_add_candle_none_seeds_flat() {
        let (store, _clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        let market = MarketId::new("ETH/BTC");
        assert!(store.add_candle(market.clone(), Resolution::M1, None).await.unwrap());
        // an empty fresh candle for the same bucket is already stored
        assert!(!store.add_candle(market.clone(), Resolution::M1, None).await.unwrap());

        let seeded = store.get_candle(&market, Resolution::M1).await.unwrap();
        assert_eq!(seeded.open_time, ts(15, 45, 0));
        assert!(seeded.open.is_none());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_all_rollover() {
        let (store, clock, mut rx) = make_store(vec![Resolution::M1, Resolution::H1], ts(15, 45, 56));
        store.add_deal(&make_deal("ETH/BTC", "0.019", "14.9", ts(15, 45, 50))).await.unwrap();
        drain(&mut rx);

        assert_eq!(store.refresh_all().await.unwrap(), 0);
        assert!(drain(&mut rx).is_empty());

        clock.set(ts(15, 46, 0));
        assert_eq!(store.refresh_all().await.unwrap(), 1);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        let CandleEvent::Closed(closed) = &events[0] else { panic!("expected Closed") };
        assert_eq!(closed.volume.to_string(), "14.9");
        let CandleEvent::Opened(flat) = &events[1] else { panic!("expected Opened") };
        assert_eq!(flat.open_time, ts(15, 46, 0));
        assert_eq!(flat.close_time, ts(15, 47, 0));
        assert_eq!((flat.open, flat.high, flat.low, flat.close), (p("0.019"), p("0.019"), p("0.019"), p("0.019")));
        assert!(flat.volume.is_zero());
    }

    #[tokio::test]
    async fn test_refresh_all_skips_gaps() {
        // a long idle gap rolls straight to the current bucket
        let (store, clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        store.add_candle(MarketId::new("ETH/BTC"), Resolution::M1, None).await.unwrap();
        drain(&mut rx);

        clock.set(ts(18, 2, 30));
        store.refresh_all().await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].candle().open_time, ts(18, 2, 0));
    }

    #[tokio::test]
    async fn test_refresh_order_is_deterministic() {
        let (store, clock, mut rx) = make_store(vec![Resolution::M1, Resolution::M5], ts(15, 45, 56));
        for market in ["USDT_TRX", "ETH/BTC"] {
            store.add_deal(&make_deal(market, "1", "1", ts(15, 45, 50))).await.unwrap();
        }
        drain(&mut rx);

        clock.set(ts(15, 50, 0));
        store.refresh_all().await.unwrap();
        let order: Vec<(String, Resolution, bool)> = drain(&mut rx)
            .iter()
            .map(|e| (e.candle().market.to_string(), e.candle().resolution, e.is_final()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("ETH/BTC".to_string(), Resolution::M1, true),
                ("ETH/BTC".to_string(), Resolution::M1, false),
                ("ETH/BTC".to_string(), Resolution::M5, true),
                ("ETH/BTC".to_string(), Resolution::M5, false),
                ("USDT_TRX".to_string(), Resolution::M1, true),
                ("USDT_TRX".to_string(), Resolution::M1, false),
                ("USDT_TRX".to_string(), Resolution::M5, true),
                ("USDT_TRX".to_string(), Resolution::M5, false),
            ]
        );
    }

    #[tokio::test]
    async fn test_metrics_are_shared() {
        let (store, clock, _rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        let metrics = Arc::new(ServiceMetrics::new());
        let store = store.with_metrics(metrics.clone());
        store.add_deal(&make_deal("ETH/BTC", "1", "1", ts(15, 45, 50))).await.unwrap();
        clock.set(ts(15, 46, 10));
        store.refresh_all().await.unwrap();

        let exported = metrics.export();
        assert_eq!(exported["events_emitted"], 4);
        assert_eq!(exported["rollovers"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_refreshes_on_minute_and_closes_emitter() {
        let (store, clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        let cancel = store.cancel.clone();
        let store = Arc::new(store);
        store.add_deal(&make_deal("ETH/BTC", "0.019", "1", ts(15, 45, 50))).await.unwrap();
        drain(&mut rx);

        let handle = store.clone().spawn();
        // let the loop compute its delay from 15:45:56
        tokio::task::yield_now().await;
        clock.set(ts(15, 46, 0));
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        let closed = rx.recv().await.unwrap();
        assert!(closed.is_final());
        let opened = rx.recv().await.unwrap();
        assert_eq!(opened.candle().open_time, ts(15, 46, 0));

        cancel.cancel();
        handle.await.unwrap();
        // sender dropped: the receiver drains and ends
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    #[cfg_attr(debug_assertions, should_panic(expected = "candle emitter is closed"))]
    async fn test_emit_after_close_is_violation() {
        let (store, _clock, rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        drop(rx);
        let err = store
            .add_deal(&make_deal("ETH/BTC", "1", "1", ts(15, 45, 50)))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::ChannelClosed);
    }

    #[tokio::test]
    async fn test_blocked_emission_abandoned_on_cancel() {
        let clock = Arc::new(ManualClock::new(ts(15, 45, 56)));
        let (tx, _rx) = events::channel(1);
        let cancel = CancellationToken::new();
        let store = Arc::new(LiveCandleStore::new(
            StoreConfig {
                calendar: Calendar::utc(),
                resolutions: vec![Resolution::M1],
            },
            clock,
            tx,
            cancel.clone(),
        ));

        // Opened fills the channel, Updated blocks
        let pending = {
            let store = store.clone();
            tokio::spawn(async move {
                store.add_deal(&make_deal("ETH/BTC", "1", "1", ts(15, 45, 50))).await
            })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert_eq!(pending.await.unwrap().unwrap_err(), StoreError::Cancelled);
    }

    #[tokio::test]
    async fn test_waiting_writer_never_rolls_back_a_newer_bucket() {
        let clock = Arc::new(ManualClock::new(ts(15, 45, 56)));
        let (tx, mut rx) = events::channel(2);
        let store = Arc::new(LiveCandleStore::new(
            StoreConfig {
                calendar: Calendar::utc(),
                resolutions: vec![Resolution::M1],
            },
            clock.clone(),
            tx,
            CancellationToken::new(),
        ));

        // Opened and Updated fill the channel
        store.add_deal(&make_deal("ETH/BTC", "0.019", "1", ts(15, 45, 50))).await.unwrap();

        // refresh takes the lock, rolls to 15:46 and blocks emitting Closed
        clock.set(ts(15, 46, 0));
        let refresh = {
            let store = store.clone();
            tokio::spawn(async move { store.refresh_all().await })
        };
        tokio::task::yield_now().await;

        // a writer whose clock still reads the previous minute queues behind it
        clock.set(ts(15, 45, 59));
        let late = {
            let store = store.clone();
            tokio::spawn(async move {
                store.add_deal(&make_deal("ETH/BTC", "0.5", "1", ts(15, 45, 58))).await
            })
        };
        tokio::task::yield_now().await;

        let mut events = Vec::new();
        for _ in 0..4 {
            events.push(rx.recv().await.unwrap());
        }
        assert_eq!(refresh.await.unwrap().unwrap(), 1);
        let outcome = late.await.unwrap().unwrap();
        assert_eq!(outcome, DealOutcome { applied: 0, skipped: 1 });
        assert!(drain(&mut rx).is_empty());

        let kinds: Vec<&str> = events.iter().map(CandleEvent::kind_label).collect();
        assert_eq!(kinds, vec!["opened", "updated", "closed", "opened"]);
        let open_times: Vec<i64> = events.iter().map(|e| e.candle().open_time).collect();
        assert_eq!(
            open_times,
            vec![ts(15, 45, 0), ts(15, 45, 0), ts(15, 45, 0), ts(15, 46, 0)]
        );

        let live = store.get_candle(&MarketId::new("ETH/BTC"), Resolution::M1).await.unwrap();
        assert_eq!(live.open_time, ts(15, 46, 0));
        assert_eq!(live.close, p("0.019"));
    }

    #[tokio::test]
    async fn test_clock_behind_live_bucket_keeps_it() {
        let (store, clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 46, 10));
        let market = MarketId::new("ETH/BTC");
        store.add_candle(market.clone(), Resolution::M1, None).await.unwrap();
        drain(&mut rx);

        clock.set(ts(15, 45, 30));
        assert_eq!(store.refresh_all().await.unwrap(), 0);
        assert!(!store.add_candle(market.clone(), Resolution::M1, None).await.unwrap());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(
            store.get_candle(&market, Resolution::M1).await.unwrap().open_time,
            ts(15, 46, 0)
        );
    }

    #[tokio::test]
    async fn test_add_candle_rejects_malformed() {
        let (store, _clock, mut rx) = make_store(vec![Resolution::M1], ts(15, 45, 56));
        let market = MarketId::new("ETH/BTC");
        let mut candle = Candle::fresh(market.clone(), Resolution::M1, store.calendar(), ts(15, 45, 56));
        candle.close = p("1");

        let err = store
            .add_candle(market.clone(), Resolution::M1, Some(candle))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidCandle { .. }));
        assert!(store.tracked_pairs().await.is_empty());
        assert!(drain(&mut rx).is_empty());
    }
}
