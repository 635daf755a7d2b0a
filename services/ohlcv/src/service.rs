//! Service wiring
//!
//! ```text
//! deal records ──► DealIngester ──► LiveCandleStore ──► update channel
//!                                        ▲                   │
//!                         minute refresh ┘             microbatch
//!                                                            │
//!                                         merge charts ◄─────┘
//!                                              │
//!                                         Broadcaster
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broadcast::{charts_to_messages, merge_same_chart, Broadcaster};
use crate::config::ServiceConfig;
use crate::events::{self, CandleEvent};
use crate::ingestion::{DealIngester, DedupWindow};
use crate::metrics::ServiceMetrics;
use crate::microbatch::microbatch;
use crate::scheduler::Clock;
use crate::store::{LiveCandleStore, StoreError};

/// Running candle service.
pub struct OhlcvService {
    store: Arc<LiveCandleStore>,
    metrics: Arc<ServiceMetrics>,
    dedup: Arc<DedupWindow>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl OhlcvService {
    /// Build the pipeline, seed the configured pairs and start the
    /// background tasks. All tasks stop when `cancel` fires.
    pub async fn start(
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<dyn Broadcaster>,
        cancel: CancellationToken,
    ) -> Result<Self, StoreError> {
        let metrics = Arc::new(ServiceMetrics::new());
        let (updates_tx, updates_rx) = events::channel(config.emitter_capacity);
        let store = Arc::new(
            LiveCandleStore::new(config.store_config(), clock, updates_tx, cancel.clone())
                .with_metrics(metrics.clone()),
        );

        let batches = microbatch(cancel.clone(), updates_rx, config.batch.clone());
        let broadcast_task = tokio::spawn(broadcast_loop(batches, broadcaster, metrics.clone()));

        // the consumer is already draining, so seeding cannot stall on a
        // small channel
        for market in &config.markets {
            for &resolution in &config.resolutions {
                store.add_candle(market.clone(), resolution, None).await?;
            }
        }
        info!(
            markets = config.markets.len(),
            resolutions = config.resolutions.len(),
            "Seeded live candles"
        );

        let refresh_task = store.clone().spawn();

        Ok(Self {
            store,
            metrics,
            dedup: Arc::new(DedupWindow::new(config.dedup_window)),
            cancel,
            tasks: vec![refresh_task, broadcast_task],
        })
    }

    /// New ingester feeding this service. All ingesters share one dedup
    /// window, so a deal redelivered on another path is folded once.
    pub fn ingester(&self) -> DealIngester {
        DealIngester::new(self.store.clone(), self.metrics.clone(), self.dedup.clone())
    }

    pub fn store(&self) -> &Arc<LiveCandleStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Service task failed");
            }
        }
        info!("OHLCV service stopped");
    }
}

async fn broadcast_loop(
    mut batches: mpsc::Receiver<Vec<CandleEvent>>,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: Arc<ServiceMetrics>,
) {
    while let Some(batch) = batches.recv().await {
        metrics.record_batch_flushed();
        let charts = merge_same_chart(&batch);

        let messages = match charts_to_messages(&charts) {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, batch_size = batch.len(), "Chart encoding failed");
                metrics.record_broadcast_failure();
                continue;
            }
        };

        let count = messages.len() as u64;
        let started = Instant::now();
        match broadcaster.batch_publish(messages).await {
            Ok(()) => {
                let latency_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
                metrics.record_broadcast(count, latency_ns);
            }
            Err(e) => {
                warn!(error = %e, message_count = count, "Chart broadcast failed");
                metrics.record_broadcast_failure();
            }
        }
    }
}
