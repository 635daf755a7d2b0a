//! Size/idle microbatching
//!
//! Coalesces a stream of items into bounded batches for the broadcast
//! fan-out. A batch is flushed when it reaches `max_batch_size`, or when no
//! new item arrives within `idle_timeout` of the last one.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for the microbatcher.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of items per batch.
    pub max_batch_size: usize,
    /// Flush a partial batch after this long without a new item.
    pub idle_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            idle_timeout: Duration::from_secs(2),
        }
    }
}

/// Spawn a batching task reading from `input`.
///
/// Only non-empty batches are produced. When `input` closes the in-flight
/// partial batch is flushed and the output closes. On cancellation the task
/// stops without flushing.
pub fn microbatch<T: Send + 'static>(
    cancel: CancellationToken,
    mut input: mpsc::Receiver<T>,
    config: BatchConfig,
) -> mpsc::Receiver<Vec<T>> {
    let (tx, rx) = mpsc::channel(1);
    let max = config.max_batch_size.max(1);

    tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                item = input.recv() => item,
            };
            let Some(first) = first else {
                return;
            };

            let mut batch = Vec::with_capacity(max);
            batch.push(first);
            let mut upstream_closed = false;

            while batch.len() < max {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    next = tokio::time::timeout(config.idle_timeout, input.recv()) => match next {
                        Ok(Some(item)) => batch.push(item),
                        Ok(None) => {
                            upstream_closed = true;
                            break;
                        }
                        Err(_) => break,
                    },
                }
            }

            debug!(size = batch.len(), upstream_closed, "Flushing batch");
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = tx.send(batch) => sent,
            };
            if sent.is_err() || upstream_closed {
                return;
            }
        }
    });

    rx
}
