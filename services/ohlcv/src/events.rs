//! Candle update events
//!
//! Every state transition of the live store is published as a
//! [`CandleEvent`] on one bounded channel shared by all pairs. Events carry
//! copies; the store keeps ownership of its state.
//!
//! Consumers receive events at least once and can deduplicate by
//! (market, resolution, open_time, is_final).

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::candles::Candle;

/// A candle state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "candle")]
pub enum CandleEvent {
    /// A bucket became live for its pair.
    Opened(Candle),
    /// A live bucket changed.
    Updated(Candle),
    /// Final snapshot of a bucket that has ended.
    Closed(Candle),
}

impl CandleEvent {
    pub fn candle(&self) -> &Candle {
        match self {
            CandleEvent::Opened(c) | CandleEvent::Updated(c) | CandleEvent::Closed(c) => c,
        }
    }

    pub fn into_candle(self) -> Candle {
        match self {
            CandleEvent::Opened(c) | CandleEvent::Updated(c) | CandleEvent::Closed(c) => c,
        }
    }

    /// Whether this is the final snapshot of its bucket.
    pub fn is_final(&self) -> bool {
        matches!(self, CandleEvent::Closed(_))
    }

    /// Label for logging.
    pub fn kind_label(&self) -> &'static str {
        match self {
            CandleEvent::Opened(_) => "opened",
            CandleEvent::Updated(_) => "updated",
            CandleEvent::Closed(_) => "closed",
        }
    }
}

/// Create the bounded update channel.
pub fn channel(capacity: usize) -> (mpsc::Sender<CandleEvent>, mpsc::Receiver<CandleEvent>) {
    mpsc::channel(capacity.max(1))
}
