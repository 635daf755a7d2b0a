//! OHLCV candle value type
//!
//! A candle covers the half-open interval `[open_time, close_time)` of one
//! (market, resolution) pair. Prices are `None` until a price is known:
//! a bucket with no trades and no previous close has nothing to report.
//!
//! Candles are plain values. Folding a deal produces a new candle and never
//! mutates the receiver, so callers can compute every update before
//! committing any of them.

use serde::{Deserialize, Serialize};
use types::errors::DecimalError;
use types::ids::MarketId;
use types::numeric::{Price, Quantity};

use crate::resolution::{Calendar, Resolution};

/// A single OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub market: MarketId,
    pub resolution: Resolution,
    /// Bucket start, inclusive (Unix nanos)
    pub open_time: i64,
    /// Bucket end, exclusive (Unix nanos)
    pub close_time: i64,
    pub open: Option<Price>,
    pub high: Option<Price>,
    pub low: Option<Price>,
    pub close: Option<Price>,
    pub volume: Quantity,
}

impl Candle {
    /// Empty candle for the bucket containing `now`.
    pub fn fresh(market: MarketId, resolution: Resolution, calendar: &Calendar, now: i64) -> Self {
        let open_time = calendar.bucket_start(resolution, now);
        Self {
            market,
            resolution,
            open_time,
            close_time: calendar.bucket_end(resolution, open_time),
            open: None,
            high: None,
            low: None,
            close: None,
            volume: Quantity::zero(),
        }
    }

    /// Flat (no-trade) successor for the bucket containing `now`.
    ///
    /// All four prices carry the previous close and volume restarts at zero.
    pub fn flat_after(previous: &Candle, calendar: &Calendar, now: i64) -> Self {
        let mut next = Self::fresh(previous.market.clone(), previous.resolution, calendar, now);
        next.open = previous.close;
        next.high = previous.close;
        next.low = previous.close;
        next.close = previous.close;
        next
    }

    /// Whether `ts` falls inside this bucket.
    pub fn contains(&self, ts: i64) -> bool {
        self.open_time <= ts && ts < self.close_time
    }

    /// Whether the bucket is over at `now`. A candle whose bucket starts
    /// after `now` has not ended.
    pub fn has_ended(&self, now: i64) -> bool {
        now >= self.close_time
    }

    /// Fold one trade into the candle.
    ///
    /// The first trade of a bucket (volume exactly zero) sets the open. High
    /// and low use the candle comparison contract of
    /// [`types::numeric::compare`]. Volume is summed exactly; an overflow
    /// leaves `self` untouched.
    pub fn fold(&self, price: Price, amount: Quantity) -> Result<Candle, DecimalError> {
        let volume = self.volume.checked_add(&amount)?;

        let mut next = self.clone();
        if self.volume.is_zero() {
            next.open = Some(price);
        }
        next.close = Some(price);
        next.high = match self.high {
            Some(high) if price.compare(&high) <= 0 => Some(high),
            _ => Some(price),
        };
        next.low = match self.low {
            Some(low) if price.compare(&low) >= 0 => Some(low),
            _ => Some(price),
        };
        next.volume = volume;
        Ok(next)
    }

    /// Structural integrity: a well-formed interval and either no prices
    /// at all or all four of them.
    pub fn is_valid(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        let set = prices.iter().filter(|p| p.is_some()).count();
        self.close_time > self.open_time && (set == 0 || set == prices.len())
    }
}
