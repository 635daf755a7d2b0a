//! Chart payloads and the broadcast seam
//!
//! A batch of candle events is merged into one [`Chart`] per
//! (market, resolution), serialized, and handed to a [`Broadcaster`] as
//! channel messages. The chart wire shape uses parallel arrays:
//!
//! ```text
//! {"o":["0.019"],"h":["0.019"],"l":["0.013"],"c":["0.013"],"v":["16.8"],"t":[1586879100]}
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};
use types::ids::MarketId;
use types::numeric::{Price, Quantity};

use crate::candles::Candle;
use crate::events::CandleEvent;
use crate::resolution::Resolution;

/// Prefix shared by all chart channels.
pub const CHART_CHANNEL_PREFIX: &str = "candle_chart";

/// Errors raised while publishing charts.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("chart serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Channel carrying charts of one (market, resolution).
pub fn channel_name(market: &MarketId, resolution: Resolution) -> String {
    format!("{}_{}_{}", CHART_CHANNEL_PREFIX, market, resolution)
}

/// Candle points of one pair, as parallel arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chart {
    #[serde(skip_serializing)]
    pub market: MarketId,
    #[serde(skip_serializing)]
    pub resolution: Resolution,
    pub o: Vec<Option<Price>>,
    pub h: Vec<Option<Price>>,
    pub l: Vec<Option<Price>>,
    pub c: Vec<Option<Price>>,
    pub v: Vec<Quantity>,
    /// Open time in Unix seconds
    pub t: Vec<i64>,
}

impl Chart {
    pub fn from_candle(candle: &Candle) -> Self {
        let mut chart = Self {
            market: candle.market.clone(),
            resolution: candle.resolution,
            o: Vec::new(),
            h: Vec::new(),
            l: Vec::new(),
            c: Vec::new(),
            v: Vec::new(),
            t: Vec::new(),
        };
        chart.push(candle);
        chart
    }

    pub fn push(&mut self, candle: &Candle) {
        self.o.push(candle.open);
        self.h.push(candle.high);
        self.l.push(candle.low);
        self.c.push(candle.close);
        self.v.push(candle.volume);
        self.t.push(candle.open_time.div_euclid(1_000_000_000));
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn channel(&self) -> String {
        channel_name(&self.market, self.resolution)
    }
}

/// Merge a batch into one chart per (market, resolution).
///
/// Charts appear in order of first appearance in the batch; points keep
/// their batch order within a chart.
pub fn merge_same_chart(batch: &[CandleEvent]) -> Vec<Chart> {
    let mut charts: Vec<Chart> = Vec::new();
    let mut index: BTreeMap<(MarketId, Resolution), usize> = BTreeMap::new();

    for event in batch {
        let candle = event.candle();
        let key = (candle.market.clone(), candle.resolution);
        match index.get(&key) {
            Some(&i) => charts[i].push(candle),
            None => {
                index.insert(key, charts.len());
                charts.push(Chart::from_candle(candle));
            }
        }
    }

    charts
}

/// One message for the fan-out transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelMessage {
    pub channel: String,
    /// JSON encoded chart
    pub data: String,
}

/// Serialize charts into channel messages.
pub fn charts_to_messages(charts: &[Chart]) -> Result<Vec<ChannelMessage>, BroadcastError> {
    charts
        .iter()
        .map(|chart| {
            Ok(ChannelMessage {
                channel: chart.channel(),
                data: serde_json::to_string(chart)?,
            })
        })
        .collect()
}

/// Fan-out transport for chart messages.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn batch_publish(&self, messages: Vec<ChannelMessage>) -> Result<(), BroadcastError>;
}

/// Broadcaster that only logs what it would publish.
#[derive(Debug, Default)]
pub struct TracingBroadcaster;

#[async_trait]
impl Broadcaster for TracingBroadcaster {
    async fn batch_publish(&self, messages: Vec<ChannelMessage>) -> Result<(), BroadcastError> {
        for message in &messages {
            debug!(channel = %message.channel, data = %message.data, "Chart message");
        }
        info!(message_count = messages.len(), "Published chart batch");
        Ok(())
    }
}
