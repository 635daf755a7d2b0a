//! Executed trade ("deal") types
//!
//! [`DealRecord`] is the raw shape delivered by the matcher feed, with
//! prices and amounts still in string form. [`Deal`] is the validated,
//! immutable value the candle store folds.

use serde::{Deserialize, Serialize};

use crate::errors::DealError;
use crate::ids::{DealId, MarketId};
use crate::numeric::{Price, Quantity};

/// Trade side from the taker's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Deal as received from the feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealRecord {
    pub id: String,
    pub market: String,
    pub price: String,
    pub amount: String,
    /// Unix nanos
    pub created_at: i64,
    #[serde(default)]
    pub taker_order_id: String,
    #[serde(default)]
    pub maker_order_id: String,
    #[serde(default)]
    pub is_buyer_maker: bool,
}

impl DealRecord {
    /// Records missing either order id are not real executions and are
    /// dropped before aggregation.
    pub fn has_order_ids(&self) -> bool {
        !self.taker_order_id.is_empty() && !self.maker_order_id.is_empty()
    }
}

/// Validated deal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub market: MarketId,
    pub price: Price,
    pub amount: Quantity,
    /// Unix nanos
    pub created_at: i64,
    pub taker_order_id: String,
    pub maker_order_id: String,
    pub is_buyer_maker: bool,
}

impl Deal {
    /// Side that initiated the trade (the taker).
    pub fn taker_side(&self) -> Side {
        if self.is_buyer_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

impl TryFrom<&DealRecord> for Deal {
    type Error = DealError;

    fn try_from(record: &DealRecord) -> Result<Self, Self::Error> {
        let id = DealId::try_new(record.id.clone()).ok_or(DealError::EmptyId)?;
        let market = MarketId::try_new(record.market.clone()).ok_or_else(|| {
            DealError::EmptyMarket {
                deal_id: record.id.clone(),
            }
        })?;
        let price = record
            .price
            .parse::<Price>()
            .map_err(|source| DealError::InvalidPrice {
                deal_id: record.id.clone(),
                source,
            })?;
        let amount = record
            .amount
            .parse::<Quantity>()
            .map_err(|source| DealError::InvalidAmount {
                deal_id: record.id.clone(),
                source,
            })?;

        Ok(Self {
            id,
            market,
            price,
            amount,
            created_at: record.created_at,
            taker_order_id: record.taker_order_id.clone(),
            maker_order_id: record.maker_order_id.clone(),
            is_buyer_maker: record.is_buyer_maker,
        })
    }
}

impl TryFrom<DealRecord> for Deal {
    type Error = DealError;

    fn try_from(record: DealRecord) -> Result<Self, Self::Error> {
        Deal::try_from(&record)
    }
}
