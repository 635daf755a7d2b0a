//! Error types shared across the candle pipeline
//!
//! Comprehensive error taxonomy using thiserror

use thiserror::Error;

/// Decimal parsing and arithmetic errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecimalError {
    #[error("malformed decimal {input:?}: {reason}")]
    Parse { input: String, reason: String },

    #[error("negative value not allowed: {input:?}")]
    Negative { input: String },

    #[error("decimal overflow adding {lhs} and {rhs}")]
    Overflow { lhs: String, rhs: String },
}

/// Deal validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DealError {
    #[error("deal id is empty")]
    EmptyId,

    #[error("market is empty for deal {deal_id}")]
    EmptyMarket { deal_id: String },

    #[error("invalid price for deal {deal_id}: {source}")]
    InvalidPrice {
        deal_id: String,
        #[source]
        source: DecimalError,
    },

    #[error("invalid amount for deal {deal_id}: {source}")]
    InvalidAmount {
        deal_id: String,
        #[source]
        source: DecimalError,
    },
}
