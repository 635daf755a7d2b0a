//! Types library for the OHLCV candle service
//!
//! Core value types shared by the aggregation engine and its feeds:
//! exact decimals, identifiers, validated deals and their error taxonomy.
//!
//! # Modules
//! - `ids`: Market and deal identifiers
//! - `numeric`: Exact decimal comparator/adder, Price and Quantity
//! - `deal`: Raw and validated deal records
//! - `errors`: Error taxonomy

pub mod ids;
pub mod numeric;
pub mod deal;
pub mod errors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::deal::*;
    pub use crate::errors::*;
}
