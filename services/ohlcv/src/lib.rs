//! OHLCV Live Candle Service
//!
//! Consumes executed deals and maintains the live OHLCV candle of every
//! (market, resolution) pair, publishing each state transition:
//! - Exact decimal folding of open/high/low/close/volume
//! - Epoch-aligned fixed resolutions and calendar-month buckets
//! - Minute-aligned rollover of idle pairs into flat candles
//! - Size/idle microbatching of updates into chart broadcasts
//!
//! # Architecture
//!
//! ```text
//!   Deal feed
//!       │
//!   ┌───▼───┐
//!   │Ingest │  ← Decodes, filters, dedupes deals
//!   └───┬───┘
//!       │
//! ┌─────▼─────┐      ┌─────────┐
//! │Live store │ ◄─── │Scheduler│  minute refresh
//! └─────┬─────┘      └─────────┘
//!       │ CandleEvent
//! ┌─────▼─────┐
//! │Microbatch │
//! └─────┬─────┘
//!       │
//! ┌─────▼─────────────┐
//! │ Chart broadcast   │
//! └───────────────────┘
//! ```

pub mod broadcast;
pub mod candles;
pub mod config;
pub mod events;
pub mod ingestion;
pub mod metrics;
pub mod microbatch;
pub mod resolution;
pub mod scheduler;
pub mod service;
pub mod store;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
