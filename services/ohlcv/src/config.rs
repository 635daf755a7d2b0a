//! Service configuration loaded from environment variables.
//!
//! Every setting has a default; only non-empty variables override it:
//! - `OHLCV_MARKETS`: comma separated markets seeded at startup
//! - `OHLCV_RESOLUTIONS`: comma separated resolutions (unsupported entries
//!   are logged and skipped)
//! - `OHLCV_EMITTER_CAPACITY`: update channel capacity
//! - `OHLCV_MAX_BATCH_SIZE`, `OHLCV_BATCH_IDLE_MS`: microbatching
//! - `OHLCV_REFERENCE_TZ`: `local`, `utc` or `±HH:MM`, for monthly buckets
//! - `OHLCV_DEDUP_WINDOW`: deal ids remembered for dedup

use std::time::Duration;

use tracing::warn;
use types::ids::MarketId;

use crate::ingestion::DEFAULT_DEDUP_WINDOW;
use crate::microbatch::BatchConfig;
use crate::resolution::{self, Calendar, ReferenceZone, Resolution};
use crate::store::StoreConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("{name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Markets seeded with flat candles at startup. Others are tracked
    /// lazily on their first deal.
    pub markets: Vec<MarketId>,
    pub resolutions: Vec<Resolution>,
    pub emitter_capacity: usize,
    pub batch: BatchConfig,
    pub reference_zone: ReferenceZone,
    /// Deal ids remembered across all ingesters of the service.
    pub dedup_window: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            markets: Vec::new(),
            resolutions: Resolution::ALL.to_vec(),
            emitter_capacity: 1024,
            batch: BatchConfig::default(),
            reference_zone: ReferenceZone::Local,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl ServiceConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(non_empty_var)
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(markets) = lookup("OHLCV_MARKETS") {
            config.markets = markets
                .split(',')
                .filter_map(|m| MarketId::try_new(m.trim()))
                .collect();
        }

        if let Some(list) = lookup("OHLCV_RESOLUTIONS") {
            let (accepted, rejected) = resolution::parse_list(&list);
            for err in &rejected {
                warn!(error = %err, "Skipping configured resolution");
            }
            if accepted.is_empty() {
                return Err(ConfigError::InvalidValue {
                    name: "OHLCV_RESOLUTIONS",
                    reason: format!("no supported resolution in {:?}", list),
                });
            }
            config.resolutions = accepted;
        }

        if let Some(v) = lookup("OHLCV_EMITTER_CAPACITY") {
            config.emitter_capacity = positive("OHLCV_EMITTER_CAPACITY", &v)? as usize;
        }
        if let Some(v) = lookup("OHLCV_MAX_BATCH_SIZE") {
            config.batch.max_batch_size = positive("OHLCV_MAX_BATCH_SIZE", &v)? as usize;
        }
        if let Some(v) = lookup("OHLCV_BATCH_IDLE_MS") {
            config.batch.idle_timeout = Duration::from_millis(positive("OHLCV_BATCH_IDLE_MS", &v)?);
        }
        if let Some(v) = lookup("OHLCV_REFERENCE_TZ") {
            config.reference_zone = v.parse().map_err(|e: resolution::InvalidReferenceZone| {
                ConfigError::InvalidValue {
                    name: "OHLCV_REFERENCE_TZ",
                    reason: e.to_string(),
                }
            })?;
        }
        if let Some(v) = lookup("OHLCV_DEDUP_WINDOW") {
            config.dedup_window = v.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                name: "OHLCV_DEDUP_WINDOW",
                value: v.clone(),
            })?;
        }

        Ok(config)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            calendar: Calendar::new(self.reference_zone),
            resolutions: self.resolutions.clone(),
        }
    }
}

fn positive(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            name,
            value: value.to_string(),
        }),
    }
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}
