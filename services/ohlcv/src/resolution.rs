//! Candle resolutions and the bucket calendar
//!
//! Fixed-duration resolutions are aligned to multiples of their duration
//! counted from the Unix epoch, so they ignore DST and time zones entirely.
//! The monthly resolution follows the calendar month of a configurable
//! reference zone.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, FixedOffset, Local, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const NANOS_PER_MINUTE: i64 = 60 * 1_000_000_000;
const NANOS_PER_HOUR: i64 = 60 * NANOS_PER_MINUTE;
const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;

/// Error for identifiers outside the supported resolution set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported resolution {0:?}")]
pub struct UnsupportedResolution(pub String);

/// Supported candle resolutions, in declaration (iteration) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum Resolution {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
    /// Calendar month in the reference zone
    Month1,
}

impl Resolution {
    pub const ALL: [Resolution; 12] = [
        Resolution::M1,
        Resolution::M3,
        Resolution::M5,
        Resolution::M15,
        Resolution::M30,
        Resolution::H1,
        Resolution::H2,
        Resolution::H4,
        Resolution::H6,
        Resolution::H12,
        Resolution::D1,
        Resolution::Month1,
    ];

    /// Canonical identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::M1 => "1m",
            Resolution::M3 => "3m",
            Resolution::M5 => "5m",
            Resolution::M15 => "15m",
            Resolution::M30 => "30m",
            Resolution::H1 => "1h",
            Resolution::H2 => "2h",
            Resolution::H4 => "4h",
            Resolution::H6 => "6h",
            Resolution::H12 => "12h",
            Resolution::D1 => "1d",
            Resolution::Month1 => "1mo",
        }
    }

    /// Bucket length in nanoseconds, `None` for calendar months.
    pub fn fixed_duration_nanos(&self) -> Option<i64> {
        match self {
            Resolution::M1 => Some(NANOS_PER_MINUTE),
            Resolution::M3 => Some(3 * NANOS_PER_MINUTE),
            Resolution::M5 => Some(5 * NANOS_PER_MINUTE),
            Resolution::M15 => Some(15 * NANOS_PER_MINUTE),
            Resolution::M30 => Some(30 * NANOS_PER_MINUTE),
            Resolution::H1 => Some(NANOS_PER_HOUR),
            Resolution::H2 => Some(2 * NANOS_PER_HOUR),
            Resolution::H4 => Some(4 * NANOS_PER_HOUR),
            Resolution::H6 => Some(6 * NANOS_PER_HOUR),
            Resolution::H12 => Some(12 * NANOS_PER_HOUR),
            Resolution::D1 => Some(NANOS_PER_DAY),
            Resolution::Month1 => None,
        }
    }
}

impl FromStr for Resolution {
    type Err = UnsupportedResolution;

    /// Accepts canonical names and both legacy identifier families
    /// (`1,3,5,15,30,1H,2H,4H,6H,12H,1D,1MH` and `1m..1d,1mh`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let resolution = match s {
            "1m" | "1" => Resolution::M1,
            "3m" | "3" => Resolution::M3,
            "5m" | "5" => Resolution::M5,
            "15m" | "15" => Resolution::M15,
            "30m" | "30" => Resolution::M30,
            "1h" | "1H" => Resolution::H1,
            "2h" | "2H" => Resolution::H2,
            "4h" | "4H" => Resolution::H4,
            "6h" | "6H" => Resolution::H6,
            "12h" | "12H" => Resolution::H12,
            "1d" | "1D" => Resolution::D1,
            "1mo" | "1mh" | "1MH" => Resolution::Month1,
            other => return Err(UnsupportedResolution(other.to_string())),
        };
        Ok(resolution)
    }
}

impl TryFrom<String> for Resolution {
    type Error = UnsupportedResolution;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for &'static str {
    fn from(r: Resolution) -> Self {
        r.as_str()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a comma separated resolution list, splitting the supported
/// entries from the rejected ones.
pub fn parse_list(input: &str) -> (Vec<Resolution>, Vec<UnsupportedResolution>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for item in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.parse::<Resolution>() {
            Ok(r) if !accepted.contains(&r) => accepted.push(r),
            Ok(_) => {}
            Err(e) => rejected.push(e),
        }
    }
    accepted.sort();
    (accepted, rejected)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid reference timezone {0:?}, expected local, utc or +HH:MM")]
pub struct InvalidReferenceZone(pub String);

/// Zone whose calendar defines monthly buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceZone {
    Utc,
    Fixed(FixedOffset),
    /// Host zone, DST-aware through the system database
    #[default]
    Local,
}

impl FromStr for ReferenceZone {
    type Err = InvalidReferenceZone;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "local" => return Ok(ReferenceZone::Local),
            "utc" | "z" => return Ok(ReferenceZone::Utc),
            _ => {}
        }

        let invalid = || InvalidReferenceZone(s.to_string());
        let (sign, rest) = match trimmed.as_bytes().first() {
            Some(b'+') => (1, &trimmed[1..]),
            Some(b'-') => (-1, &trimmed[1..]),
            _ => return Err(invalid()),
        };
        let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
        if hours.len() != 2 || minutes.len() != 2 {
            return Err(invalid());
        }
        let hours: i32 = hours.parse().map_err(|_| invalid())?;
        let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
        if minutes >= 60 {
            return Err(invalid());
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(ReferenceZone::Fixed)
            .ok_or_else(invalid)
    }
}

impl fmt::Display for ReferenceZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceZone::Utc => f.write_str("utc"),
            ReferenceZone::Fixed(offset) => write!(f, "{}", offset),
            ReferenceZone::Local => f.write_str("local"),
        }
    }
}

/// Maps instants to candle buckets.
///
/// All instants are Unix nanoseconds. Buckets are half-open:
/// `[bucket_start, bucket_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calendar {
    zone: ReferenceZone,
}

impl Calendar {
    pub fn new(zone: ReferenceZone) -> Self {
        Self { zone }
    }

    pub fn utc() -> Self {
        Self::new(ReferenceZone::Utc)
    }

    pub fn zone(&self) -> ReferenceZone {
        self.zone
    }

    /// Start of the bucket containing `ts_nanos`.
    pub fn bucket_start(&self, resolution: Resolution, ts_nanos: i64) -> i64 {
        match resolution.fixed_duration_nanos() {
            Some(duration) => ts_nanos.saturating_sub(ts_nanos.rem_euclid(duration)),
            None => self.month_start(ts_nanos),
        }
    }

    /// End (exclusive) of the bucket beginning at `bucket_start`.
    pub fn bucket_end(&self, resolution: Resolution, bucket_start: i64) -> i64 {
        match resolution.fixed_duration_nanos() {
            Some(duration) => bucket_start.saturating_add(duration),
            None => self.next_month_start(bucket_start),
        }
    }

    /// Saturates to `i64::MIN` when the month begins before the
    /// representable range.
    fn month_start(&self, ts_nanos: i64) -> i64 {
        let start = match self.zone {
            ReferenceZone::Utc => month_start_in(&Utc, ts_nanos, 0),
            ReferenceZone::Fixed(offset) => month_start_in(&offset, ts_nanos, 0),
            ReferenceZone::Local => month_start_in(&Local, ts_nanos, 0),
        };
        start.unwrap_or(i64::MIN)
    }

    /// Saturates to `i64::MAX` when the next month begins after the
    /// representable range.
    fn next_month_start(&self, ts_nanos: i64) -> i64 {
        let end = match self.zone {
            ReferenceZone::Utc => month_start_in(&Utc, ts_nanos, 1),
            ReferenceZone::Fixed(offset) => month_start_in(&offset, ts_nanos, 1),
            ReferenceZone::Local => month_start_in(&Local, ts_nanos, 1),
        };
        end.unwrap_or(i64::MAX)
    }
}

/// First instant of the month containing `ts_nanos`, shifted by
/// `months_ahead` calendar months.
fn month_start_in<Tz: TimeZone>(tz: &Tz, ts_nanos: i64, months_ahead: u32) -> Option<i64> {
    let local = tz.timestamp_nanos(ts_nanos);
    let mut year = local.year();
    let mut month = local.month() + months_ahead;
    if month > 12 {
        year += 1;
        month -= 12;
    }
    first_instant_of_month(tz, year, month)
}

/// Local midnight on the 1st, or the earliest valid hour of that day when
/// midnight falls into a DST gap.
fn first_instant_of_month<Tz: TimeZone>(tz: &Tz, year: i32, month: u32) -> Option<i64> {
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    (0..24).find_map(|hour| {
        let naive = date.and_hms_opt(hour, 0, 0)?;
        tz.from_local_datetime(&naive)
            .earliest()
            .and_then(|dt| dt.timestamp_nanos_opt())
    })
}
