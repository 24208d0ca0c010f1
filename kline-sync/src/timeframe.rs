//! Candle timeframes and grid alignment.
//!
//! Every timeframe defines a regular grid of open times. Grids are anchored
//! at the Unix epoch, except weekly candles which exchanges open on Monday
//! 00:00 UTC.

use crate::errors::SyncError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 1970-01-05T00:00:00Z, the first Monday after the epoch.
const WEEK_ORIGIN_MS: i64 = 4 * 86_400_000;

/// Supported candle bucket durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 13] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::W1,
    ];

    /// Canonical short name, also the Binance interval string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// Bucket length in milliseconds.
    pub fn step_millis(&self) -> i64 {
        const MIN: i64 = 60_000;
        match self {
            Timeframe::M1 => MIN,
            Timeframe::M3 => 3 * MIN,
            Timeframe::M5 => 5 * MIN,
            Timeframe::M15 => 15 * MIN,
            Timeframe::M30 => 30 * MIN,
            Timeframe::H1 => 60 * MIN,
            Timeframe::H2 => 120 * MIN,
            Timeframe::H4 => 240 * MIN,
            Timeframe::H6 => 360 * MIN,
            Timeframe::H8 => 480 * MIN,
            Timeframe::H12 => 720 * MIN,
            Timeframe::D1 => 1_440 * MIN,
            Timeframe::W1 => 10_080 * MIN,
        }
    }

    /// Bucket length.
    pub fn step(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.step_millis())
    }

    fn origin_millis(&self) -> i64 {
        match self {
            Timeframe::W1 => WEEK_ORIGIN_MS,
            _ => 0,
        }
    }

    /// Largest grid point `<= ts`.
    pub fn align_down(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let sub_ms_nanos = i64::from(ts.timestamp_subsec_nanos() % 1_000_000);
        let truncated = ts - ChronoDuration::nanoseconds(sub_ms_nanos);
        let rem = (truncated.timestamp_millis() - self.origin_millis()).rem_euclid(self.step_millis());
        truncated - ChronoDuration::milliseconds(rem)
    }

    /// Smallest grid point `>= ts`.
    pub fn align_up(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let down = self.align_down(ts);
        if down == ts {
            down
        } else {
            down + self.step()
        }
    }

    /// Whether `ts` lies exactly on the grid.
    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        self.align_down(ts) == ts
    }

    /// Number of grid points in `[from, to)`, both assumed aligned.
    pub fn points_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        if to <= from {
            return 0;
        }
        (to - from).num_milliseconds() / self.step_millis()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim();
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == normalized)
            .ok_or_else(|| SyncError::config(format!("Unsupported timeframe: {:?}", s)))
    }
}

impl TryFrom<String> for Timeframe {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}
