//! Domain records shared by the exchange clients, the stores and the pipeline.

use crate::timeframe::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A tradable market as listed by an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    /// Exchange identifier (e.g. "binance")
    pub exchange: String,
    /// Exchange-native ticker (e.g. "BTCUSDT")
    pub symbol: String,
    /// Base asset (e.g. "BTC")
    pub base: String,
    /// Quote asset (e.g. "USDT")
    pub quote: String,
    /// Whether the market is currently tradable
    pub active: bool,
    /// Listing time, when the exchange reports one
    pub listed_at: Option<DateTime<Utc>>,
}

impl Symbol {
    /// Copy of this symbol with `active = false`.
    pub fn deactivated(&self) -> Self {
        Self {
            active: false,
            ..self.clone()
        }
    }
}

/// Where a candle came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Returned by the exchange
    Fetched,
    /// Flat continuity row created by the forward filler
    Synthesized,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Fetched => "fetched",
            Provenance::Synthesized => "synthesized",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fetched" => Some(Provenance::Fetched),
            "synthesized" => Some(Provenance::Synthesized),
            _ => None,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one (exchange, symbol, timeframe) series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl PairKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.exchange, self.symbol, self.timeframe)
    }
}

/// One OHLCV record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Bucket open time, on the timeframe grid
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Base asset volume
    pub volume: f64,
    /// Number of trades, when the exchange reports it
    pub trades: Option<i64>,
    /// Quote asset volume, when the exchange reports it
    pub quote_volume: Option<f64>,
    pub provenance: Provenance,
}

impl Candle {
    /// Flat, zero-volume continuity candle carrying `previous.close` forward.
    pub fn synthesized(previous: &Candle, open_time: DateTime<Utc>) -> Self {
        let price = previous.close;
        Self {
            exchange: previous.exchange.clone(),
            symbol: previous.symbol.clone(),
            timeframe: previous.timeframe,
            open_time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            trades: Some(0),
            quote_volume: Some(0.0),
            provenance: Provenance::Synthesized,
        }
    }

    pub fn pair(&self) -> PairKey {
        PairKey::new(self.exchange.clone(), self.symbol.clone(), self.timeframe)
    }

    pub fn belongs_to(&self, pair: &PairKey) -> bool {
        self.exchange == pair.exchange && self.symbol == pair.symbol && self.timeframe == pair.timeframe
    }

    /// Reason this candle cannot be stored, if any.
    pub fn validation_error(&self) -> Option<String> {
        let prices = [self.open, self.high, self.low, self.close, self.volume];
        if prices.iter().any(|v| !v.is_finite()) {
            return Some(format!("non-finite value in {} at {}", self.pair(), self.open_time));
        }
        if self.volume < 0.0 {
            return Some(format!("negative volume in {} at {}", self.pair(), self.open_time));
        }
        if !self.timeframe.is_aligned(self.open_time) {
            return Some(format!(
                "open time {} is not on the {} grid for {}",
                self.open_time,
                self.timeframe,
                self.pair()
            ));
        }
        None
    }
}

/// A missing half-open range `[from, to)` on a pair's grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl Gap {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Number of missing candles in this gap.
    pub fn candles_missing(&self, timeframe: Timeframe) -> i64 {
        timeframe.points_between(self.from, self.to)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts < self.to
    }
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}
