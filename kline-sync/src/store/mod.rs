//! Persistence contract for symbols and candles.
//!
//! The pipeline only talks to [`CandleStore`]; [`PostgresStore`] backs
//! production runs and [`MemoryStore`] backs dry runs and tests. Both apply
//! the same merge rule, see [`merge_candle`].

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::errors::Result;
use crate::models::{Candle, PairKey, Provenance, Symbol};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert or update symbols keyed by (exchange, symbol). Returns rows written.
    async fn upsert_symbols(&self, symbols: &[Symbol]) -> Result<usize>;

    /// All stored symbols of `exchange`, active or not.
    async fn list_symbols(&self, exchange: &str) -> Result<Vec<Symbol>>;

    /// Upsert one batch atomically: either every candle is applied or none.
    /// Returns the number of rows inserted or changed.
    async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize>;

    /// Open times of `pair` in `[from, to)`, ascending.
    async fn query_candle_timestamps(
        &self,
        pair: &PairKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// Most recent candle of `pair`.
    async fn latest_candle(&self, pair: &PairKey) -> Result<Option<Candle>>;

    /// Latest candle of `pair` that came from the exchange, ignoring
    /// synthesized rows.
    async fn latest_fetched_candle(&self, pair: &PairKey) -> Result<Option<Candle>>;

    /// Most recent candle of `pair` strictly before `ts`.
    async fn candle_before(&self, pair: &PairKey, ts: DateTime<Utc>) -> Result<Option<Candle>>;

    /// Cheap connectivity check.
    async fn ping(&self) -> bool {
        true
    }
}

/// Resolve an incoming candle against the stored row with the same key.
///
/// Returns the row to store, or `None` when the stored row stays as is:
/// either a synthesized candle would replace a fetched one, or nothing
/// changed. Optional fields of a fetched row are only overwritten by present
/// values; a synthesized row is replaced wholesale.
pub fn merge_candle(existing: Option<&Candle>, incoming: &Candle) -> Option<Candle> {
    let Some(existing) = existing else {
        return Some(incoming.clone());
    };

    if existing.provenance == Provenance::Fetched && incoming.provenance == Provenance::Synthesized {
        return None;
    }

    let mut merged = incoming.clone();
    if existing.provenance == Provenance::Fetched {
        merged.trades = incoming.trades.or(existing.trades);
        merged.quote_volume = incoming.quote_volume.or(existing.quote_volume);
    }

    if &merged == existing {
        None
    } else {
        Some(merged)
    }
}
