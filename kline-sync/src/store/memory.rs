//! In-process store used for `--store memory` dry runs and in tests.

use super::{merge_candle, CandleStore};
use crate::errors::{Result, SyncError};
use crate::models::{Candle, PairKey, Provenance, Symbol};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

type Series = BTreeMap<DateTime<Utc>, Candle>;

/// Symbols and candles held in ordered maps behind one lock each.
#[derive(Default)]
pub struct MemoryStore {
    symbols: RwLock<BTreeMap<(String, String), Symbol>>,
    candles: RwLock<BTreeMap<PairKey, Series>>,
    /// Rows inserted or changed across all candle batches
    candle_writes: AtomicU64,
    /// Symbol rows written
    symbol_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the stored series of `pair`, ascending.
    pub fn candles(&self, pair: &PairKey) -> Vec<Candle> {
        self.candles
            .read()
            .get(pair)
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total stored candles across all pairs.
    pub fn candle_count(&self) -> usize {
        self.candles.read().values().map(BTreeMap::len).sum()
    }

    pub fn candle_writes(&self) -> u64 {
        self.candle_writes.load(Ordering::Relaxed)
    }

    pub fn symbol_writes(&self) -> u64 {
        self.symbol_writes.load(Ordering::Relaxed)
    }

    /// Copy of every stored symbol, ordered by (exchange, symbol).
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.read().values().cloned().collect()
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn upsert_symbols(&self, symbols: &[Symbol]) -> Result<usize> {
        let mut stored = self.symbols.write();
        for symbol in symbols {
            stored.insert((symbol.exchange.clone(), symbol.symbol.clone()), symbol.clone());
        }
        self.symbol_writes.fetch_add(symbols.len() as u64, Ordering::Relaxed);
        Ok(symbols.len())
    }

    async fn list_symbols(&self, exchange: &str) -> Result<Vec<Symbol>> {
        Ok(self
            .symbols
            .read()
            .values()
            .filter(|s| s.exchange == exchange)
            .cloned()
            .collect())
    }

    async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize> {
        // Validate everything before touching the map so a bad row leaves no trace.
        if let Some(reason) = candles.iter().find_map(Candle::validation_error) {
            return Err(SyncError::invalid_batch(reason));
        }

        let mut stored = self.candles.write();
        let mut written = 0;
        for candle in candles {
            let series = stored.entry(candle.pair()).or_default();
            if let Some(row) = merge_candle(series.get(&candle.open_time), candle) {
                series.insert(row.open_time, row);
                written += 1;
            }
        }

        self.candle_writes.fetch_add(written as u64, Ordering::Relaxed);
        Ok(written)
    }

    async fn query_candle_timestamps(
        &self,
        pair: &PairKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(self
            .candles
            .read()
            .get(pair)
            .map(|series| series.range(from..to).map(|(ts, _)| *ts).collect())
            .unwrap_or_default())
    }

    async fn latest_candle(&self, pair: &PairKey) -> Result<Option<Candle>> {
        Ok(self
            .candles
            .read()
            .get(pair)
            .and_then(|series| series.values().next_back().cloned()))
    }

    async fn latest_fetched_candle(&self, pair: &PairKey) -> Result<Option<Candle>> {
        Ok(self.candles.read().get(pair).and_then(|series| {
            series
                .values()
                .rev()
                .find(|c| c.provenance == Provenance::Fetched)
                .cloned()
        }))
    }

    async fn candle_before(&self, pair: &PairKey, ts: DateTime<Utc>) -> Result<Option<Candle>> {
        Ok(self
            .candles
            .read()
            .get(pair)
            .and_then(|series| series.range(..ts).next_back().map(|(_, c)| c.clone())))
    }
}
