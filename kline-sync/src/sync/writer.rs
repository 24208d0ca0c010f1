//! Batch upserts with in-batch deduplication and bounded retry on store outages.

use crate::clock::Clock;
use crate::errors::Result;
use crate::models::{Candle, PairKey};
use crate::store::CandleStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Maximum attempts for one batch.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff between attempts.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Collapse duplicate keys, keeping the last occurrence. Output is ordered by
/// (pair, open_time).
pub fn dedup_batch(candles: &[Candle]) -> Vec<Candle> {
    let mut by_key: BTreeMap<(PairKey, DateTime<Utc>), &Candle> = BTreeMap::new();
    for candle in candles {
        by_key.insert((candle.pair(), candle.open_time), candle);
    }
    by_key.into_values().cloned().collect()
}

/// Idempotent writer in front of the store.
pub struct UpsertWriter {
    store: Arc<dyn CandleStore>,
    clock: Arc<dyn Clock>,
    batches: AtomicU64,
    rows_written: AtomicU64,
    retries: AtomicU64,
}

impl UpsertWriter {
    pub fn new(store: Arc<dyn CandleStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            batches: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Batches committed so far.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Rows inserted or changed so far.
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Upsert one batch. Returns the number of rows inserted or changed.
    ///
    /// Store outages are retried up to three attempts in total; any other
    /// error, or the last outage, is returned and nothing from the batch is
    /// kept.
    pub async fn upsert(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let batch = dedup_batch(candles);
        if batch.len() < candles.len() {
            debug!("Collapsed {} duplicate candles", candles.len() - batch.len());
        }

        let mut attempt = 0;
        loop {
            match self.store.upsert_candles(&batch).await {
                Ok(written) => {
                    self.batches.fetch_add(1, Ordering::Relaxed);
                    self.rows_written.fetch_add(written as u64, Ordering::Relaxed);
                    return Ok(written);
                }
                Err(e) if e.is_store_connectivity() && attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Write attempt {} failed: {}; retrying after {:?}",
                        attempt, e, delay
                    );
                    self.clock.sleep(delay).await;
                }
                Err(e) => {
                    error!("Failed to write {} candles: {}", batch.len(), e);
                    return Err(e);
                }
            }
        }
    }
}
