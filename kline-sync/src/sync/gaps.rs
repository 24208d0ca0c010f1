//! Gap detection over a pair's regular candle grid.
//!
//! The expected grid runs from `align_up(seed)` up to `align_down(now)`
//! exclusive, so the candle still forming at `now` is never expected. Only the
//! stretch up to the pair's [`SyncCursor`] is scanned against the store;
//! everything after the cursor is reported as a single tail gap.
//!
//! [`GapDetector::detect`] puts the cursor after the latest stored row and
//! finds rows that are missing outright. [`GapDetector::detect_unfetched`]
//! puts it after the latest fetched row, so a synthesized tail is reported
//! again until the exchange has published those candles.

use crate::errors::Result;
use crate::models::{Gap, PairKey};
use crate::store::CandleStore;
use crate::timeframe::Timeframe;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Latest covered open times of one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub pair: PairKey,
    /// Latest row of any provenance
    pub latest: Option<DateTime<Utc>>,
    /// Latest row that came from the exchange
    pub latest_fetched: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// First open time after the latest stored row.
    pub fn next_open(&self) -> Option<DateTime<Utc>> {
        self.latest.map(|ts| ts + self.pair.timeframe.step())
    }

    /// First open time after the latest fetched row.
    pub fn next_fetch(&self) -> Option<DateTime<Utc>> {
        self.latest_fetched.map(|ts| ts + self.pair.timeframe.step())
    }
}

/// Half-open expected grid `[start, end)` for `timeframe`.
pub fn expected_grid(timeframe: Timeframe, seed: DateTime<Utc>, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (timeframe.align_up(seed), timeframe.align_down(now))
}

/// Maximal missing ranges in `[start, end)` given the present open times
/// (ascending). Off-grid and out-of-range timestamps are ignored.
pub fn find_gaps(
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    present: &[DateTime<Utc>],
) -> Vec<Gap> {
    let mut gaps = Vec::new();
    if start >= end {
        return gaps;
    }

    let mut expected = start;
    for &ts in present {
        if ts < expected || !timeframe.is_aligned(ts) {
            continue;
        }
        if ts >= end {
            break;
        }
        if ts > expected {
            gaps.push(Gap::new(expected, ts));
        }
        expected = ts + timeframe.step();
    }

    if expected < end {
        gaps.push(Gap::new(expected, end));
    }
    gaps
}

/// Finds missing grid ranges per pair.
pub struct GapDetector {
    store: Arc<dyn CandleStore>,
    seed: DateTime<Utc>,
}

impl GapDetector {
    pub fn new(store: Arc<dyn CandleStore>, seed: DateTime<Utc>) -> Self {
        Self { store, seed }
    }

    pub fn seed(&self) -> DateTime<Utc> {
        self.seed
    }

    pub async fn cursor(&self, pair: &PairKey) -> Result<SyncCursor> {
        let latest = self.store.latest_candle(pair).await?.map(|c| c.open_time);
        let latest_fetched = self.store.latest_fetched_candle(pair).await?.map(|c| c.open_time);
        Ok(SyncCursor {
            pair: pair.clone(),
            latest,
            latest_fetched,
        })
    }

    /// Missing ranges of `pair` as of `now`, ascending.
    pub async fn detect(&self, pair: &PairKey, now: DateTime<Utc>) -> Result<Vec<Gap>> {
        let cursor = self.cursor(pair).await?;
        self.scan(pair, now, cursor.next_open()).await
    }

    /// Ranges of `pair` still to be asked of the exchange as of `now`,
    /// ascending. Synthesized rows after the latest fetched one count as
    /// missing.
    pub async fn detect_unfetched(&self, pair: &PairKey, now: DateTime<Utc>) -> Result<Vec<Gap>> {
        let cursor = self.cursor(pair).await?;
        self.scan(pair, now, cursor.next_fetch()).await
    }

    /// Gaps in the grid, scanning the store up to `scan_to` and treating
    /// everything after it as one tail gap.
    async fn scan(&self, pair: &PairKey, now: DateTime<Utc>, scan_to: Option<DateTime<Utc>>) -> Result<Vec<Gap>> {
        let tf = pair.timeframe;
        let (start, end) = expected_grid(tf, self.seed, now);
        if start >= end {
            return Ok(Vec::new());
        }

        let Some(scan_to) = scan_to else {
            debug!("{} has no candles, whole grid missing", pair);
            return Ok(vec![Gap::new(start, end)]);
        };

        let scan_end = scan_to.clamp(start, end);
        let present = self.store.query_candle_timestamps(pair, start, scan_end).await?;
        let mut gaps = find_gaps(tf, start, scan_end, &present);

        if scan_end < end {
            match gaps.last_mut() {
                Some(last) if last.to == scan_end => last.to = end,
                _ => gaps.push(Gap::new(scan_end, end)),
            }
        }

        if !gaps.is_empty() {
            let missing: i64 = gaps.iter().map(|g| g.candles_missing(tf)).sum();
            debug!("{}: {} gaps, {} candles missing", pair, gaps.len(), missing);
        }
        Ok(gaps)
    }
}
