//! Paginated historical fetches that close gaps from the exchange.

use super::writer::UpsertWriter;
use crate::errors::{Result, SyncError};
use crate::exchange::ExchangeClient;
use crate::models::{Gap, PairKey};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Totals for one pair's backfill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Requests issued
    pub pages: usize,
    /// Candles kept from the pages
    pub fetched: usize,
    /// Rows inserted or changed
    pub written: usize,
}

impl BackfillReport {
    fn absorb(&mut self, other: BackfillReport) {
        self.pages += other.pages;
        self.fetched += other.fetched;
        self.written += other.written;
    }
}

pub struct Backfiller {
    client: Arc<ExchangeClient>,
    writer: Arc<UpsertWriter>,
    batch_limit: usize,
}

impl Backfiller {
    pub fn new(client: Arc<ExchangeClient>, writer: Arc<UpsertWriter>, batch_limit: usize) -> Self {
        let batch_limit = batch_limit.clamp(1, client.max_batch_limit());
        Self {
            client,
            writer,
            batch_limit,
        }
    }

    /// Backfill every gap in order. `grid_end` is the exclusive end of the
    /// expected grid; nothing at or after it is stored.
    pub async fn fill(
        &self,
        pair: &PairKey,
        gaps: &[Gap],
        grid_end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport> {
        let mut total = BackfillReport::default();
        for gap in gaps {
            total.absorb(self.fill_gap(pair, gap, grid_end, cancel).await?);
        }
        Ok(total)
    }

    /// Page through one gap, writing each page before requesting the next.
    ///
    /// Count-paged exchanges return the first candles at or after `since`,
    /// so an empty or short page means there is nothing more and paging
    /// stops. Window-paged exchanges answer for a fixed stretch of time, so
    /// an empty or short page only says that stretch has holes and paging
    /// moves on to the next window. Either way paging ends once `since`
    /// reaches the gap end or the grid end. Candles past the gap end are
    /// kept: they replace synthesized rows left by an earlier run.
    pub async fn fill_gap(
        &self,
        pair: &PairKey,
        gap: &Gap,
        grid_end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport> {
        let step = pair.timeframe.step();
        let window = self.client.page_window(pair.timeframe, self.batch_limit);
        let mut report = BackfillReport::default();
        let mut since = gap.from;

        while since < gap.to && since < grid_end {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let page = self
                .client
                .fetch_candles(&pair.symbol, pair.timeframe, since, self.batch_limit)
                .await?;
            report.pages += 1;

            let last_open = page.last().map(|c| c.open_time);
            let short = page.len() < self.batch_limit;

            let mut kept = page;
            kept.retain(|c| c.open_time < grid_end);
            for candle in &mut kept {
                candle.exchange.clone_from(&pair.exchange);
            }

            if !kept.is_empty() {
                report.fetched += kept.len();
                report.written += self.writer.upsert(&kept).await?;
            }

            debug!(
                "{}: page at {} kept {} candles{}",
                pair,
                since,
                kept.len(),
                if short { " (short)" } else { "" }
            );

            since = match (window, last_open) {
                (Some(span), _) => since + span,
                (None, Some(last)) if !short => last + step,
                (None, _) => break,
            };
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::exchange::RetryPolicy;
    use crate::models::{Candle, Provenance};
    use crate::rate_limiter::RateLimiter;
    use crate::store::{CandleStore, MemoryStore};
    use crate::testing::{candle_at, hour, ManualClock, ScriptedExchange};
    use crate::timeframe::Timeframe;
    use std::time::Duration;

    struct Harness {
        api: Arc<ScriptedExchange>,
        store: Arc<MemoryStore>,
        backfiller: Backfiller,
    }

    fn harness(batch_limit: usize) -> Harness {
        harness_on(ScriptedExchange::new("binance"), batch_limit)
    }

    fn harness_on(api: ScriptedExchange, batch_limit: usize) -> Harness {
        let api = Arc::new(api);
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(hour(100)));
        let limiter = Arc::new(
            RateLimiter::new(&RateLimitConfig {
                capacity: 1000,
                refill_per_sec: 1000.0,
            })
            .unwrap(),
        );
        let client = Arc::new(
            ExchangeClient::new(
                api.clone(),
                limiter,
                RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100)),
                clock.clone(),
            )
            .unwrap(),
        );
        let writer = Arc::new(UpsertWriter::new(store.clone(), clock));
        Harness {
            api,
            store,
            backfiller: Backfiller::new(client, writer, batch_limit),
        }
    }

    fn pair() -> PairKey {
        PairKey::new("binance", "BTCUSDT", Timeframe::H1)
    }

    fn series(hours: std::ops::Range<i64>) -> Vec<Candle> {
        hours.map(|h| candle_at("BTCUSDT", hour(h), 100.0 + h as f64)).collect()
    }

    #[tokio::test]
    async fn test_pages_until_gap_closed() {
        let h = harness(3);
        h.api.insert_candles("BTCUSDT", Timeframe::H1, &series(0..20));

        let report = h
            .backfiller
            .fill_gap(&pair(), &Gap::new(hour(0), hour(7)), hour(10), &CancellationToken::new())
            .await
            .unwrap();

        // 0-2, 3-5, 6-8; since then reaches 9 >= gap end
        assert_eq!(report.pages, 3);
        assert_eq!(report.fetched, 9);
        let since: Vec<_> = h.api.requests().iter().map(|r| r.since).collect();
        assert_eq!(since, vec![hour(0), hour(3), hour(6)]);
        assert_eq!(h.store.candle_count(), 9);
    }

    #[tokio::test]
    async fn test_candles_at_grid_end_are_dropped() {
        let h = harness(5);
        // exchange also serves the candle still forming at hour 4
        h.api.insert_candles("BTCUSDT", Timeframe::H1, &series(0..5));

        let report = h
            .backfiller
            .fill_gap(&pair(), &Gap::new(hour(0), hour(4)), hour(4), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.pages, 1);
        assert_eq!(report.fetched, 4);
        assert!(h.store.latest_candle(&pair()).await.unwrap().unwrap().open_time < hour(4));
    }

    #[tokio::test]
    async fn test_empty_page_leaves_gap_open() {
        let h = harness(5);
        h.api.insert_candles("BTCUSDT", Timeframe::H1, &series(10..12));

        let report = h
            .backfiller
            .fill_gap(&pair(), &Gap::new(hour(12), hour(15)), hour(15), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report, BackfillReport { pages: 1, fetched: 0, written: 0 });
    }

    #[tokio::test]
    async fn test_fetched_rows_supersede_synthesized_past_gap_end() {
        let h = harness(10);
        let prev = candle_at("BTCUSDT", hour(0), 100.0);
        let synth: Vec<Candle> = (1..4).map(|i| Candle::synthesized(&prev, hour(i))).collect();
        h.store.upsert_candles(&synth).await.unwrap();

        h.api.insert_candles("BTCUSDT", Timeframe::H1, &series(0..4));
        h.backfiller
            .fill_gap(&pair(), &Gap::new(hour(0), hour(1)), hour(4), &CancellationToken::new())
            .await
            .unwrap();

        let stored = h.store.candles(&pair());
        assert_eq!(stored.len(), 4);
        assert!(stored.iter().all(|c| c.provenance == Provenance::Fetched));
        assert_eq!(stored[3].close, 103.0);
    }

    #[tokio::test]
    async fn test_cancel_between_pages() {
        let h = harness(2);
        h.api.insert_candles("BTCUSDT", Timeframe::H1, &series(0..10));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = h
            .backfiller
            .fill(&pair(), &[Gap::new(hour(0), hour(10))], hour(10), &cancel)
            .await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(h.api.candle_calls(), 0);
    }

    #[tokio::test]
    async fn test_fill_walks_gaps_in_order() {
        let h = harness(10);
        h.api.insert_candles("BTCUSDT", Timeframe::H1, &series(0..10));

        let gaps = [Gap::new(hour(0), hour(2)), Gap::new(hour(5), hour(6))];
        let report = h
            .backfiller
            .fill(&pair(), &gaps, hour(8), &CancellationToken::new())
            .await
            .unwrap();

        let since: Vec<_> = h.api.requests().iter().map(|r| r.since).collect();
        assert_eq!(since, vec![hour(0), hour(5)]);
        assert_eq!(report.pages, 2);
        assert_eq!(h.store.candle_count(), 8);
    }

    #[tokio::test]
    async fn test_windowed_paging_reaches_late_listing() {
        let h = harness_on(ScriptedExchange::new("binance").windowed(), 3);
        // first candle sits three windows after the gap start
        h.api.insert_candles("BTCUSDT", Timeframe::H1, &series(10..14));

        let report = h
            .backfiller
            .fill_gap(&pair(), &Gap::new(hour(0), hour(14)), hour(14), &CancellationToken::new())
            .await
            .unwrap();

        let since: Vec<_> = h.api.requests().iter().map(|r| r.since).collect();
        assert_eq!(since, vec![hour(0), hour(3), hour(6), hour(9), hour(12)]);
        assert_eq!(report.pages, 5);
        assert_eq!(report.fetched, 4);
        assert_eq!(h.store.candle_count(), 4);
    }

    #[tokio::test]
    async fn test_windowed_hole_does_not_end_backfill() {
        let h = harness_on(ScriptedExchange::new("binance").windowed(), 3);
        let mut candles = series(0..12);
        candles.retain(|c| c.open_time != hour(4));
        h.api.insert_candles("BTCUSDT", Timeframe::H1, &candles);

        let report = h
            .backfiller
            .fill_gap(&pair(), &Gap::new(hour(0), hour(12)), hour(12), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.pages, 4);
        assert_eq!(report.fetched, 11);

        let stored: Vec<_> = h.store.candles(&pair()).iter().map(|c| c.open_time).collect();
        assert!(!stored.contains(&hour(4)));
        assert!(stored.contains(&hour(5)));
        assert_eq!(stored.last(), Some(&hour(11)));
        assert!(h.store.candles(&pair()).iter().all(|c| c.provenance == Provenance::Fetched));
    }

    #[tokio::test]
    async fn test_count_paged_short_page_stops() {
        let h = harness(3);
        let mut candles = series(0..12);
        candles.retain(|c| c.open_time != hour(4));
        h.api.insert_candles("BTCUSDT", Timeframe::H1, &candles);

        let report = h
            .backfiller
            .fill_gap(&pair(), &Gap::new(hour(0), hour(12)), hour(12), &CancellationToken::new())
            .await
            .unwrap();

        // a count-paged exchange skips the hole: 0-2, 3 5 6, 7-9, 10 11
        assert_eq!(report.pages, 4);
        assert_eq!(report.fetched, 11);
    }
}
