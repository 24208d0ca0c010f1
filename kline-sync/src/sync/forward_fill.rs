//! Continuity filling for ranges the exchange could not supply.

use super::gaps::GapDetector;
use super::writer::UpsertWriter;
use crate::errors::{Result, SyncError};
use crate::models::{Candle, Gap, PairKey};
use crate::store::CandleStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardFillReport {
    /// Residual gaps found after backfill
    pub gaps: usize,
    /// Candles synthesized
    pub synthesized: usize,
    /// Gaps left open for lack of a preceding candle
    pub unfillable: usize,
}

/// Flat candles for every grid point of `gap`, carrying `previous.close`.
/// Candles are produced as the iterator is advanced.
pub fn synthesize<'a>(previous: &'a Candle, gap: &Gap) -> impl Iterator<Item = Candle> + Send + 'a {
    let step_ms = previous.timeframe.step_millis();
    let from = gap.from;
    (0..gap.candles_missing(previous.timeframe))
        .map(move |i| Candle::synthesized(previous, from + ChronoDuration::milliseconds(step_ms * i)))
}

pub struct ForwardFiller {
    store: Arc<dyn CandleStore>,
    detector: Arc<GapDetector>,
    writer: Arc<UpsertWriter>,
    batch_limit: usize,
}

impl ForwardFiller {
    pub fn new(
        store: Arc<dyn CandleStore>,
        detector: Arc<GapDetector>,
        writer: Arc<UpsertWriter>,
        batch_limit: usize,
    ) -> Self {
        Self {
            store,
            detector,
            writer,
            batch_limit: batch_limit.max(1),
        }
    }

    /// Fill every residual gap of `pair` as of `now`.
    pub async fn fill(
        &self,
        pair: &PairKey,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<ForwardFillReport> {
        let gaps = self.detector.detect(pair, now).await?;
        let mut report = ForwardFillReport {
            gaps: gaps.len(),
            ..Default::default()
        };

        for gap in &gaps {
            let Some(previous) = self.store.candle_before(pair, gap.from).await? else {
                debug!("{}: no candle before {}, leaving gap {}", pair, gap.from, gap);
                report.unfillable += 1;
                continue;
            };

            let mut points = synthesize(&previous, gap);
            loop {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                let chunk: Vec<Candle> = points.by_ref().take(self.batch_limit).collect();
                if chunk.is_empty() {
                    break;
                }
                self.writer.upsert(&chunk).await?;
                report.synthesized += chunk.len();
            }
        }

        if report.synthesized > 0 {
            info!(
                "{}: synthesized {} candles across {} gaps",
                pair, report.synthesized, report.gaps - report.unfillable
            );
        }
        Ok(report)
    }
}
