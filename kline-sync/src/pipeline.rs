//! Run orchestration.
//!
//! One run syncs symbols, then processes every active symbol × timeframe pair
//! on a bounded pool. Pairs are independent: a failing pair is recorded and
//! its siblings carry on. Only a failed symbol sync, or failing to read the
//! stored symbol set, fails the run as a whole.
//!
//! ```text
//! Idle → SyncingSymbols → ProcessingPairs → Done
//!              ↓                 ↓
//!            Failed            Failed
//! ```

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::errors::{Result, SyncError};
use crate::exchange::ExchangeClient;
use crate::models::PairKey;
use crate::store::CandleStore;
use crate::sync::symbols::quote_matches;
use crate::sync::{
    expected_grid, Backfiller, ForwardFiller, GapDetector, SymbolSyncReport, SymbolSyncer, UpsertWriter,
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    SyncingSymbols,
    ProcessingPairs,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::SyncingSymbols => "syncing_symbols",
            RunState::ProcessingPairs => "processing_pairs",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which stages a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Symbol sync only
    Symbols,
    /// Kline sync over the stored symbol set
    Klines,
    /// Symbol sync, then kline sync
    Full,
}

impl RunMode {
    fn syncs_symbols(self) -> bool {
        matches!(self, RunMode::Symbols | RunMode::Full)
    }

    fn syncs_klines(self) -> bool {
        matches!(self, RunMode::Klines | RunMode::Full)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairStatus {
    Succeeded,
    Failed { kind: String, error: String },
    Cancelled,
}

/// Result of processing one pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairOutcome {
    pub pair: PairKey,
    #[serde(flatten)]
    pub status: PairStatus,
    /// Gaps found before backfill
    pub gaps: usize,
    /// Candles fetched from the exchange
    pub fetched: usize,
    /// Candles synthesized by forward fill
    pub synthesized: usize,
    /// Gaps left open (no preceding candle)
    pub unfillable: usize,
}

impl PairOutcome {
    fn new(pair: PairKey) -> Self {
        Self {
            pair,
            status: PairStatus::Succeeded,
            gaps: 0,
            fetched: 0,
            synthesized: 0,
            unfillable: 0,
        }
    }

    fn cancelled(pair: PairKey) -> Self {
        Self {
            status: PairStatus::Cancelled,
            ..Self::new(pair)
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, PairStatus::Failed { .. })
    }
}

/// Everything a run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub symbols: Option<SymbolSyncReport>,
    pub pairs: Vec<PairOutcome>,
    /// Why the run failed, when it did
    pub error: Option<String>,
}

impl RunSummary {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            state: RunState::Idle,
            started_at,
            finished_at: None,
            symbols: None,
            pairs: Vec::new(),
            error: None,
        }
    }

    pub fn succeeded(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| p.status == PairStatus::Succeeded)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.pairs.iter().filter(|p| p.is_failed()).count()
    }

    pub fn cancelled(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| p.status == PairStatus::Cancelled)
            .count()
    }

    pub fn candles_fetched(&self) -> usize {
        self.pairs.iter().map(|p| p.fetched).sum()
    }

    pub fn candles_synthesized(&self) -> usize {
        self.pairs.iter().map(|p| p.synthesized).sum()
    }

    /// The run completed and no pair failed.
    pub fn is_success(&self) -> bool {
        self.state == RunState::Done && self.failed() == 0
    }
}

/// Drives symbol sync and the per-pair stages.
pub struct Orchestrator {
    config: PipelineConfig,
    client: Arc<ExchangeClient>,
    store: Arc<dyn CandleStore>,
    clock: Arc<dyn Clock>,
    syncer: SymbolSyncer,
    detector: Arc<GapDetector>,
    backfiller: Backfiller,
    forward_filler: ForwardFiller,
    state: RwLock<RunState>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        client: Arc<ExchangeClient>,
        store: Arc<dyn CandleStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let writer = Arc::new(UpsertWriter::new(store.clone(), clock.clone()));
        let detector = Arc::new(GapDetector::new(store.clone(), config.seed_timestamp));
        let syncer = SymbolSyncer::new(client.clone(), store.clone(), config.quote_filter.clone());
        let backfiller = Backfiller::new(client.clone(), writer.clone(), config.batch_limit);
        let forward_filler = ForwardFiller::new(store.clone(), detector.clone(), writer, config.batch_limit);

        Self {
            config,
            client,
            store,
            clock,
            syncer,
            detector,
            backfiller,
            forward_filler,
            state: RwLock::new(RunState::Idle),
        }
    }

    /// Current phase of the run in progress (or of the last run).
    pub fn state(&self) -> RunState {
        *self.state.read()
    }

    fn set_state(&self, state: RunState) {
        debug!("Run state -> {}", state);
        *self.state.write() = state;
    }

    /// Execute one run. Never returns an error: failures are in the summary.
    pub async fn run(&self, mode: RunMode, cancel: &CancellationToken) -> RunSummary {
        let mut summary = RunSummary::new(self.clock.now());
        self.set_state(RunState::Idle);

        if mode.syncs_symbols() {
            self.set_state(RunState::SyncingSymbols);
            match self.syncer.sync().await {
                Ok(report) => summary.symbols = Some(report),
                Err(e) => return self.fail(summary, "Symbol sync", e),
            }
        }

        if mode.syncs_klines() {
            self.set_state(RunState::ProcessingPairs);
            let pairs = match self.select_pairs().await {
                Ok(pairs) => pairs,
                Err(e) => return self.fail(summary, "Listing stored symbols", e),
            };

            let now = self.clock.now();
            info!(
                "Processing {} pairs on {} with concurrency {}",
                pairs.len(),
                self.client.id(),
                self.config.concurrency
            );

            let mut outcomes: Vec<PairOutcome> = stream::iter(pairs)
                .map(|pair| self.process_pair(pair, now, cancel))
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;
            outcomes.sort_by(|a, b| a.pair.cmp(&b.pair));
            summary.pairs = outcomes;
        }

        self.set_state(RunState::Done);
        summary.state = RunState::Done;
        summary.finished_at = Some(self.clock.now());

        info!(
            "Run finished: {} pairs ok, {} failed, {} cancelled; {} candles fetched, {} synthesized",
            summary.succeeded(),
            summary.failed(),
            summary.cancelled(),
            summary.candles_fetched(),
            summary.candles_synthesized()
        );
        summary
    }

    fn fail(&self, mut summary: RunSummary, stage: &str, err: SyncError) -> RunSummary {
        error!("{} failed: {}", stage, err);
        self.set_state(RunState::Failed);
        summary.state = RunState::Failed;
        summary.error = Some(format!("{} failed: {}", stage, err));
        summary.finished_at = Some(self.clock.now());
        summary
    }

    /// Active stored symbols, narrowed by the quote and symbol filters, times
    /// the configured timeframes.
    async fn select_pairs(&self) -> Result<Vec<PairKey>> {
        let exchange = self.client.id();
        let quote = self.config.quote_filter.as_deref();
        let only = self.config.only_symbols.as_deref();

        let symbols: Vec<String> = self
            .store
            .list_symbols(exchange)
            .await?
            .into_iter()
            .filter(|s| s.active && quote_matches(s, quote))
            .filter(|s| only.map_or(true, |names| names.iter().any(|n| n.eq_ignore_ascii_case(&s.symbol))))
            .map(|s| s.symbol)
            .collect();

        if let Some(names) = only {
            for name in names {
                if !symbols.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                    warn!("{} is not an active {} symbol, skipping", name, exchange);
                }
            }
        }

        let timeframes = self.config.unique_timeframes();
        Ok(symbols
            .iter()
            .flat_map(|symbol| timeframes.iter().map(move |tf| PairKey::new(exchange, symbol.clone(), *tf)))
            .collect())
    }

    async fn process_pair(&self, pair: PairKey, now: DateTime<Utc>, cancel: &CancellationToken) -> PairOutcome {
        if cancel.is_cancelled() {
            return PairOutcome::cancelled(pair);
        }

        let mut outcome = PairOutcome::new(pair.clone());
        match self.sync_pair(&pair, now, cancel, &mut outcome).await {
            Ok(()) => {
                info!(
                    "{}: {} gaps, {} fetched, {} synthesized",
                    pair, outcome.gaps, outcome.fetched, outcome.synthesized
                );
            }
            Err(SyncError::Cancelled) => {
                info!("{}: cancelled", pair);
                outcome.status = PairStatus::Cancelled;
            }
            Err(e) => {
                warn!("{} failed: {}", pair, e);
                outcome.status = PairStatus::Failed {
                    kind: e.kind().to_string(),
                    error: e.to_string(),
                };
            }
        }
        outcome
    }

    /// Detect, backfill, then forward-fill one pair, strictly in that order.
    async fn sync_pair(
        &self,
        pair: &PairKey,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        outcome: &mut PairOutcome,
    ) -> Result<()> {
        let gaps = self.detector.detect_unfetched(pair, now).await?;
        outcome.gaps = gaps.len();
        if gaps.is_empty() {
            return Ok(());
        }

        let (_, grid_end) = expected_grid(pair.timeframe, self.detector.seed(), now);
        let backfill = self.backfiller.fill(pair, &gaps, grid_end, cancel).await?;
        outcome.fetched = backfill.fetched;

        let filled = self.forward_filler.fill(pair, now, cancel).await?;
        outcome.synthesized = filled.synthesized;
        outcome.unfillable = filled.unfillable;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::exchange::RetryPolicy;
    use crate::models::{Candle, Provenance};
    use crate::rate_limiter::RateLimiter;
    use crate::store::MemoryStore;
    use crate::testing::{candle_at, hour, symbol, FailingStore, ManualClock, ScriptedExchange};
    use crate::timeframe::Timeframe;
    use std::time::Duration;

    const ATTEMPTS: u32 = 3;

    fn pipeline_config(batch_limit: usize) -> PipelineConfig {
        PipelineConfig {
            exchange_id: "binance".to_string(),
            timeframes: vec![Timeframe::H1],
            batch_limit,
            seed_timestamp: hour(0),
            concurrency: 2,
            quote_filter: Some("USDT".to_string()),
            only_symbols: None,
        }
    }

    fn orchestrator(
        config: PipelineConfig,
        api: Arc<ScriptedExchange>,
        store: Arc<dyn CandleStore>,
        clock: Arc<ManualClock>,
    ) -> Orchestrator {
        let limiter = Arc::new(
            RateLimiter::new(&RateLimitConfig {
                capacity: 1000,
                refill_per_sec: 1000.0,
            })
            .unwrap(),
        );
        let retry = RetryPolicy::new(ATTEMPTS, Duration::from_millis(10), Duration::from_millis(50)).without_jitter();
        let client = Arc::new(ExchangeClient::new(api, limiter, retry, clock.clone()).unwrap());
        Orchestrator::new(config, client, store, clock)
    }

    fn btc() -> PairKey {
        PairKey::new("binance", "BTCUSDT", Timeframe::H1)
    }

    fn exchange_with(symbols: &[&str]) -> Arc<ScriptedExchange> {
        let api = Arc::new(ScriptedExchange::new("binance"));
        api.set_markets(symbols.iter().map(|s| symbol(s, true)).collect());
        api
    }

    #[tokio::test]
    async fn test_missing_middle_candle_is_forward_filled() {
        let api = exchange_with(&["BTCUSDT"]);
        api.insert_candles(
            "BTCUSDT",
            Timeframe::H1,
            &[candle_at("BTCUSDT", hour(0), 100.0), candle_at("BTCUSDT", hour(2), 102.0)],
        );
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(hour(3)));
        let orch = orchestrator(pipeline_config(1000), api, store.clone(), clock);

        let summary = orch.run(RunMode::Full, &CancellationToken::new()).await;
        assert!(summary.is_success());
        assert_eq!(orch.state(), RunState::Done);

        let stored = store.candles(&btc());
        let rows: Vec<_> = stored.iter().map(|c| (c.open_time, c.provenance)).collect();
        assert_eq!(
            rows,
            vec![
                (hour(0), Provenance::Fetched),
                (hour(1), Provenance::Synthesized),
                (hour(2), Provenance::Fetched),
            ]
        );
        assert_eq!(stored[1].close, 100.0);
        assert_eq!(stored[1].volume, 0.0);
        assert_eq!(summary.candles_fetched(), 2);
        assert_eq!(summary.candles_synthesized(), 1);
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing() {
        let api = exchange_with(&["BTCUSDT", "ETHUSDT"]);
        for name in ["BTCUSDT", "ETHUSDT"] {
            let candles: Vec<Candle> = [0, 1, 3, 4, 6, 7]
                .iter()
                .map(|&h| candle_at(name, hour(h), 10.0 + h as f64))
                .collect();
            api.insert_candles(name, Timeframe::H1, &candles);
        }
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(hour(8)));
        let orch = orchestrator(pipeline_config(2), api.clone(), store.clone(), clock);

        let first = orch.run(RunMode::Full, &CancellationToken::new()).await;
        assert!(first.is_success());
        let snapshot = store.candles(&btc());
        let writes = store.candle_writes();
        let symbol_writes = store.symbol_writes();
        let calls = api.candle_calls();

        let second = orch.run(RunMode::Full, &CancellationToken::new()).await;
        assert!(second.is_success());
        assert_eq!(store.candles(&btc()), snapshot);
        assert_eq!(store.candle_writes(), writes);
        assert_eq!(store.symbol_writes(), symbol_writes);
        assert_eq!(api.candle_calls(), calls);
        assert_eq!(second.symbols.unwrap().writes(), 0);
    }

    #[tokio::test]
    async fn test_late_candle_replaces_synthesized_tail() {
        let api = exchange_with(&["BTCUSDT"]);
        api.insert_candles(
            "BTCUSDT",
            Timeframe::H1,
            &[candle_at("BTCUSDT", hour(0), 100.0), candle_at("BTCUSDT", hour(1), 101.0)],
        );
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(hour(3)));
        let orch = orchestrator(pipeline_config(1000), api.clone(), store.clone(), clock.clone());

        let first = orch.run(RunMode::Full, &CancellationToken::new()).await;
        assert!(first.is_success());
        let stored = store.candles(&btc());
        assert_eq!(stored[2].provenance, Provenance::Synthesized);
        assert_eq!(stored[2].close, 101.0);

        // the exchange publishes 02:00 late
        api.insert_candles("BTCUSDT", Timeframe::H1, &[candle_at("BTCUSDT", hour(2), 250.0)]);
        clock.set(hour(3) + chrono::Duration::minutes(20));

        let second = orch.run(RunMode::Full, &CancellationToken::new()).await;
        assert!(second.is_success());
        assert_eq!(second.candles_fetched(), 1);
        assert_eq!(second.candles_synthesized(), 0);

        let stored = store.candles(&btc());
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].open_time, hour(2));
        assert_eq!(stored[2].provenance, Provenance::Fetched);
        assert_eq!(stored[2].close, 250.0);
    }

    #[tokio::test]
    async fn test_grid_is_complete_after_run() {
        let api = exchange_with(&["BTCUSDT"]);
        let candles: Vec<Candle> = (0..48)
            .filter(|h| h % 7 != 3 && h % 11 != 5)
            .map(|h| candle_at("BTCUSDT", hour(h), 50.0 + h as f64))
            .collect();
        api.insert_candles("BTCUSDT", Timeframe::H1, &candles);
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(hour(48) + chrono::Duration::minutes(30)));
        let orch = orchestrator(pipeline_config(5), api, store.clone(), clock);

        let summary = orch.run(RunMode::Full, &CancellationToken::new()).await;
        assert!(summary.is_success());

        let stored = store.candles(&btc());
        assert_eq!(stored.len(), 48);
        assert_eq!(stored[0].open_time, hour(0));
        assert!(stored
            .windows(2)
            .all(|w| w[1].open_time - w[0].open_time == Timeframe::H1.step()));
        // every synthesized candle carries the previous close
        for w in stored.windows(2) {
            if w[1].provenance == Provenance::Synthesized {
                assert_eq!(w[1].close, w[0].close);
            }
        }
    }

    #[tokio::test]
    async fn test_gaps_backfilled_left_first() {
        let api = exchange_with(&["BTCUSDT"]);
        let candles: Vec<Candle> = (0..10).map(|h| candle_at("BTCUSDT", hour(h), 1.0)).collect();
        api.insert_candles("BTCUSDT", Timeframe::H1, &candles);
        let store = Arc::new(MemoryStore::new());
        let seeded: Vec<Candle> = [3, 4, 7].iter().map(|&h| candle_at("BTCUSDT", hour(h), 1.0)).collect();
        store.upsert_candles(&seeded).await.unwrap();
        let clock = Arc::new(ManualClock::at(hour(10)));
        let orch = orchestrator(pipeline_config(2), api.clone(), store.clone(), clock);

        orch.run(RunMode::Full, &CancellationToken::new()).await;

        let since: Vec<_> = api.requests().iter().map(|r| r.since).collect();
        assert_eq!(since, vec![hour(0), hour(2), hour(5), hour(8)]);
        assert_eq!(store.candles(&btc()).len(), 10);
    }

    #[tokio::test]
    async fn test_failed_pair_does_not_stop_siblings() {
        let api = exchange_with(&["BTCUSDT", "ETHUSDT"]);
        api.insert_candles("BTCUSDT", Timeframe::H1, &[candle_at("BTCUSDT", hour(0), 1.0)]);
        api.break_symbol("ETHUSDT");
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(hour(1)));
        let orch = orchestrator(pipeline_config(100), api, store, clock);

        let summary = orch.run(RunMode::Full, &CancellationToken::new()).await;
        assert_eq!(summary.state, RunState::Done);
        assert!(!summary.is_success());
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 1);

        let eth = summary.pairs.iter().find(|p| p.pair.symbol == "ETHUSDT").unwrap();
        assert!(matches!(&eth.status, PairStatus::Failed { kind, .. } if kind == "exchange_protocol"));
    }

    #[tokio::test]
    async fn test_unavailable_exchange_fails_run_after_bounded_retries() {
        let api = exchange_with(&["BTCUSDT"]);
        api.always_fail(|| SyncError::unavailable("connection refused"));
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at(hour(5)));
        let orch = orchestrator(pipeline_config(100), api.clone(), store, clock.clone());

        let summary = orch.run(RunMode::Full, &CancellationToken::new()).await;
        assert_eq!(summary.state, RunState::Failed);
        assert_eq!(orch.state(), RunState::Failed);
        assert!(summary.error.unwrap().contains("Symbol sync"));
        assert_eq!(api.market_calls(), ATTEMPTS as usize);
        assert_eq!(clock.sleeps().len(), (ATTEMPTS - 1) as usize);
    }

    #[tokio::test]
    async fn test_unavailable_exchange_fails_each_pair() {
        let api = exchange_with(&["BTCUSDT", "ETHUSDT"]);
        let memory = Arc::new(MemoryStore::new());
        memory
            .upsert_symbols(&[symbol("BTCUSDT", true), symbol("ETHUSDT", true)])
            .await
            .unwrap();
        api.always_fail(|| SyncError::unavailable("connection refused"));
        let clock = Arc::new(ManualClock::at(hour(5)));
        let orch = orchestrator(pipeline_config(100), api.clone(), memory.clone(), clock);

        let summary = orch.run(RunMode::Klines, &CancellationToken::new()).await;
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.failed(), 2);
        assert_eq!(api.candle_calls(), 2 * ATTEMPTS as usize);
        assert_eq!(memory.candle_count(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_fails_only_that_pair() {
        let api = exchange_with(&["BTCUSDT", "ETHUSDT"]);
        for name in ["BTCUSDT", "ETHUSDT"] {
            api.insert_candles(name, Timeframe::H1, &[candle_at(name, hour(0), 1.0), candle_at(name, hour(1), 2.0)]);
        }
        let memory = Arc::new(MemoryStore::new());
        let store = Arc::new(FailingStore::new(memory.clone()));
        store.break_symbol("ETHUSDT");
        let clock = Arc::new(ManualClock::at(hour(2)));
        let orch = orchestrator(pipeline_config(100), api, store, clock);

        let summary = orch.run(RunMode::Full, &CancellationToken::new()).await;
        let eth = summary.pairs.iter().find(|p| p.pair.symbol == "ETHUSDT").unwrap();
        assert!(matches!(&eth.status, PairStatus::Failed { kind, .. } if kind == "store_unavailable"));
        assert_eq!(memory.candles(&btc()).len(), 2);
        assert!(memory
            .candles(&PairKey::new("binance", "ETHUSDT", Timeframe::H1))
            .is_empty());
    }

    #[tokio::test]
    async fn test_store_listing_failure_fails_run() {
        let api = exchange_with(&["BTCUSDT"]);
        let store = Arc::new(FailingStore::new(Arc::new(MemoryStore::new())));
        store.take_listing_down();
        let orch = orchestrator(pipeline_config(100), api, store, Arc::new(ManualClock::at(hour(2))));

        let summary = orch.run(RunMode::Klines, &CancellationToken::new()).await;
        assert_eq!(summary.state, RunState::Failed);
        assert!(summary.pairs.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_unstarted_pairs() {
        let api = exchange_with(&["BTCUSDT", "ETHUSDT"]);
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(pipeline_config(100), api.clone(), store, Arc::new(ManualClock::at(hour(3))));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = orch.run(RunMode::Full, &cancel).await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.cancelled(), 2);
        assert_eq!(api.candle_calls(), 0);
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_symbol_filters() {
        let api = exchange_with(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        let store = Arc::new(MemoryStore::new());
        let mut config = pipeline_config(100);
        config.only_symbols = Some(vec!["ethusdt".to_string(), "DOGEUSDT".to_string()]);
        config.timeframes = vec![Timeframe::H1, Timeframe::H4, Timeframe::H1];
        let orch = orchestrator(config, api, store, Arc::new(ManualClock::at(hour(3))));

        let summary = orch.run(RunMode::Full, &CancellationToken::new()).await;
        let pairs: Vec<String> = summary.pairs.iter().map(|p| p.pair.to_string()).collect();
        assert_eq!(pairs, vec!["binance:ETHUSDT@1h", "binance:ETHUSDT@4h"]);
        assert_eq!(summary.symbols.unwrap().added, 3);
    }

    #[tokio::test]
    async fn test_symbols_mode_skips_klines() {
        let api = exchange_with(&["BTCUSDT"]);
        let store = Arc::new(MemoryStore::new());
        let orch = orchestrator(pipeline_config(100), api.clone(), store.clone(), Arc::new(ManualClock::at(hour(3))));

        let summary = orch.run(RunMode::Symbols, &CancellationToken::new()).await;
        assert!(summary.is_success());
        assert!(summary.pairs.is_empty());
        assert_eq!(api.candle_calls(), 0);
        assert_eq!(store.symbols().len(), 1);
    }
}
