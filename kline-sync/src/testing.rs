//! Test doubles shared by the unit tests.

use crate::clock::Clock;
use crate::errors::{Result, SyncError};
use crate::exchange::ExchangeApi;
use crate::models::{Candle, PairKey, Provenance, Symbol};
use crate::store::{CandleStore, MemoryStore};
use crate::timeframe::Timeframe;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 2024-01-01T00:00Z plus `n` hours.
pub fn hour(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::hours(n)
}

/// Fetched 1h binance candle closing at `close`.
pub fn candle_at(symbol: &str, open_time: DateTime<Utc>, close: f64) -> Candle {
    Candle {
        exchange: "binance".to_string(),
        symbol: symbol.to_string(),
        timeframe: Timeframe::H1,
        open_time,
        open: close,
        high: close + 1.0,
        low: (close - 1.0).max(0.0),
        close,
        volume: 1.0,
        trades: Some(10),
        quote_volume: None,
        provenance: Provenance::Fetched,
    }
}

/// Binance USDT market named `name`.
pub fn symbol(name: &str, active: bool) -> Symbol {
    Symbol {
        exchange: "binance".to_string(),
        symbol: name.to_string(),
        base: name.trim_end_matches("USDT").to_string(),
        quote: "USDT".to_string(),
        active,
        listed_at: None,
    }
}

/// Clock whose sleeps return immediately and advance `now`.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        let step = ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero());
        *self.now.lock() += step;
    }
}

/// One recorded `fetch_candles` request.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub since: DateTime<Utc>,
    pub limit: usize,
}

/// Exchange stub serving canned markets and candles.
pub struct ScriptedExchange {
    id: String,
    weights: (u32, u32),
    unordered: bool,
    windowed: bool,
    markets: Mutex<Vec<Symbol>>,
    candles: Mutex<HashMap<(String, Timeframe), Vec<Candle>>>,
    queued_errors: Mutex<VecDeque<SyncError>>,
    always_fail: Mutex<Option<fn() -> SyncError>>,
    broken_symbols: Mutex<HashSet<String>>,
    requests: Mutex<Vec<CandleRequest>>,
    market_calls: AtomicUsize,
}

impl ScriptedExchange {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            weights: (1, 1),
            unordered: false,
            windowed: false,
            markets: Mutex::new(Vec::new()),
            candles: Mutex::new(HashMap::new()),
            queued_errors: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            broken_symbols: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            market_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_weights(mut self, market: u32, candle: u32) -> Self {
        self.weights = (market, candle);
        self
    }

    /// Serve every stored candle in insertion order, ignoring `since` and `limit`.
    pub fn unordered(mut self) -> Self {
        self.unordered = true;
        self
    }

    /// Page by time window like Bybit: each request covers `limit` steps
    /// from `since` and returns only the candles inside that window.
    pub fn windowed(mut self) -> Self {
        self.windowed = true;
        self
    }

    pub fn set_markets(&self, markets: Vec<Symbol>) {
        *self.markets.lock() = markets;
    }

    pub fn insert_candles(&self, symbol: &str, timeframe: Timeframe, candles: &[Candle]) {
        let mut stored = self.candles.lock();
        let series = stored.entry((symbol.to_string(), timeframe)).or_default();
        for c in candles {
            let mut c = c.clone();
            c.exchange = self.id.clone();
            c.symbol = symbol.to_string();
            c.timeframe = timeframe;
            series.push(c);
        }
    }

    /// Fail the next calls, one error per call, in order.
    pub fn fail_next(&self, errors: Vec<SyncError>) {
        self.queued_errors.lock().extend(errors);
    }

    /// Fail every call from now on.
    pub fn always_fail(&self, make: fn() -> SyncError) {
        *self.always_fail.lock() = Some(make);
    }

    /// Answer every candle request for `symbol` with a protocol error.
    pub fn break_symbol(&self, symbol: &str) {
        self.broken_symbols.lock().insert(symbol.to_string());
    }

    pub fn candle_calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn market_calls(&self) -> usize {
        self.market_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CandleRequest> {
        self.requests.lock().clone()
    }

    fn scripted_error(&self) -> Option<SyncError> {
        if let Some(make) = *self.always_fail.lock() {
            return Some(make());
        }
        self.queued_errors.lock().pop_front()
    }
}

#[async_trait]
impl ExchangeApi for ScriptedExchange {
    fn id(&self) -> &str {
        &self.id
    }

    fn market_weight(&self) -> u32 {
        self.weights.0
    }

    fn candle_weight(&self) -> u32 {
        self.weights.1
    }

    fn page_window(&self, timeframe: Timeframe, limit: usize) -> Option<ChronoDuration> {
        self.windowed
            .then(|| ChronoDuration::milliseconds(timeframe.step_millis() * limit as i64))
    }

    async fn list_markets(&self) -> Result<Vec<Symbol>> {
        self.market_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_error() {
            return Err(err);
        }
        Ok(self.markets.lock().clone())
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.requests.lock().push(CandleRequest {
            symbol: symbol.to_string(),
            timeframe,
            since,
            limit,
        });
        if let Some(err) = self.scripted_error() {
            return Err(err);
        }
        if self.broken_symbols.lock().contains(symbol) {
            return Err(SyncError::protocol(format!("unknown symbol {}", symbol)));
        }

        let stored = self.candles.lock();
        let Some(series) = stored.get(&(symbol.to_string(), timeframe)) else {
            return Ok(Vec::new());
        };
        if self.unordered {
            return Ok(series.clone());
        }

        let window_end = self.page_window(timeframe, limit).map(|span| since + span);
        let mut page: Vec<Candle> = series
            .iter()
            .filter(|c| c.open_time >= since && window_end.map_or(true, |end| c.open_time < end))
            .cloned()
            .collect();
        page.sort_by_key(|c| c.open_time);
        page.truncate(limit);
        Ok(page)
    }
}

/// Memory store wrapper that injects store outages.
pub struct FailingStore {
    inner: Arc<MemoryStore>,
    failing_upserts: AtomicUsize,
    broken_symbols: Mutex<HashSet<String>>,
    listing_down: Mutex<bool>,
    upsert_calls: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_upserts: AtomicUsize::new(0),
            broken_symbols: Mutex::new(HashSet::new()),
            listing_down: Mutex::new(false),
            upsert_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` candle upserts with `StoreUnavailable`.
    pub fn fail_next_upserts(&self, n: usize) {
        self.failing_upserts.store(n, Ordering::SeqCst);
    }

    /// Fail every candle upsert touching `symbol`.
    pub fn break_symbol(&self, symbol: &str) {
        self.broken_symbols.lock().insert(symbol.to_string());
    }

    pub fn take_listing_down(&self) {
        *self.listing_down.lock() = true;
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandleStore for FailingStore {
    async fn upsert_symbols(&self, symbols: &[Symbol]) -> Result<usize> {
        self.inner.upsert_symbols(symbols).await
    }

    async fn list_symbols(&self, exchange: &str) -> Result<Vec<Symbol>> {
        if *self.listing_down.lock() {
            return Err(SyncError::store_unavailable("connection refused"));
        }
        self.inner.list_symbols(exchange).await
    }

    async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);

        let pending = self.failing_upserts.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_upserts.store(pending - 1, Ordering::SeqCst);
            return Err(SyncError::store_unavailable("connection reset"));
        }
        let broken = {
            let broken = self.broken_symbols.lock();
            candles.iter().any(|c| broken.contains(&c.symbol))
        };
        if broken {
            return Err(SyncError::store_unavailable("connection reset"));
        }
        self.inner.upsert_candles(candles).await
    }

    async fn query_candle_timestamps(
        &self,
        pair: &PairKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.inner.query_candle_timestamps(pair, from, to).await
    }

    async fn latest_candle(&self, pair: &PairKey) -> Result<Option<Candle>> {
        self.inner.latest_candle(pair).await
    }

    async fn latest_fetched_candle(&self, pair: &PairKey) -> Result<Option<Candle>> {
        self.inner.latest_fetched_candle(pair).await
    }

    async fn candle_before(&self, pair: &PairKey, ts: DateTime<Utc>) -> Result<Option<Candle>> {
        self.inner.candle_before(pair, ts).await
    }
}
