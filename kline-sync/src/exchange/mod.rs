//! Exchange access.
//!
//! Each provider implements [`ExchangeApi`] with plain, single-shot requests.
//! [`ExchangeClient`] wraps whichever provider the configuration selects and
//! adds the shared concerns: the rate limiter, retry with backoff for
//! transient failures, and normalisation of returned pages.

pub mod binance;
pub mod bybit;
pub mod retry;

pub use binance::BinanceApi;
pub use bybit::BybitApi;
pub use retry::{Backoff, RetryPolicy};

use crate::clock::Clock;
use crate::config::Config;
use crate::errors::{Result, SyncError};
use crate::models::{Candle, Symbol};
use crate::rate_limiter::RateLimiter;
use crate::timeframe::Timeframe;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// One exchange's market data endpoints, without throttling or retries.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Exchange identifier stored alongside every row ("binance", ...).
    fn id(&self) -> &str;

    /// Rate-limit weight of a market listing request.
    fn market_weight(&self) -> u32 {
        1
    }

    /// Rate-limit weight of a candle request.
    fn candle_weight(&self) -> u32 {
        1
    }

    /// Largest page the endpoint serves.
    fn max_batch_limit(&self) -> usize {
        1000
    }

    /// Whether the exchange serves candles for `timeframe`.
    fn supports(&self, _timeframe: Timeframe) -> bool {
        true
    }

    /// Time span covered by one candle request, for exchanges that page by
    /// window rather than by count. `None` means "the first `limit` candles
    /// at or after `since`", wherever they are.
    fn page_window(&self, _timeframe: Timeframe, _limit: usize) -> Option<ChronoDuration> {
        None
    }

    /// Spot markets currently listed.
    async fn list_markets(&self) -> Result<Vec<Symbol>>;

    /// Up to `limit` candles with `open_time >= since`, restricted to
    /// `[since, since + window)` when [`page_window`](Self::page_window) is set.
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}

/// Request counters for one client.
#[derive(Debug, Default)]
pub struct ClientStats {
    requests: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl ClientStats {
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Rate-limited, retrying front for one exchange.
pub struct ExchangeClient {
    api: Arc<dyn ExchangeApi>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    stats: ClientStats,
}

impl ExchangeClient {
    /// Wrap `api`. Fails if any of its request weights exceed the bucket capacity.
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        limiter.check_weight(api.market_weight())?;
        limiter.check_weight(api.candle_weight())?;

        Ok(Self {
            api,
            limiter,
            retry,
            clock,
            stats: ClientStats::default(),
        })
    }

    /// Build the provider named by `pipeline.exchange_id` with its limiter and retry policy.
    /// Fails if the provider cannot serve one of the configured timeframes.
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let api = build_api(config)?;
        if let Some(tf) = config.timeframes().into_iter().find(|tf| !api.supports(*tf)) {
            return Err(SyncError::config(format!(
                "{} does not offer {} candles",
                api.id(),
                tf
            )));
        }
        let limiter = Arc::new(RateLimiter::new(&config.exchange.rate_limit)?);
        let retry = RetryPolicy::from_config(&config.exchange.retry);
        Self::new(api, limiter, retry, clock)
    }

    pub fn id(&self) -> &str {
        self.api.id()
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn max_batch_limit(&self) -> usize {
        self.api.max_batch_limit()
    }

    /// Span of one `fetch_candles` request for `limit`, if the provider pages by window.
    pub fn page_window(&self, timeframe: Timeframe, limit: usize) -> Option<ChronoDuration> {
        self.api.page_window(timeframe, limit.clamp(1, self.api.max_batch_limit()))
    }

    /// List spot markets, retrying transient failures.
    pub async fn list_markets(&self) -> Result<Vec<Symbol>> {
        let weight = self.api.market_weight();
        self.call("list_markets", weight, || self.api.list_markets()).await
    }

    /// Fetch candles ascending by open time, all `>= since`, at most `limit`.
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let limit = limit.clamp(1, self.api.max_batch_limit());
        let weight = self.api.candle_weight();

        let mut candles = self
            .call("fetch_candles", weight, || {
                self.api.fetch_candles(symbol, timeframe, since, limit)
            })
            .await?;

        candles.retain(|c| c.open_time >= since);
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        candles.truncate(limit);

        debug!(
            "Fetched {} {} {} candles since {}",
            candles.len(),
            symbol,
            timeframe,
            since
        );
        Ok(candles)
    }

    async fn call<T, F, Fut>(&self, op: &str, weight: u32, mut request: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.retry.start();

        loop {
            self.limiter.acquire(weight).await;
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            match request().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "{} {} attempt {} failed: {}; retrying in {:?}",
                            self.api.id(),
                            op,
                            backoff.failures(),
                            e,
                            delay
                        );
                        self.clock.sleep(delay).await;
                    }
                    None => {
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "{} {} giving up after {} attempts: {}",
                            self.api.id(),
                            op,
                            backoff.failures(),
                            e
                        );
                        return Err(e);
                    }
                },
                Err(e) => {
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }
}

/// Select the provider implementation for `pipeline.exchange_id`.
pub fn build_api(config: &Config) -> Result<Arc<dyn ExchangeApi>> {
    let http = reqwest::Client::builder()
        .timeout(config.exchange.request_timeout())
        .user_agent(concat!("kline-sync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SyncError::config(format!("Failed to build HTTP client: {}", e)))?;
    let base_url = config.exchange.base_url.clone();

    match config.pipeline.exchange_id.to_lowercase().as_str() {
        "binance" => Ok(Arc::new(BinanceApi::new(http, base_url))),
        "bybit" => Ok(Arc::new(BybitApi::new(http, base_url))),
        other => Err(SyncError::config(format!("Unsupported exchange: {}", other))),
    }
}

/// Map a transport-level failure onto the exchange error taxonomy.
pub(crate) fn map_transport_error(err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::protocol(format!("undecodable response: {}", err))
    } else {
        SyncError::unavailable(err.to_string())
    }
}

/// Map a non-success HTTP status onto the exchange error taxonomy.
pub(crate) fn map_status(status: StatusCode, body: &str) -> SyncError {
    let snippet: String = body.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        SyncError::rate_limited(format!("HTTP {}: {}", status, snippet))
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        SyncError::unavailable(format!("HTTP {}: {}", status, snippet))
    } else {
        SyncError::protocol(format!("HTTP {}: {}", status, snippet))
    }
}

/// GET `url` and return the body of a successful response.
pub(crate) async fn get_text(http: &reqwest::Client, url: &str, query: &[(&str, String)]) -> Result<String> {
    let response = http
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(map_transport_error)?;

    let status = response.status();
    let body = response.text().await.map_err(map_transport_error)?;

    if !status.is_success() {
        return Err(map_status(status, &body));
    }
    Ok(body)
}

/// Parse a decimal string field from an exchange payload.
pub(crate) fn parse_price(raw: &str, field: &str) -> Result<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SyncError::protocol(format!("invalid {} value {:?}", field, raw)))
}

/// Convert epoch milliseconds from an exchange payload.
pub(crate) fn parse_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| SyncError::protocol(format!("timestamp out of range: {}", ms)))
}
