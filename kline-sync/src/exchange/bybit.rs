//! Bybit v5 spot REST client.

use super::{get_text, parse_millis, parse_price, ExchangeApi};
use crate::errors::{Result, SyncError};
use crate::models::{Candle, Provenance, Symbol};
use crate::timeframe::Timeframe;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.bybit.com";

/// Maximum klines per request.
const MAX_KLINES_LIMIT: usize = 1000;

/// retCodes Bybit uses for throttling.
const RATE_LIMIT_CODES: [i64; 2] = [10006, 10018];

/// Standard v5 envelope. `result` is decoded only once retCode is known to be 0.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instrument {
    symbol: String,
    base_coin: String,
    quote_coin: String,
    status: String,
}

/// Bybit interval parameter, `None` where Bybit has no such interval.
fn interval(timeframe: Timeframe) -> Option<&'static str> {
    match timeframe {
        Timeframe::M1 => Some("1"),
        Timeframe::M3 => Some("3"),
        Timeframe::M5 => Some("5"),
        Timeframe::M15 => Some("15"),
        Timeframe::M30 => Some("30"),
        Timeframe::H1 => Some("60"),
        Timeframe::H2 => Some("120"),
        Timeframe::H4 => Some("240"),
        Timeframe::H6 => Some("360"),
        Timeframe::H8 => None,
        Timeframe::H12 => Some("720"),
        Timeframe::D1 => Some("D"),
        Timeframe::W1 => Some("W"),
    }
}

/// Unwrap the envelope, mapping non-zero retCodes.
fn open_envelope<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| SyncError::protocol(format!("malformed Bybit response: {}", e)))?;

    if RATE_LIMIT_CODES.contains(&envelope.ret_code) {
        return Err(SyncError::rate_limited(format!(
            "retCode {}: {}",
            envelope.ret_code, envelope.ret_msg
        )));
    }
    if envelope.ret_code != 0 {
        return Err(SyncError::protocol(format!(
            "retCode {}: {}",
            envelope.ret_code, envelope.ret_msg
        )));
    }
    if envelope.result.is_null() {
        return Err(SyncError::protocol("Bybit response without result"));
    }
    serde_json::from_value(envelope.result)
        .map_err(|e| SyncError::protocol(format!("unexpected Bybit result: {}", e)))
}

fn parse_instruments(body: &str) -> Result<Vec<Symbol>> {
    let result: ListResult<Instrument> = open_envelope(body)?;
    Ok(result
        .list
        .into_iter()
        .map(|i| Symbol {
            exchange: "bybit".to_string(),
            symbol: i.symbol,
            base: i.base_coin,
            quote: i.quote_coin,
            active: i.status == "Trading",
            listed_at: None,
        })
        .collect())
}

/// Rows are `[start, open, high, low, close, volume, turnover]`, newest first.
fn parse_klines(body: &str, symbol: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
    let result: ListResult<Vec<String>> = open_envelope(body)?;

    let mut candles = result
        .list
        .into_iter()
        .map(|row| {
            if row.len() < 7 {
                return Err(SyncError::protocol(format!("short kline row: {:?}", row)));
            }
            let start: i64 = row[0]
                .parse()
                .map_err(|_| SyncError::protocol(format!("invalid start time {:?}", row[0])))?;
            Ok(Candle {
                exchange: "bybit".to_string(),
                symbol: symbol.to_string(),
                timeframe,
                open_time: parse_millis(start)?,
                open: parse_price(&row[1], "open")?,
                high: parse_price(&row[2], "high")?,
                low: parse_price(&row[3], "low")?,
                close: parse_price(&row[4], "close")?,
                volume: parse_price(&row[5], "volume")?,
                trades: None,
                quote_volume: Some(parse_price(&row[6], "turnover")?),
                provenance: Provenance::Fetched,
            })
        })
        .collect::<Result<Vec<Candle>>>()?;

    candles.reverse();
    Ok(candles)
}

/// Bybit spot market data.
pub struct BybitApi {
    http: reqwest::Client,
    base_url: String,
}

impl BybitApi {
    pub fn new(http: reqwest::Client, base_url: Option<String>) -> Self {
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self { http, base_url }
    }
}

#[async_trait]
impl ExchangeApi for BybitApi {
    fn id(&self) -> &str {
        "bybit"
    }

    fn max_batch_limit(&self) -> usize {
        MAX_KLINES_LIMIT
    }

    fn supports(&self, timeframe: Timeframe) -> bool {
        interval(timeframe).is_some()
    }

    /// Requests are bounded by `end`, so a page covers a fixed stretch of time
    /// and comes back short or empty wherever the exchange has no candles.
    fn page_window(&self, timeframe: Timeframe, limit: usize) -> Option<ChronoDuration> {
        Some(ChronoDuration::milliseconds(
            timeframe.step_millis() * limit.min(MAX_KLINES_LIMIT) as i64,
        ))
    }

    async fn list_markets(&self) -> Result<Vec<Symbol>> {
        let url = format!("{}/v5/market/instruments-info", self.base_url);
        let body = get_text(&self.http, &url, &[("category", "spot".to_string())]).await?;
        let symbols = parse_instruments(&body)?;
        debug!("Bybit listed {} spot markets", symbols.len());
        Ok(symbols)
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let interval = interval(timeframe)
            .ok_or_else(|| SyncError::config(format!("Bybit does not offer {} candles", timeframe)))?;
        let limit = limit.min(MAX_KLINES_LIMIT);

        // Without an end bound Bybit pages backwards from now.
        let window = self.page_window(timeframe, limit).unwrap_or_else(ChronoDuration::zero);
        let end = (since + window).timestamp_millis() - 1;

        let url = format!("{}/v5/market/kline", self.base_url);
        let query = [
            ("category", "spot".to_string()),
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("start", since.timestamp_millis().to_string()),
            ("end", end.to_string()),
            ("limit", limit.to_string()),
        ];
        let body = get_text(&self.http, &url, &query).await?;
        parse_klines(&body, symbol, timeframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_klines_reverses_to_ascending() {
        let body = r#"{
            "retCode": 0, "retMsg": "OK",
            "result": {"category": "spot", "symbol": "BTCUSDT", "list": [
                ["1704070800000", "42475.2", "42775", "42431.6", "42613.5", "10.5", "447000.1"],
                ["1704067200000", "42283.5", "42554.5", "42261", "42475.2", "12.25", "519000.9"]
            ]}
        }"#;

        let candles = parse_klines(body, "BTCUSDT", Timeframe::H1).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(candles[1].open_time, Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap());
        assert_eq!(candles[0].volume, 12.25);
        assert_eq!(candles[0].exchange, "bybit");
        assert!(candles[0].trades.is_none());
    }

    #[test]
    fn test_ret_codes() {
        let throttled = r#"{"retCode": 10006, "retMsg": "Too many visits!", "result": {}}"#;
        assert!(matches!(
            parse_klines(throttled, "BTCUSDT", Timeframe::H1),
            Err(SyncError::RateLimited(_))
        ));

        let invalid = r#"{"retCode": 10001, "retMsg": "params error", "result": {}}"#;
        assert!(matches!(
            parse_klines(invalid, "BTCUSDT", Timeframe::H1),
            Err(SyncError::ExchangeProtocol(_))
        ));
    }

    #[test]
    fn test_parse_instruments() {
        let body = r#"{
            "retCode": 0, "retMsg": "OK",
            "result": {"category": "spot", "list": [
                {"symbol": "BTCUSDT", "baseCoin": "BTC", "quoteCoin": "USDT", "status": "Trading"},
                {"symbol": "OLDUSDT", "baseCoin": "OLD", "quoteCoin": "USDT", "status": "Closed"}
            ]}
        }"#;

        let symbols = parse_instruments(body).unwrap();
        assert_eq!(symbols.len(), 2);
        assert!(symbols[0].active);
        assert!(!symbols[1].active);
        assert_eq!(symbols[1].quote, "USDT");
    }

    #[test]
    fn test_interval_mapping() {
        assert_eq!(interval(Timeframe::H1), Some("60"));
        assert_eq!(interval(Timeframe::D1), Some("D"));
        assert_eq!(interval(Timeframe::H8), None);
    }

    #[test]
    fn test_supported_timeframes_and_window() {
        let api = BybitApi::new(reqwest::Client::new(), None);
        assert!(api.supports(Timeframe::M1));
        assert!(!api.supports(Timeframe::H8));
        assert_eq!(
            api.page_window(Timeframe::M1, 200),
            Some(ChronoDuration::minutes(200))
        );
        assert_eq!(
            api.page_window(Timeframe::H1, 5000),
            Some(ChronoDuration::hours(1000))
        );
    }
}
