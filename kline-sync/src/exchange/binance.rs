//! Binance spot REST client.
//!
//! Endpoints:
//! - `GET /api/v3/exchangeInfo`: market listing (weight 20)
//! - `GET /api/v3/klines`: candlesticks (weight 2)

use super::{get_text, parse_millis, parse_price, ExchangeApi};
use crate::errors::{Result, SyncError};
use crate::models::{Candle, Provenance, Symbol};
use crate::timeframe::Timeframe;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Maximum klines per request.
const MAX_KLINES_LIMIT: usize = 1000;

/// Exchange info response (only the fields we use).
#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<BinanceSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceSymbol {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default = "default_true")]
    is_spot_trading_allowed: bool,
}

fn default_true() -> bool {
    true
}

/// One row of the klines array response.
#[derive(Debug, Deserialize)]
struct BinanceKline(
    i64,               // open time
    String,            // open
    String,            // high
    String,            // low
    String,            // close
    String,            // volume
    i64,               // close time
    String,            // quote asset volume
    i64,               // number of trades
    String,            // taker buy base volume
    String,            // taker buy quote volume
    serde_json::Value, // unused
);

/// Binance spot market data.
pub struct BinanceApi {
    http: reqwest::Client,
    base_url: String,
}

impl BinanceApi {
    pub fn new(http: reqwest::Client, base_url: Option<String>) -> Self {
        let base_url = base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Self { http, base_url }
    }

    fn to_symbol(&self, raw: BinanceSymbol) -> Option<Symbol> {
        if !raw.is_spot_trading_allowed {
            return None;
        }
        Some(Symbol {
            exchange: self.id().to_string(),
            symbol: raw.symbol,
            base: raw.base_asset,
            quote: raw.quote_asset,
            active: raw.status == "TRADING",
            listed_at: None,
        })
    }
}

/// Decode an exchangeInfo body.
fn parse_exchange_info(body: &str) -> Result<Vec<BinanceSymbol>> {
    let info: ExchangeInfo = serde_json::from_str(body)
        .map_err(|e| SyncError::protocol(format!("malformed exchangeInfo: {}", e)))?;
    Ok(info.symbols)
}

/// Decode a klines body into candles for `symbol`/`timeframe`.
fn parse_klines(body: &str, symbol: &str, timeframe: Timeframe) -> Result<Vec<Candle>> {
    let rows: Vec<BinanceKline> =
        serde_json::from_str(body).map_err(|e| SyncError::protocol(format!("malformed klines: {}", e)))?;

    rows.into_iter()
        .map(|row| {
            let open_time = parse_millis(row.0)?;
            if !timeframe.is_aligned(open_time) {
                return Err(SyncError::protocol(format!(
                    "kline open time {} is not on the {} grid",
                    open_time, timeframe
                )));
            }
            Ok(Candle {
                exchange: "binance".to_string(),
                symbol: symbol.to_string(),
                timeframe,
                open_time,
                open: parse_price(&row.1, "open")?,
                high: parse_price(&row.2, "high")?,
                low: parse_price(&row.3, "low")?,
                close: parse_price(&row.4, "close")?,
                volume: parse_price(&row.5, "volume")?,
                trades: Some(row.8),
                quote_volume: Some(parse_price(&row.7, "quote volume")?),
                provenance: Provenance::Fetched,
            })
        })
        .collect()
}

#[async_trait]
impl ExchangeApi for BinanceApi {
    fn id(&self) -> &str {
        "binance"
    }

    fn market_weight(&self) -> u32 {
        20
    }

    fn candle_weight(&self) -> u32 {
        2
    }

    fn max_batch_limit(&self) -> usize {
        MAX_KLINES_LIMIT
    }

    async fn list_markets(&self) -> Result<Vec<Symbol>> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let body = get_text(&self.http, &url, &[]).await?;

        let symbols: Vec<Symbol> = parse_exchange_info(&body)?
            .into_iter()
            .filter_map(|raw| self.to_symbol(raw))
            .collect();

        debug!("Binance listed {} spot markets", symbols.len());
        Ok(symbols)
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let query = [
            ("symbol", symbol.to_string()),
            ("interval", timeframe.as_str().to_string()),
            ("startTime", since.timestamp_millis().to_string()),
            ("limit", limit.min(MAX_KLINES_LIMIT).to_string()),
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
    fn test_parse_klines() {
        let body = r#"[
            [1704067200000, "42283.58", "42554.57", "42261.02", "42475.23", "1271.68108",
             1704070799999, "53957248.97", 47134, "682.57581", "28957416.82", "0"],
            [1704070800000, "42475.23", "42775.00", "42431.65", "42613.56", "1196.37856",
             1704074399999, "50984893.05", 44381, "581.34561", "24774491.85", "0"]
        ]"#;

        let candles = parse_klines(body, "BTCUSDT", Timeframe::H1).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(candles[0].close, 42475.23);
        assert_eq!(candles[0].trades, Some(47134));
        assert_eq!(candles[1].volume, 1196.37856);
        assert_eq!(candles[1].provenance, Provenance::Fetched);
        assert_eq!(candles[1].exchange, "binance");
    }

    #[test]
    fn test_malformed_klines_are_protocol_errors() {
        assert!(matches!(
            parse_klines("{\"code\": -1121}", "BTCUSDT", Timeframe::H1),
            Err(SyncError::ExchangeProtocol(_))
        ));

        let bad_price = r#"[[1704067200000, "x", "1", "1", "1", "1", 0, "1", 1, "1", "1", "0"]]"#;
        assert!(matches!(
            parse_klines(bad_price, "BTCUSDT", Timeframe::H1),
            Err(SyncError::ExchangeProtocol(_))
        ));

        let off_grid = r#"[[1704067260000, "1", "1", "1", "1", "1", 0, "1", 1, "1", "1", "0"]]"#;
        assert!(parse_klines(off_grid, "BTCUSDT", Timeframe::H1).is_err());
    }

    #[test]
    fn test_parse_exchange_info() {
        let body = r#"{
            "timezone": "UTC",
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT",
                 "isSpotTradingAllowed": true},
                {"symbol": "LUNAUSDT", "status": "BREAK", "baseAsset": "LUNA", "quoteAsset": "USDT",
                 "isSpotTradingAllowed": true},
                {"symbol": "XYZUSDT", "status": "TRADING", "baseAsset": "XYZ", "quoteAsset": "USDT",
                 "isSpotTradingAllowed": false}
            ]
        }"#;

        let api = BinanceApi::new(reqwest::Client::new(), None);
        let symbols: Vec<Symbol> = parse_exchange_info(body)
            .unwrap()
            .into_iter()
            .filter_map(|raw| api.to_symbol(raw))
            .collect();

        assert_eq!(symbols.len(), 2);
        assert!(symbols[0].active);
        assert_eq!(symbols[0].base, "BTC");
        assert!(!symbols[1].active);
    }

    #[test]
    fn test_base_url_override() {
        let api = BinanceApi::new(reqwest::Client::new(), Some("http://localhost:9000/".to_string()));
        assert_eq!(api.base_url, "http://localhost:9000");
    }
}
