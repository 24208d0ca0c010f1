//! PostgreSQL / TimescaleDB store.
//!
//! Expected tables:
//!
//! ```sql
//! CREATE TABLE symbols (
//!     exchange   TEXT        NOT NULL,
//!     symbol     TEXT        NOT NULL,
//!     base       TEXT        NOT NULL,
//!     quote      TEXT        NOT NULL,
//!     active     BOOLEAN     NOT NULL,
//!     listed_at  TIMESTAMPTZ,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (exchange, symbol)
//! );
//!
//! CREATE TABLE candles (
//!     exchange     TEXT        NOT NULL,
//!     symbol       TEXT        NOT NULL,
//!     timeframe    TEXT        NOT NULL,
//!     open_time    TIMESTAMPTZ NOT NULL,
//!     open         NUMERIC     NOT NULL,
//!     high         NUMERIC     NOT NULL,
//!     low          NUMERIC     NOT NULL,
//!     close        NUMERIC     NOT NULL,
//!     volume       NUMERIC     NOT NULL,
//!     trades       BIGINT,
//!     quote_volume NUMERIC,
//!     provenance   TEXT        NOT NULL,
//!     PRIMARY KEY (exchange, symbol, timeframe, open_time)
//! );
//! SELECT create_hypertable('candles', 'open_time');
//! ```

use super::CandleStore;
use crate::config::DatabaseConfig;
use crate::errors::{Result, SyncError};
use crate::models::{Candle, PairKey, Provenance, Symbol};
use crate::timeframe::Timeframe;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::{types::ToSql, NoTls, Row};
use tracing::{debug, info};

const UPSERT_SYMBOL_SQL: &str = r#"
    INSERT INTO symbols (exchange, symbol, base, quote, active, listed_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, NOW())
    ON CONFLICT (exchange, symbol) DO UPDATE SET
        base = EXCLUDED.base,
        quote = EXCLUDED.quote,
        active = EXCLUDED.active,
        listed_at = COALESCE(EXCLUDED.listed_at, symbols.listed_at),
        updated_at = NOW()
"#;

/// Fetched rows always win; synthesized rows only fill holes or replace
/// other synthesized rows. Nullable columns of a fetched row keep their value
/// unless the incoming row carries one.
const UPSERT_CANDLE_SQL: &str = r#"
    INSERT INTO candles (
        exchange, symbol, timeframe, open_time,
        open, high, low, close, volume,
        trades, quote_volume, provenance
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    ON CONFLICT (exchange, symbol, timeframe, open_time) DO UPDATE SET
        open = EXCLUDED.open,
        high = EXCLUDED.high,
        low = EXCLUDED.low,
        close = EXCLUDED.close,
        volume = EXCLUDED.volume,
        trades = CASE WHEN candles.provenance = 'synthesized' THEN EXCLUDED.trades
                      ELSE COALESCE(EXCLUDED.trades, candles.trades) END,
        quote_volume = CASE WHEN candles.provenance = 'synthesized' THEN EXCLUDED.quote_volume
                            ELSE COALESCE(EXCLUDED.quote_volume, candles.quote_volume) END,
        provenance = EXCLUDED.provenance
    WHERE
        NOT (candles.provenance = 'fetched' AND EXCLUDED.provenance = 'synthesized')
        AND (
            candles.open IS DISTINCT FROM EXCLUDED.open OR
            candles.high IS DISTINCT FROM EXCLUDED.high OR
            candles.low IS DISTINCT FROM EXCLUDED.low OR
            candles.close IS DISTINCT FROM EXCLUDED.close OR
            candles.volume IS DISTINCT FROM EXCLUDED.volume OR
            candles.provenance IS DISTINCT FROM EXCLUDED.provenance OR
            (EXCLUDED.trades IS NOT NULL AND candles.trades IS DISTINCT FROM EXCLUDED.trades) OR
            (EXCLUDED.quote_volume IS NOT NULL AND candles.quote_volume IS DISTINCT FROM EXCLUDED.quote_volume)
        )
"#;

const CANDLE_COLUMNS: &str = "exchange, symbol, timeframe, open_time, open, high, low, close, volume, \
                              trades, quote_volume, provenance";

/// Candle and symbol persistence over a deadpool connection pool.
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Build the pool and verify connectivity with `SELECT 1`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pg_config = config
            .to_pool_config()
            .get_pg_config()
            .map_err(|e| SyncError::config(format!("Invalid PG config: {}", e)))?;

        let mgr = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );

        let timeout = Some(Duration::from_secs(config.timeout_secs));
        let pool = Pool::builder(mgr)
            .max_size(config.pool_max)
            .wait_timeout(timeout)
            .create_timeout(timeout)
            .recycle_timeout(timeout)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| SyncError::config(format!("Failed to create pool: {}", e)))?;

        let client = pool.get().await.map_err(classify)?;
        client.simple_query("SELECT 1").await.map_err(classify)?;
        info!(
            "Database connection pool established ({}:{}/{})",
            config.host, config.port, config.name
        );

        Ok(Self { pool })
    }

    async fn query_one_candle(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Option<Candle>> {
        let client = self.pool.get().await.map_err(classify)?;
        let row = client.query_opt(sql, params).await.map_err(classify)?;
        row.as_ref().map(candle_from_row).transpose()
    }
}

/// Surface connectivity problems as `StoreUnavailable`, leave the rest as is.
fn classify(err: impl Into<SyncError>) -> SyncError {
    let err = err.into();
    if err.is_store_connectivity() {
        SyncError::store_unavailable(err.to_string())
    } else {
        err
    }
}

fn to_decimal(value: f64, field: &str) -> Result<Decimal> {
    Decimal::from_str(&format!("{:.8}", value))
        .map_err(|e| SyncError::invalid_batch(format!("{} {} not representable: {}", field, value, e)))
}

fn from_decimal(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

fn candle_from_row(row: &Row) -> Result<Candle> {
    let timeframe: String = row.try_get("timeframe")?;
    let provenance: String = row.try_get("provenance")?;
    let quote_volume: Option<Decimal> = row.try_get("quote_volume")?;

    Ok(Candle {
        exchange: row.try_get("exchange")?,
        symbol: row.try_get("symbol")?,
        timeframe: Timeframe::from_str(&timeframe)?,
        open_time: row.try_get("open_time")?,
        open: from_decimal(row.try_get("open")?),
        high: from_decimal(row.try_get("high")?),
        low: from_decimal(row.try_get("low")?),
        close: from_decimal(row.try_get("close")?),
        volume: from_decimal(row.try_get("volume")?),
        trades: row.try_get("trades")?,
        quote_volume: quote_volume.map(from_decimal),
        provenance: Provenance::parse(&provenance)
            .ok_or_else(|| SyncError::invalid_batch(format!("unknown provenance {:?}", provenance)))?,
    })
}

fn symbol_from_row(row: &Row) -> Result<Symbol> {
    Ok(Symbol {
        exchange: row.try_get("exchange")?,
        symbol: row.try_get("symbol")?,
        base: row.try_get("base")?,
        quote: row.try_get("quote")?,
        active: row.try_get("active")?,
        listed_at: row.try_get("listed_at")?,
    })
}

/// Bound parameters for one candle row, converted ahead of the transaction.
struct CandleParams<'a> {
    candle: &'a Candle,
    timeframe: &'static str,
    provenance: &'static str,
    prices: [Decimal; 5],
    quote_volume: Option<Decimal>,
}

impl<'a> CandleParams<'a> {
    fn new(candle: &'a Candle) -> Result<Self> {
        if let Some(reason) = candle.validation_error() {
            return Err(SyncError::invalid_batch(reason));
        }
        Ok(Self {
            candle,
            timeframe: candle.timeframe.as_str(),
            provenance: candle.provenance.as_str(),
            prices: [
                to_decimal(candle.open, "open")?,
                to_decimal(candle.high, "high")?,
                to_decimal(candle.low, "low")?,
                to_decimal(candle.close, "close")?,
                to_decimal(candle.volume, "volume")?,
            ],
            quote_volume: candle
                .quote_volume
                .map(|v| to_decimal(v, "quote_volume"))
                .transpose()?,
        })
    }

    fn as_params(&self) -> [&(dyn ToSql + Sync); 12] {
        [
            &self.candle.exchange,
            &self.candle.symbol,
            &self.timeframe,
            &self.candle.open_time,
            &self.prices[0],
            &self.prices[1],
            &self.prices[2],
            &self.prices[3],
            &self.prices[4],
            &self.candle.trades,
            &self.quote_volume,
            &self.provenance,
        ]
    }
}

#[async_trait]
impl CandleStore for PostgresStore {
    async fn upsert_symbols(&self, symbols: &[Symbol]) -> Result<usize> {
        if symbols.is_empty() {
            return Ok(0);
        }

        let mut client = self.pool.get().await.map_err(classify)?;
        let tx = client.transaction().await.map_err(classify)?;
        let statement = tx.prepare(UPSERT_SYMBOL_SQL).await.map_err(classify)?;

        for s in symbols {
            tx.execute(
                &statement,
                &[&s.exchange, &s.symbol, &s.base, &s.quote, &s.active, &s.listed_at],
            )
            .await
            .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(symbols.len())
    }

    async fn list_symbols(&self, exchange: &str) -> Result<Vec<Symbol>> {
        let client = self.pool.get().await.map_err(classify)?;
        let rows = client
            .query(
                "SELECT exchange, symbol, base, quote, active, listed_at \
                 FROM symbols WHERE exchange = $1 ORDER BY symbol",
                &[&exchange],
            )
            .await
            .map_err(classify)?;

        rows.iter().map(symbol_from_row).collect()
    }

    async fn upsert_candles(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        // Convert first so a bad value fails the batch before any I/O.
        let rows = candles.iter().map(CandleParams::new).collect::<Result<Vec<_>>>()?;

        let mut client = self.pool.get().await.map_err(classify)?;
        let tx = client.transaction().await.map_err(classify)?;
        let statement = tx.prepare(UPSERT_CANDLE_SQL).await.map_err(classify)?;

        let mut written = 0u64;
        for row in &rows {
            written += tx.execute(&statement, &row.as_params()).await.map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        debug!("Upserted {} candles ({} changed)", candles.len(), written);
        Ok(written as usize)
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

        let client = self.pool.get().await.map_err(classify)?;
        let rows = client
            .query(
                "SELECT open_time FROM candles \
                 WHERE exchange = $1 AND symbol = $2 AND timeframe = $3 \
                   AND open_time >= $4 AND open_time < $5 \
                 ORDER BY open_time",
                &[&pair.exchange, &pair.symbol, &pair.timeframe.as_str(), &from, &to],
            )
            .await
            .map_err(classify)?;

        rows.iter()
            .map(|r| r.try_get::<_, DateTime<Utc>>(0).map_err(SyncError::from))
            .collect()
    }

    async fn latest_candle(&self, pair: &PairKey) -> Result<Option<Candle>> {
        let sql = format!(
            "SELECT {} FROM candles WHERE exchange = $1 AND symbol = $2 AND timeframe = $3 \
             ORDER BY open_time DESC LIMIT 1",
            CANDLE_COLUMNS
        );
        self.query_one_candle(&sql, &[&pair.exchange, &pair.symbol, &pair.timeframe.as_str()])
            .await
    }

    async fn latest_fetched_candle(&self, pair: &PairKey) -> Result<Option<Candle>> {
        let sql = format!(
            "SELECT {} FROM candles WHERE exchange = $1 AND symbol = $2 AND timeframe = $3 \
             AND provenance = 'fetched' ORDER BY open_time DESC LIMIT 1",
            CANDLE_COLUMNS
        );
        self.query_one_candle(&sql, &[&pair.exchange, &pair.symbol, &pair.timeframe.as_str()])
            .await
    }

    async fn candle_before(&self, pair: &PairKey, ts: DateTime<Utc>) -> Result<Option<Candle>> {
        let sql = format!(
            "SELECT {} FROM candles WHERE exchange = $1 AND symbol = $2 AND timeframe = $3 \
             AND open_time < $4 ORDER BY open_time DESC LIMIT 1",
            CANDLE_COLUMNS
        );
        self.query_one_candle(&sql, &[&pair.exchange, &pair.symbol, &pair.timeframe.as_str(), &ts])
            .await
    }

    async fn ping(&self) -> bool {
        match self.pool.get().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }
}
