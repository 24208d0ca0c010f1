//! Configuration for the kline sync service.
//!
//! Loaded from environment variables with sensible defaults, or from a TOML
//! file with the same sections. Either way the result goes through
//! [`Config::validate`] before anything is constructed from it.

use crate::errors::{Result, SyncError};
use crate::timeframe::Timeframe;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// What to sync
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// How to talk to the exchange
    #[serde(default)]
    pub exchange: ExchangeConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Long-running mode settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Which series to maintain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Exchange client to use ("binance", "bybit")
    pub exchange_id: String,
    /// Timeframes maintained for every active symbol
    pub timeframes: Vec<Timeframe>,
    /// Max candles requested per fetch call (and per synthesized batch)
    pub batch_limit: usize,
    /// Earliest history boundary
    pub seed_timestamp: DateTime<Utc>,
    /// Max symbol/timeframe pairs processed in parallel
    pub concurrency: usize,
    /// Only markets quoted in this asset are listed (None = all)
    pub quote_filter: Option<String>,
    /// Restrict kline sync to these symbols (None = every active symbol)
    pub only_symbols: Option<Vec<String>>,
}

/// Exchange access settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Override the provider's REST base URL
    pub base_url: Option<String>,
    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
}

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity in request-weight units
    pub capacity: u32,
    /// Units added per second
    pub refill_per_sec: f64,
}

/// Retry policy for transient exchange failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub pool_max: usize,
    pub timeout_secs: u64,
}

/// Settings for the `daemon` subcommand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Health check HTTP server port
    pub health_check_port: u16,
    /// Seconds between symbol syncs
    pub symbols_interval_secs: u64,
    /// Seconds between kline syncs
    pub klines_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_seed() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            exchange_id: "binance".to_string(),
            timeframes: vec![Timeframe::H1, Timeframe::D1],
            batch_limit: 1000,
            seed_timestamp: default_seed(),
            concurrency: 4,
            quote_filter: Some("USDT".to_string()),
            only_symbols: None,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_secs: 30,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // Binance spot: 1200 weight per minute
        Self {
            capacity: 1200,
            refill_per_sec: 20.0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "timescaledb".to_string(),
            port: 5432,
            name: "market".to_string(),
            user: "market".to_string(),
            password: String::new(),
            pool_max: 8,
            timeout_secs: 10,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            health_check_port: 8080,
            symbols_interval_secs: 24 * 3600,
            klines_interval_secs: 20 * 60,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            exchange: ExchangeConfig::default(),
            database: DatabaseConfig::default(),
            daemon: DaemonConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Read `name`, falling back to `default` when unset.
fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read and parse `name`, falling back to `default` when unset.
fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SyncError::config(format!("Invalid {}", name))),
        Err(_) => Ok(default),
    }
}

/// Split a comma-separated list, dropping empty entries.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::config(format!("Invalid timestamp {:?}: {}", raw, e)))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Config::default();

        let timeframes = match env::var("TIMEFRAMES") {
            Ok(raw) => split_list(&raw)
                .iter()
                .map(|s| s.parse())
                .collect::<Result<Vec<Timeframe>>>()?,
            Err(_) => defaults.pipeline.timeframes.clone(),
        };

        let seed_timestamp = match env::var("SEED_TIMESTAMP").or_else(|_| env::var("SINCE_ISO")) {
            Ok(raw) => parse_timestamp(&raw)?,
            Err(_) => defaults.pipeline.seed_timestamp,
        };

        let quote_filter = match env::var("QUOTE_FILTER") {
            Ok(raw) if raw.trim().is_empty() || raw.trim() == "*" => None,
            Ok(raw) => Some(raw.trim().to_uppercase()),
            Err(_) => defaults.pipeline.quote_filter.clone(),
        };

        let config = Self {
            pipeline: PipelineConfig {
                exchange_id: env_or("EXCHANGE_ID", &defaults.pipeline.exchange_id),
                timeframes,
                batch_limit: env_parse("BATCH_LIMIT", defaults.pipeline.batch_limit)?,
                seed_timestamp,
                concurrency: env_parse("SYNC_CONCURRENCY", defaults.pipeline.concurrency)?,
                quote_filter,
                only_symbols: env::var("ONLY_SYMBOLS").ok().map(|raw| split_list(&raw)),
            },

            exchange: ExchangeConfig {
                base_url: env::var("EXCHANGE_BASE_URL").ok(),
                request_timeout_secs: env_parse(
                    "EXCHANGE_TIMEOUT_SECS",
                    defaults.exchange.request_timeout_secs,
                )?,
                rate_limit: RateLimitConfig {
                    capacity: env_parse("RATE_LIMIT_CAPACITY", defaults.exchange.rate_limit.capacity)?,
                    refill_per_sec: env_parse(
                        "RATE_LIMIT_REFILL_PER_SEC",
                        defaults.exchange.rate_limit.refill_per_sec,
                    )?,
                },
                retry: RetryConfig {
                    max_attempts: env_parse("RETRY_MAX_ATTEMPTS", defaults.exchange.retry.max_attempts)?,
                    base_delay_ms: env_parse(
                        "RETRY_BASE_DELAY_MS",
                        defaults.exchange.retry.base_delay_ms,
                    )?,
                    max_delay_ms: env_parse("RETRY_MAX_DELAY_MS", defaults.exchange.retry.max_delay_ms)?,
                },
            },

            database: DatabaseConfig {
                host: env_or("DB_HOST", &defaults.database.host),
                port: env_parse("DB_PORT", defaults.database.port)?,
                name: env_or("DB_NAME", &defaults.database.name),
                user: env_or("DB_USER", &defaults.database.user),
                password: env::var("DB_PASSWORD").unwrap_or_default(),
                pool_max: env_parse("DB_POOL_MAX", defaults.database.pool_max)?,
                timeout_secs: env_parse("DB_TIMEOUT_SECS", defaults.database.timeout_secs)?,
            },

            daemon: DaemonConfig {
                health_check_port: env_parse("HEALTH_CHECK_PORT", defaults.daemon.health_check_port)?,
                symbols_interval_secs: env_parse(
                    "SYMBOLS_SYNC_INTERVAL_SECS",
                    defaults.daemon.symbols_interval_secs,
                )?,
                klines_interval_secs: env_parse(
                    "KLINES_SYNC_INTERVAL_SECS",
                    defaults.daemon.klines_interval_secs,
                )?,
            },

            log_level: env_or("LOG_LEVEL", &defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&content)?;

        // Secrets stay out of config files
        if let Ok(password) = env::var("DB_PASSWORD") {
            config.database.password = password;
        }
        Ok(config)
    }

    /// Parse and validate TOML configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| SyncError::config(format!("Invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.exchange_id.trim().is_empty() {
            return Err(SyncError::config("exchange_id must not be empty"));
        }
        if p.timeframes.is_empty() {
            return Err(SyncError::config("at least one timeframe is required"));
        }
        if p.batch_limit == 0 {
            return Err(SyncError::config("batch_limit must be positive"));
        }
        if p.concurrency == 0 {
            return Err(SyncError::config("concurrency must be positive"));
        }

        let rl = &self.exchange.rate_limit;
        if rl.capacity == 0 || !(rl.refill_per_sec.is_finite() && rl.refill_per_sec > 0.0) {
            return Err(SyncError::config("rate_limit capacity and refill_per_sec must be positive"));
        }

        let retry = &self.exchange.retry;
        if retry.max_attempts == 0 {
            return Err(SyncError::config("retry.max_attempts must be at least 1"));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(SyncError::config("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }

        Ok(())
    }

    /// Timeframes with duplicates removed, in configured order.
    pub fn timeframes(&self) -> Vec<Timeframe> {
        self.pipeline.unique_timeframes()
    }
}

impl PipelineConfig {
    pub fn unique_timeframes(&self) -> Vec<Timeframe> {
        let mut seen = Vec::with_capacity(self.timeframes.len());
        for tf in &self.timeframes {
            if !seen.contains(tf) {
                seen.push(*tf);
            }
        }
        seen
    }
}

impl ExchangeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DatabaseConfig {
    /// Create a deadpool configuration.
    pub fn to_pool_config(&self) -> deadpool_postgres::Config {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.name.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg
    }
}
