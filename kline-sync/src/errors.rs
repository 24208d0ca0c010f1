//! Error types for the kline sync pipeline.
//!
//! Exchange and store failures are classified here so that retry decisions
//! and per-pair failure reporting can be made without inspecting messages.

use thiserror::Error;

/// Main error type for the sync pipeline.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure or 5xx response from the exchange (transient)
    #[error("Exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    /// The exchange signalled throttling, e.g. HTTP 429 (transient)
    #[error("Rate limited by exchange: {0}")]
    RateLimited(String),

    /// Malformed or unexpected exchange response (permanent for the call)
    #[error("Exchange protocol error: {0}")]
    ExchangeProtocol(String),

    /// Store connectivity loss
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A batch the store refused as a whole
    #[error("Invalid candle batch: {0}")]
    InvalidBatch(String),

    /// Database query errors
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Database pool errors
    #[error("Database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// JSON parsing errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The run was cancelled before the operation could start
    #[error("Cancelled")]
    Cancelled,

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an exchange-unavailable error with a message.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ExchangeUnavailable(msg.into())
    }

    /// Create a rate-limited error with a message.
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create an exchange protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ExchangeProtocol(msg.into())
    }

    /// Create a store-unavailable error with a message.
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create an invalid-batch error with a message.
    pub fn invalid_batch(msg: impl Into<String>) -> Self {
        Self::InvalidBatch(msg.into())
    }

    /// Whether the exchange call that produced this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ExchangeUnavailable(_) | Self::RateLimited(_))
    }

    /// Whether this error means the store could not be reached.
    ///
    /// Pool checkout failures and closed connections count; constraint
    /// violations and bad SQL do not.
    pub fn is_store_connectivity(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) | Self::Pool(_) => true,
            Self::Database(e) => e.is_closed() || e.code().is_none(),
            _ => false,
        }
    }

    /// Short, stable label used in logs and run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExchangeUnavailable(_) => "exchange_unavailable",
            Self::RateLimited(_) => "rate_limited",
            Self::ExchangeProtocol(_) | Self::Json(_) => "exchange_protocol",
            Self::StoreUnavailable(_) | Self::Pool(_) => "store_unavailable",
            Self::Database(_) => "database",
            Self::InvalidBatch(_) => "invalid_batch",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
        }
    }
}

/// Result type alias using SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;
