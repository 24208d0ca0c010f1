//! Kline Sync Library
//!
//! Components for keeping exchange symbol metadata and gap-free OHLCV
//! candle series synchronized into TimescaleDB.

pub mod clock;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod health;
pub mod models;
pub mod pipeline;
pub mod rate_limiter;
pub mod store;
pub mod sync;
pub mod timeframe;

#[cfg(test)]
mod testing;

pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use errors::{Result, SyncError};
pub use exchange::{ExchangeApi, ExchangeClient};
pub use health::{HealthResponse, HealthState, HealthStatus};
pub use models::{Candle, Gap, PairKey, Provenance, Symbol};
pub use pipeline::{Orchestrator, RunMode, RunState, RunSummary};
pub use rate_limiter::RateLimiter;
pub use store::{CandleStore, MemoryStore, PostgresStore};
pub use timeframe::Timeframe;
