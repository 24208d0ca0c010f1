//! Health check HTTP server for daemon mode.
//!
//! `/health` returns the last run's results and store connectivity,
//! `/ready` reports whether the store is reachable, `/live` always answers.

use crate::pipeline::{RunState, RunSummary};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Health check response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status: healthy, degraded, or unhealthy
    pub status: HealthStatus,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Phase of the current run, or the outcome of the last one
    pub run_state: String,
    /// Runs finished since start
    pub runs_completed: u64,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_finished: Option<DateTime<Utc>>,
    /// Pair results of the last run
    pub pairs_ok: usize,
    pub pairs_failed: usize,
    pub pairs_cancelled: usize,
    /// Candle totals of the last run
    pub candles_fetched: usize,
    pub candles_synthesized: usize,
    /// Failed runs plus failed pairs since start
    pub errors_total: u64,
    pub database_connected: bool,
    /// Current memory usage in MB
    pub memory_mb: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Shared state for health checks.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<HealthStateInner>,
}

struct HealthStateInner {
    start_time: Instant,
    /// Kline runs older than this make the service degraded
    stale_after: ChronoDuration,
    db_connected: AtomicBool,
    current_state: RwLock<RunState>,
    last_run: RwLock<Option<RunSummary>>,
    runs_completed: AtomicU64,
    errors_total: AtomicU64,
    memory_limit_mb: f64,
}

impl HealthState {
    /// `stale_after` is how long a finished run keeps the service healthy.
    pub fn new(stale_after: std::time::Duration) -> Self {
        Self {
            inner: Arc::new(HealthStateInner {
                start_time: Instant::now(),
                stale_after: ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::days(1)),
                db_connected: AtomicBool::new(false),
                current_state: RwLock::new(RunState::Idle),
                last_run: RwLock::new(None),
                runs_completed: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                memory_limit_mb: 512.0,
            }),
        }
    }

    pub fn set_db_connected(&self, connected: bool) {
        self.inner.db_connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_run_state(&self, state: RunState) {
        *self.inner.current_state.write() = state;
    }

    /// Record a finished run.
    pub fn record_run(&self, summary: &RunSummary) {
        let errors = summary.failed() as u64 + u64::from(summary.state == RunState::Failed);
        self.inner.errors_total.fetch_add(errors, Ordering::SeqCst);
        self.inner.runs_completed.fetch_add(1, Ordering::SeqCst);
        *self.inner.current_state.write() = summary.state;
        *self.inner.last_run.write() = Some(summary.clone());
    }

    pub fn build_response(&self) -> HealthResponse {
        let now = Utc::now();
        let db_connected = self.inner.db_connected.load(Ordering::SeqCst);
        let run_state = *self.inner.current_state.read();
        let last_run = self.inner.last_run.read().clone();
        let memory_mb = get_memory_usage_mb();

        let status = self.determine_status(db_connected, last_run.as_ref(), memory_mb, now);

        HealthResponse {
            status,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
            run_state: run_state.to_string(),
            runs_completed: self.inner.runs_completed.load(Ordering::SeqCst),
            last_run_started: last_run.as_ref().map(|r| r.started_at),
            last_run_finished: last_run.as_ref().and_then(|r| r.finished_at),
            pairs_ok: last_run.as_ref().map_or(0, RunSummary::succeeded),
            pairs_failed: last_run.as_ref().map_or(0, RunSummary::failed),
            pairs_cancelled: last_run.as_ref().map_or(0, RunSummary::cancelled),
            candles_fetched: last_run.as_ref().map_or(0, RunSummary::candles_fetched),
            candles_synthesized: last_run.as_ref().map_or(0, RunSummary::candles_synthesized),
            errors_total: self.inner.errors_total.load(Ordering::SeqCst),
            database_connected: db_connected,
            memory_mb,
            timestamp: now,
            last_error: last_run.and_then(|r| r.error),
        }
    }

    fn determine_status(
        &self,
        db_connected: bool,
        last_run: Option<&RunSummary>,
        memory_mb: f64,
        now: DateTime<Utc>,
    ) -> HealthStatus {
        if !db_connected {
            return HealthStatus::Unhealthy;
        }

        let Some(run) = last_run else {
            return HealthStatus::Healthy;
        };

        if run.state == RunState::Failed {
            return HealthStatus::Unhealthy;
        }

        if run.failed() > 0 || memory_mb > self.inner.memory_limit_mb {
            return HealthStatus::Degraded;
        }

        if let Some(finished) = run.finished_at {
            if now - finished > self.inner.stale_after {
                return HealthStatus::Degraded;
            }
        }

        HealthStatus::Healthy
    }
}

/// Get current memory usage in MB.
fn get_memory_usage_mb() -> f64 {
    // On Linux, read from /proc/self/statm
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(rss_pages) = content.split_whitespace().nth(1) {
                if let Ok(pages) = rss_pages.parse::<u64>() {
                    return (pages * 4096) as f64 / (1024.0 * 1024.0);
                }
            }
        }
    }
    0.0
}

async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let response = state.build_response();

    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

async fn ready_handler(State(state): State<HealthState>) -> StatusCode {
    if state.inner.db_connected.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn live_handler() -> StatusCode {
    StatusCode::OK
}

pub fn create_health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .with_state(state)
}

/// Serve the health endpoints until the task is aborted.
pub async fn run_health_server(port: u16, state: HealthState) -> std::io::Result<()> {
    let app = create_health_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Health check server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
