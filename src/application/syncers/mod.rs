//! Periodic syncers and their shared capabilities.
//!
//! Every syncer satisfies two small capabilities: running one sync cycle
//! (`Syncer::sync_once`) and reporting statistics and health (`stats()` and
//! `SyncStats::health`). The supervisor holds a registry keyed by name; there
//! is no inheritance, only these capability sets.

pub mod candles;
pub mod depth;
pub mod futures_info;
pub mod instrument_registry;
pub mod price;
pub mod stats24h;

use crate::domain::errors::ApiError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of one sync cycle. Per-symbol errors are recovered locally; a
/// cycle that saw errors still completes and reports them here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub skipped: usize,
    pub errors: usize,
    pub rejected_rows: usize,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.synced += other.synced;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.rejected_rows += other.rejected_rows;
    }
}

/// One periodic syncer.
#[async_trait]
pub trait Syncer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one full cycle. Per-symbol failures are recorded in the report;
    /// an `Err` means the cycle itself could not run (store down, shutdown).
    async fn sync_once(&self) -> Result<SyncReport>;

    fn stats(&self) -> &SyncStats;
}

/// Component health classification shared by syncers, the fleet and the
/// monitoring aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    Warning,
    Unhealthy,
}

#[derive(Debug, Clone, Default)]
pub struct SyncAggregate {
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: u64,
    pub avg_duration_ms: f64,
}

/// Point-in-time copy of a syncer's statistics.
#[derive(Debug, Clone, Default)]
pub struct SyncStatsSnapshot {
    pub success_count: u64,
    pub error_count: u64,
    pub symbols_synced: u64,
    pub invalid_marked: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: u64,
    pub avg_duration_ms: f64,
}

/// Statistics block carried by every syncer.
///
/// Counters are lock-free atomics so the hot path stays cheap; the aggregate
/// block (last error, durations) sits behind a short reader-writer lock and
/// only needs eventual consistency.
#[derive(Default)]
pub struct SyncStats {
    success_count: AtomicU64,
    error_count: AtomicU64,
    symbols_synced: AtomicU64,
    invalid_marked: AtomicU64,
    aggregate: RwLock<SyncAggregate>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, symbols: u64, duration: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.symbols_synced.fetch_add(symbols, Ordering::Relaxed);
        let mut agg = self.aggregate.write().expect("stats aggregate poisoned");
        agg.last_sync_time = Some(Utc::now());
        agg.last_duration_ms = duration.as_millis() as u64;
        agg.avg_duration_ms = if agg.avg_duration_ms == 0.0 {
            agg.last_duration_ms as f64
        } else {
            agg.avg_duration_ms * 0.8 + agg.last_duration_ms as f64 * 0.2
        };
    }

    pub fn record_error(&self, error: &str) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let mut agg = self.aggregate.write().expect("stats aggregate poisoned");
        agg.last_error = Some(error.to_string());
    }

    pub fn record_invalid_marked(&self) {
        self.invalid_marked.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy of the whole block, taken under the read lock.
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        let agg = self
            .aggregate
            .read()
            .expect("stats aggregate poisoned")
            .clone();
        SyncStatsSnapshot {
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            symbols_synced: self.symbols_synced.load(Ordering::Relaxed),
            invalid_marked: self.invalid_marked.load(Ordering::Relaxed),
            last_sync_time: agg.last_sync_time,
            last_error: agg.last_error,
            last_duration_ms: agg.last_duration_ms,
            avg_duration_ms: agg.avg_duration_ms,
        }
    }

    /// Health from staleness and error ratio.
    pub fn health(&self, staleness_limit: Duration) -> ComponentHealth {
        let snapshot = self.snapshot();
        let stale = snapshot
            .last_sync_time
            .map(|t| Utc::now() - t > chrono::Duration::from_std(staleness_limit).unwrap_or_default())
            .unwrap_or(false);
        if stale {
            return ComponentHealth::Unhealthy;
        }

        let total = snapshot.success_count + snapshot.error_count;
        if total == 0 {
            return ComponentHealth::Healthy;
        }
        let error_ratio = snapshot.error_count as f64 / total as f64;
        if error_ratio > 0.5 {
            ComponentHealth::Unhealthy
        } else if error_ratio > 0.1 {
            ComponentHealth::Warning
        } else {
            ComponentHealth::Healthy
        }
    }
}

/// Run one upstream call with the per-class retry ladder. Sleeps are
/// cancellable; shutdown surfaces as the last error.
pub async fn retry_api_call<T, F, Fut>(
    mut op: F,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ApiError>>,
{
    let mut attempt: usize = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let schedule = err.retry_schedule();
                if attempt >= schedule.len() {
                    return Err(err);
                }
                let delay = schedule[attempt];
                attempt += 1;

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn stats_snapshot_copies_counters_and_aggregate() {
        let stats = SyncStats::new();
        stats.record_success(10, Duration::from_millis(250));
        stats.record_success(5, Duration::from_millis(350));
        stats.record_error("boom");

        let snap = stats.snapshot();
        assert_eq!(snap.success_count, 2);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.symbols_synced, 15);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
        assert!(snap.avg_duration_ms > 0.0);
        assert!(snap.last_sync_time.is_some());
    }

    #[test]
    fn health_degrades_with_error_ratio() {
        let stats = SyncStats::new();
        stats.record_success(1, Duration::from_millis(1));
        assert_eq!(stats.health(Duration::from_secs(600)), ComponentHealth::Healthy);

        for _ in 0..3 {
            stats.record_error("x");
        }
        // 3 errors vs 1 success: well past the unhealthy band
        assert_eq!(
            stats.health(Duration::from_secs(600)),
            ComponentHealth::Unhealthy
        );
    }

    #[tokio::test]
    async fn retry_stops_after_schedule_is_exhausted() {
        let calls = Mutex::new(0u32);
        let (_tx, mut rx) = watch::channel(false);

        let result: Result<(), ApiError> = retry_api_call(
            || {
                *calls.lock().unwrap() += 1;
                async {
                    Err(ApiError::Other {
                        message: "always fails".to_string(),
                    })
                }
            },
            &mut rx,
        )
        .await;

        assert!(result.is_err());
        // Initial call plus the three scheduled retries
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn retry_never_retries_invalid_symbol() {
        let calls = Mutex::new(0u32);
        let (_tx, mut rx) = watch::channel(false);

        let result: Result<(), ApiError> = retry_api_call(
            || {
                *calls.lock().unwrap() += 1;
                async {
                    Err(ApiError::InvalidSymbol {
                        symbol: "FAKEUSDT".to_string(),
                        message: "Invalid symbol.".to_string(),
                    })
                }
            },
            &mut rx,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(*calls.lock().unwrap(), 1);
    }
}
