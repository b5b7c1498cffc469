//! Depth Syncer
//!
//! Per (symbol, market): one 20-level order-book snapshot, persisted exactly
//! as received. Depth ages fast, so the incremental cutoff is short, and a
//! small pacing delay every few symbols keeps the burst profile flat.

use crate::application::syncers::{SyncReport, SyncStats, Syncer, retry_api_call};
use crate::domain::errors::ApiErrorKind;
use crate::domain::repositories::{DepthRepository, InstrumentRepository};
use crate::domain::types::Market;
use crate::infrastructure::binance::rest::BinanceRestClient;
use crate::infrastructure::cache::invalid_symbols::InvalidSymbolCache;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const DEPTH_LEVELS: u32 = 20;
/// Pause after this many synced symbols.
const PACING_EVERY: usize = 10;
const PACING_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct DepthSyncConfig {
    /// Snapshots older than this are stale.
    pub staleness_cutoff: Duration,
}

impl Default for DepthSyncConfig {
    fn default() -> Self {
        Self {
            staleness_cutoff: Duration::from_secs(30),
        }
    }
}

pub struct DepthSyncer {
    config: DepthSyncConfig,
    rest: Arc<BinanceRestClient>,
    instruments: Arc<dyn InstrumentRepository>,
    depth: Arc<dyn DepthRepository>,
    invalid: Arc<InvalidSymbolCache>,
    shutdown: watch::Receiver<bool>,
    stats: SyncStats,
}

impl DepthSyncer {
    pub fn new(
        config: DepthSyncConfig,
        rest: Arc<BinanceRestClient>,
        instruments: Arc<dyn InstrumentRepository>,
        depth: Arc<dyn DepthRepository>,
        invalid: Arc<InvalidSymbolCache>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            rest,
            instruments,
            depth,
            invalid,
            shutdown,
            stats: SyncStats::new(),
        }
    }

    async fn sync_market(&self, market: Market) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let symbols = self.instruments.active_symbols(market).await?;
        let mut candidates = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if self.invalid.is_invalid(&symbol, market).await {
                report.skipped += 1;
            } else {
                candidates.push(symbol);
            }
        }

        let cutoff_ms = Utc::now().timestamp_millis()
            - self.config.staleness_cutoff.as_millis() as i64;
        let latest = self.depth.latest_snapshot_times(market, &candidates).await?;

        let mut synced_in_row = 0usize;
        for symbol in candidates {
            if *self.shutdown.borrow() {
                break;
            }
            if latest.get(&symbol).map(|t| *t >= cutoff_ms).unwrap_or(false) {
                report.skipped += 1;
                continue;
            }

            let mut shutdown = self.shutdown.clone();
            let result = retry_api_call(
                || self.rest.depth(&symbol, market, DEPTH_LEVELS),
                &mut shutdown,
            )
            .await;

            match result {
                Ok(snapshot) => match self.depth.insert(&snapshot).await {
                    Ok(()) => report.synced += 1,
                    Err(e) => {
                        warn!("DepthSyncer: store write failed for {}: {}", symbol, e);
                        self.stats.record_error(&e.to_string());
                        report.errors += 1;
                    }
                },
                Err(e) => {
                    if e.kind() == ApiErrorKind::InvalidSymbol {
                        self.invalid.mark_invalid(&symbol, market).await;
                        self.stats.record_invalid_marked();
                    } else {
                        self.stats.record_error(&e.to_string());
                    }
                    report.errors += 1;
                }
            }

            synced_in_row += 1;
            if synced_in_row % PACING_EVERY == 0 {
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(PACING_DELAY) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl Syncer for DepthSyncer {
    fn name(&self) -> &'static str {
        "depth"
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let mut report = SyncReport::default();

        for market in Market::ALL {
            match self.sync_market(market).await {
                Ok(market_report) => report.merge(market_report),
                Err(e) => {
                    warn!("DepthSyncer: {} cycle failed: {}", market, e);
                    self.stats.record_error(&e.to_string());
                    report.errors += 1;
                }
            }
        }

        self.stats
            .record_success(report.synced as u64, started.elapsed());
        if report.errors > 0 {
            info!(
                "DepthSyncer: completed with {} errors ({} synced, {} skipped)",
                report.errors, report.synced, report.skipped
            );
        }
        Ok(report)
    }

    fn stats(&self) -> &SyncStats {
        &self.stats
    }
}
