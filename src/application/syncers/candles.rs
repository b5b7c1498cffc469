//! Candlestick Syncer
//!
//! Per (market, interval): incremental filtering, then tightly controlled
//! batches. Concurrency shrinks as the survivor set grows so a large backlog
//! never hammers the upstream or the store, and batch order is shuffled to
//! avoid write hotspotting.

use crate::application::syncers::{SyncReport, SyncStats, Syncer, retry_api_call};
use crate::domain::errors::ApiErrorKind;
use crate::domain::repositories::{CandleRepository, InstrumentRepository};
use crate::domain::types::Market;
use crate::domain::validation::partition_valid;
use crate::infrastructure::binance::common::{SYNC_INTERVALS, interval_min_rows};
use crate::infrastructure::binance::rest::BinanceRestClient;
use crate::infrastructure::cache::invalid_symbols::InvalidSymbolCache;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

/// Hard bound on one symbol's fetch-validate-persist work.
const PER_SYMBOL_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const FETCH_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct CandleSyncConfig {
    /// Intervals to sync, e.g. 1m through 1d.
    pub intervals: Vec<String>,
    /// Latest row must be newer than this for the incremental skip.
    pub staleness_cutoff: Duration,
}

impl Default for CandleSyncConfig {
    fn default() -> Self {
        Self {
            intervals: SYNC_INTERVALS.iter().map(|s| s.to_string()).collect(),
            staleness_cutoff: Duration::from_secs(3600),
        }
    }
}

/// Survivor-count driven concurrency: the more work is pending, the gentler
/// each batch is.
fn concurrency_for(survivors: usize) -> usize {
    if survivors > 50 {
        1
    } else if survivors > 10 {
        2
    } else {
        survivors.min(3).max(1)
    }
}

fn batch_size_for(concurrency: usize) -> usize {
    if concurrency == 1 { 20 } else { 5 * concurrency }
}

fn inter_batch_delay(concurrency: usize) -> Duration {
    if concurrency == 1 {
        Duration::from_millis(100)
    } else {
        Duration::from_millis(500 + rand::random::<u64>() % 300)
    }
}

pub struct CandleSyncer {
    config: CandleSyncConfig,
    rest: Arc<BinanceRestClient>,
    instruments: Arc<dyn InstrumentRepository>,
    candles: Arc<dyn CandleRepository>,
    invalid: Arc<InvalidSymbolCache>,
    shutdown: watch::Receiver<bool>,
    stats: SyncStats,
}

impl CandleSyncer {
    pub fn new(
        config: CandleSyncConfig,
        rest: Arc<BinanceRestClient>,
        instruments: Arc<dyn InstrumentRepository>,
        candles: Arc<dyn CandleRepository>,
        invalid: Arc<InvalidSymbolCache>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            rest,
            instruments,
            candles,
            invalid,
            shutdown,
            stats: SyncStats::new(),
        }
    }

    /// Incremental rule: enough rows within 24 h and a recent latest bar.
    async fn can_skip(&self, symbol: &str, market: Market, interval: &str) -> bool {
        let day_ago_ms = (Utc::now() - ChronoDuration::hours(24)).timestamp_millis();
        let count = match self
            .candles
            .count_recent(symbol, market, interval, day_ago_ms)
            .await
        {
            Ok(count) => count,
            Err(_) => return false,
        };
        if count < interval_min_rows(interval) {
            return false;
        }

        let cutoff_ms = (Utc::now()
            - ChronoDuration::from_std(self.config.staleness_cutoff).unwrap_or_default())
        .timestamp_millis();
        match self.candles.latest_open_time(symbol, market, interval).await {
            Ok(Some(latest)) => latest > cutoff_ms,
            _ => false,
        }
    }

    /// Fetch, validate and persist one (symbol, interval) key.
    async fn sync_symbol(
        &self,
        symbol: &str,
        market: Market,
        interval: &str,
    ) -> Result<SyncReport, crate::domain::errors::ApiError> {
        let mut shutdown = self.shutdown.clone();
        let fetched = retry_api_call(
            || self.rest.klines(symbol, market, interval, FETCH_LIMIT),
            &mut shutdown,
        )
        .await?;

        let (valid, rejected) = partition_valid(fetched, Utc::now());
        if rejected > 0 {
            debug!(
                "CandleSyncer: rejected {} rows for {} {} {}",
                rejected, symbol, market, interval
            );
        }

        let written = self
            .candles
            .upsert_batch(&valid)
            .await
            .map_err(|e| crate::domain::errors::ApiError::Other {
                message: format!("store: {}", e),
            })?;

        Ok(SyncReport {
            synced: written as usize,
            skipped: 0,
            errors: 0,
            rejected_rows: rejected,
        })
    }

    async fn sync_interval(&self, market: Market, interval: &str) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let symbols = self.instruments.active_symbols(market).await?;
        let mut survivors = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if self.invalid.is_invalid(&symbol, market).await {
                report.skipped += 1;
                continue;
            }
            if self.can_skip(&symbol, market, interval).await {
                report.skipped += 1;
                continue;
            }
            survivors.push(symbol);
        }

        if survivors.is_empty() {
            return Ok(report);
        }

        let concurrency = concurrency_for(survivors.len());
        let batch_size = batch_size_for(concurrency);

        // Shuffle larger lists so consecutive writes spread across symbols
        if survivors.len() > 10 {
            survivors.shuffle(&mut rand::rng());
        }

        debug!(
            "CandleSyncer[{} {}]: {} survivors, concurrency {}, batch size {}",
            market,
            interval,
            survivors.len(),
            concurrency,
            batch_size
        );

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut batches = survivors.chunks(batch_size).peekable();

        while let Some(batch) = batches.next() {
            if *self.shutdown.borrow() {
                break;
            }

            let mut handles = Vec::with_capacity(batch.len());
            for symbol in batch {
                let semaphore = semaphore.clone();
                let symbol = symbol.clone();
                let this = self;
                handles.push(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = tokio::time::timeout(
                        PER_SYMBOL_TIMEOUT,
                        this.sync_symbol(&symbol, market, interval),
                    )
                    .await;
                    (symbol, result)
                });
            }

            for (symbol, result) in futures::future::join_all(handles).await {
                match result {
                    Ok(Ok(symbol_report)) => report.merge(symbol_report),
                    Ok(Err(e)) => {
                        if e.kind() == ApiErrorKind::InvalidSymbol {
                            self.invalid.mark_invalid(&symbol, market).await;
                            self.stats.record_invalid_marked();
                        } else {
                            self.stats.record_error(&e.to_string());
                        }
                        report.errors += 1;
                    }
                    Err(_) => {
                        warn!(
                            "CandleSyncer: {} {} {} timed out after {:?}",
                            symbol, market, interval, PER_SYMBOL_TIMEOUT
                        );
                        report.errors += 1;
                    }
                }
            }

            // Let the rate limiter and the store recover between batches
            if batches.peek().is_some() {
                let delay = inter_batch_delay(concurrency);
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl Syncer for CandleSyncer {
    fn name(&self) -> &'static str {
        "kline"
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let mut report = SyncReport::default();

        for market in Market::ALL {
            for interval in &self.config.intervals {
                if *self.shutdown.borrow() {
                    return Ok(report);
                }
                match self.sync_interval(market, interval).await {
                    Ok(interval_report) => report.merge(interval_report),
                    Err(e) => {
                        warn!(
                            "CandleSyncer: {} {} pass failed: {}",
                            market, interval, e
                        );
                        self.stats.record_error(&e.to_string());
                        report.errors += 1;
                    }
                }
            }
        }

        self.stats
            .record_success(report.synced as u64, started.elapsed());
        if report.errors > 0 || report.rejected_rows > 0 {
            info!(
                "CandleSyncer: completed with {} errors, {} rejected rows ({} rows written)",
                report.errors, report.rejected_rows, report.synced
            );
        }
        Ok(report)
    }

    fn stats(&self) -> &SyncStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_shrinks_as_backlog_grows() {
        assert_eq!(concurrency_for(200), 1);
        assert_eq!(concurrency_for(51), 1);
        assert_eq!(concurrency_for(50), 2);
        assert_eq!(concurrency_for(11), 2);
        assert_eq!(concurrency_for(10), 3);
        assert_eq!(concurrency_for(2), 2);
        assert_eq!(concurrency_for(1), 1);
    }

    #[test]
    fn batch_sizes_follow_concurrency() {
        assert_eq!(batch_size_for(1), 20);
        assert_eq!(batch_size_for(2), 10);
        assert_eq!(batch_size_for(3), 15);
    }

    #[test]
    fn concurrent_delay_stays_in_band() {
        for _ in 0..50 {
            let delay = inter_batch_delay(2);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay < Duration::from_millis(800));
        }
        assert_eq!(inter_batch_delay(1), Duration::from_millis(100));
    }
}
