//! 24h-Stats Syncer
//!
//! Per (symbol, market): fetch the full 24h ticker, merge the futures
//! top-of-book, then dual-write the current row and the hour-window history
//! row concurrently. A symbol only counts as synced when both writes land;
//! the combined error names exactly which table failed.

use crate::application::syncers::{SyncReport, SyncStats, Syncer};
use crate::domain::errors::{ApiErrorKind, DualWriteError};
use crate::domain::repositories::{InstrumentRepository, StatsRepository};
use crate::domain::types::{Market, StatsWindow, Ticker24h};
use crate::infrastructure::binance::rest::BinanceRestClient;
use crate::infrastructure::cache::invalid_symbols::InvalidSymbolCache;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StatsSyncConfig {
    /// Minimum fresh history rows in the last 24 h before a symbol can skip.
    pub min_fresh_rows: i64,
    /// Minimum fraction of rows with positive volume and price.
    pub min_quality_ratio: f64,
    /// Latest row must be newer than this for the skip to apply.
    pub staleness_cutoff: Duration,
}

impl Default for StatsSyncConfig {
    fn default() -> Self {
        Self {
            min_fresh_rows: 3,
            min_quality_ratio: 0.8,
            staleness_cutoff: Duration::from_secs(2 * 3600),
        }
    }
}

pub struct StatsSyncer {
    config: StatsSyncConfig,
    rest: Arc<BinanceRestClient>,
    instruments: Arc<dyn InstrumentRepository>,
    stats_repo: Arc<dyn StatsRepository>,
    invalid: Arc<InvalidSymbolCache>,
    stats: SyncStats,
}

impl StatsSyncer {
    pub fn new(
        config: StatsSyncConfig,
        rest: Arc<BinanceRestClient>,
        instruments: Arc<dyn InstrumentRepository>,
        stats_repo: Arc<dyn StatsRepository>,
        invalid: Arc<InvalidSymbolCache>,
    ) -> Self {
        Self {
            config,
            rest,
            instruments,
            stats_repo,
            invalid,
            stats: SyncStats::new(),
        }
    }

    /// Incremental rule: enough fresh rows, good quality ratio, recent latest.
    async fn can_skip(&self, symbol: &str, market: Market) -> bool {
        let since = Utc::now() - ChronoDuration::hours(24);
        let freshness = match self.stats_repo.freshness(symbol, market, since).await {
            Ok(f) => f,
            Err(_) => return false,
        };

        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.staleness_cutoff).unwrap_or_default();
        freshness.recent_rows >= self.config.min_fresh_rows
            && freshness.quality_ratio >= self.config.min_quality_ratio
            && freshness
                .latest_update
                .map(|latest| latest > cutoff)
                .unwrap_or(false)
    }

    /// Fetch, merge book ticker for futures, dual-write.
    async fn sync_symbol(&self, symbol: &str, market: Market) -> Result<()> {
        let mut ticker = match self.rest.ticker_24h(symbol, market).await {
            Ok(t) => t,
            Err(e) => {
                if e.kind() == ApiErrorKind::InvalidSymbol {
                    self.invalid.mark_invalid(symbol, market).await;
                    self.stats.record_invalid_marked();
                }
                return Err(e.into());
            }
        };

        if market == Market::Futures {
            match self.rest.book_ticker(symbol).await {
                Ok((bid, ask)) => {
                    ticker.bid_price = Some(bid);
                    ticker.ask_price = Some(ask);
                }
                Err(e) => {
                    // Top-of-book is a best-effort enrichment
                    debug!("StatsSyncer: book ticker fetch failed for {}: {}", symbol, e);
                }
            }
        }

        self.dual_write(&ticker).await
    }

    /// Write the current row and the history row concurrently. Neither
    /// implies the other; both errors are collected.
    async fn dual_write(&self, ticker: &Ticker24h) -> Result<()> {
        let now = Utc::now();
        let window = StatsWindow::hourly(now);

        let (current, history) = tokio::join!(
            self.stats_repo.upsert_current(ticker, now),
            self.stats_repo.insert_history(ticker, &window, now),
        );

        if current.is_ok() && history.is_ok() {
            return Ok(());
        }

        Err(DualWriteError {
            current: current.err().map(|e| e.to_string()),
            history: history.err().map(|e| e.to_string()),
        }
        .into())
    }
}

#[async_trait]
impl Syncer for StatsSyncer {
    fn name(&self) -> &'static str {
        "stats_24h"
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let mut report = SyncReport::default();

        for market in Market::ALL {
            let symbols = match self.instruments.active_symbols(market).await {
                Ok(symbols) => symbols,
                Err(e) => {
                    warn!("StatsSyncer: failed to load {} universe: {}", market, e);
                    self.stats.record_error(&e.to_string());
                    report.errors += 1;
                    continue;
                }
            };

            for symbol in symbols {
                if self.invalid.is_invalid(&symbol, market).await {
                    report.skipped += 1;
                    continue;
                }
                if self.can_skip(&symbol, market).await {
                    report.skipped += 1;
                    continue;
                }

                match self.sync_symbol(&symbol, market).await {
                    Ok(()) => report.synced += 1,
                    Err(e) => {
                        warn!("StatsSyncer: {} ({}) failed: {}", symbol, market, e);
                        self.stats.record_error(&e.to_string());
                        report.errors += 1;
                    }
                }
            }
        }

        // Only clean cycles bump the success counter; partial cycles are
        // reported as completed-with-errors
        if report.errors == 0 {
            self.stats
                .record_success(report.synced as u64, started.elapsed());
        } else {
            info!(
                "StatsSyncer: completed with {} errors ({} synced, {} skipped)",
                report.errors, report.synced, report.skipped
            );
        }
        Ok(report)
    }

    fn stats(&self) -> &SyncStats {
        &self.stats
    }
}
