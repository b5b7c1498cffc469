//! Futures-Info Syncer
//!
//! Two passes per cycle: upsert every contract definition from one exchange
//! info call, then resolve a funding rate for each TRADING contract by
//! priority: recent historical point, else the premium/mark index, else the
//! most recent settled rate.

use crate::application::syncers::{SyncReport, SyncStats, Syncer};
use crate::domain::repositories::{ContractRepository, FundingRateRepository};
use crate::domain::types::{FundingRate, FundingSource};
use crate::infrastructure::binance::rest::BinanceRestClient;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FuturesSyncConfig {
    /// Prefer a historical funding point no older than this many hours.
    pub historical_window_hours: i64,
    /// Disable to skip straight to the premium-index path.
    pub historical_funding_enabled: bool,
}

impl Default for FuturesSyncConfig {
    fn default() -> Self {
        Self {
            historical_window_hours: 4,
            historical_funding_enabled: true,
        }
    }
}

pub struct FuturesInfoSyncer {
    config: FuturesSyncConfig,
    rest: Arc<BinanceRestClient>,
    contracts: Arc<dyn ContractRepository>,
    funding: Arc<dyn FundingRateRepository>,
    /// Symbols with status TRADING from the latest contract pass.
    trading_symbols: RwLock<Vec<String>>,
    stats: SyncStats,
}

impl FuturesInfoSyncer {
    pub fn new(
        config: FuturesSyncConfig,
        rest: Arc<BinanceRestClient>,
        contracts: Arc<dyn ContractRepository>,
        funding: Arc<dyn FundingRateRepository>,
    ) -> Self {
        Self {
            config,
            rest,
            contracts,
            funding,
            trading_symbols: RwLock::new(Vec::new()),
            stats: SyncStats::new(),
        }
    }

    async fn sync_contracts(&self) -> Result<usize> {
        let contracts = self.rest.futures_contracts().await?;
        let trading: Vec<String> = contracts
            .iter()
            .filter(|c| c.status == "TRADING")
            .map(|c| c.symbol.clone())
            .collect();

        let written = self.contracts.upsert_batch(&contracts).await?;
        info!(
            "FuturesInfoSyncer: upserted {} contracts, {} trading",
            written,
            trading.len()
        );

        *self
            .trading_symbols
            .write()
            .expect("trading symbols poisoned") = trading;
        Ok(written as usize)
    }

    /// Resolve one symbol's rate by source priority.
    async fn resolve_funding(&self, symbol: &str) -> Result<Option<FundingRate>> {
        if self.config.historical_funding_enabled {
            let since =
                Utc::now() - ChronoDuration::hours(self.config.historical_window_hours);
            match self
                .rest
                .funding_rate_history(symbol, Some(since.timestamp_millis()), 1)
                .await
            {
                Ok(points) => {
                    if let Some(mut rate) = points.into_iter().next_back() {
                        rate.source = FundingSource::Historical;
                        return Ok(Some(rate));
                    }
                }
                Err(e) => debug!(
                    "FuturesInfoSyncer: historical funding fetch failed for {}: {}",
                    symbol, e
                ),
            }
        }

        match self.rest.premium_index(symbol).await {
            Ok(Some(rate)) => return Ok(Some(rate)),
            Ok(None) => {}
            Err(e) => debug!(
                "FuturesInfoSyncer: premium index fetch failed for {}: {}",
                symbol, e
            ),
        }

        let settled = self.rest.funding_rate_history(symbol, None, 1).await?;
        Ok(settled.into_iter().last())
    }

    async fn sync_funding(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let symbols = self
            .trading_symbols
            .read()
            .expect("trading symbols poisoned")
            .clone();

        for symbol in symbols {
            match self.resolve_funding(&symbol).await {
                Ok(Some(rate)) => match self.funding.upsert(&rate).await {
                    Ok(()) => report.synced += 1,
                    Err(e) => {
                        warn!(
                            "FuturesInfoSyncer: funding store write failed for {}: {}",
                            symbol, e
                        );
                        self.stats.record_error(&e.to_string());
                        report.errors += 1;
                    }
                },
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    self.stats.record_error(&e.to_string());
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl Syncer for FuturesInfoSyncer {
    fn name(&self) -> &'static str {
        "futures_info"
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let mut report = SyncReport::default();

        match self.sync_contracts().await {
            Ok(written) => report.synced += written,
            Err(e) => {
                warn!("FuturesInfoSyncer: contract pass failed: {}", e);
                self.stats.record_error(&e.to_string());
                report.errors += 1;
            }
        }

        match self.sync_funding().await {
            Ok(funding_report) => report.merge(funding_report),
            Err(e) => {
                warn!("FuturesInfoSyncer: funding pass failed: {}", e);
                self.stats.record_error(&e.to_string());
                report.errors += 1;
            }
        }

        self.stats
            .record_success(report.synced as u64, started.elapsed());
        if report.errors > 0 {
            info!(
                "FuturesInfoSyncer: completed with {} errors ({} synced)",
                report.errors, report.synced
            );
        }
        Ok(report)
    }

    fn stats(&self) -> &SyncStats {
        &self.stats
    }
}
