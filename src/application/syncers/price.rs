//! Price Syncer
//!
//! Keeps one `price_caches` row per `(symbol, market)` fresh. Candidates come
//! from the registry minus the invalid-symbol blocklist, then an incremental
//! filter keeps only rows older than the staleness cutoff. Survivors are
//! served from the WebSocket fleet when it is healthy and fresh, with REST as
//! the fallback.

use crate::application::syncers::{SyncReport, SyncStats, Syncer};
use crate::domain::errors::{ApiError, ApiErrorKind};
use crate::domain::repositories::{InstrumentRepository, PriceCacheRepository};
use crate::domain::types::{Market, PriceCacheRow};
use crate::infrastructure::binance::fleet::WsFleet;
use crate::infrastructure::binance::rest::BinanceRestClient;
use crate::infrastructure::cache::invalid_symbols::InvalidSymbolCache;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PriceSyncConfig {
    /// Rows older than this are considered stale and re-synced.
    pub staleness_cutoff: Duration,
    /// Maximum age of a WS tick before falling back to REST.
    pub max_data_age: Duration,
    /// Symbols force-synced when the incremental filter leaves nothing.
    pub core_symbols: Vec<String>,
}

impl Default for PriceSyncConfig {
    fn default() -> Self {
        Self {
            staleness_cutoff: Duration::from_secs(300),
            max_data_age: Duration::from_secs(30),
            core_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        }
    }
}

pub struct PriceSyncer {
    config: PriceSyncConfig,
    rest: Arc<BinanceRestClient>,
    fleet: Arc<WsFleet>,
    instruments: Arc<dyn InstrumentRepository>,
    prices: Arc<dyn PriceCacheRepository>,
    invalid: Arc<InvalidSymbolCache>,
    stats: SyncStats,
}

impl PriceSyncer {
    pub fn new(
        config: PriceSyncConfig,
        rest: Arc<BinanceRestClient>,
        fleet: Arc<WsFleet>,
        instruments: Arc<dyn InstrumentRepository>,
        prices: Arc<dyn PriceCacheRepository>,
        invalid: Arc<InvalidSymbolCache>,
    ) -> Self {
        Self {
            config,
            rest,
            fleet,
            instruments,
            prices,
            invalid,
            stats: SyncStats::new(),
        }
    }

    async fn sync_market(&self, market: Market) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let mut candidates = self.instruments.active_symbols(market).await?;
        let before = candidates.len();
        let mut kept = Vec::with_capacity(candidates.len());
        for symbol in candidates.drain(..) {
            if !self.invalid.is_invalid(&symbol, market).await {
                kept.push(symbol);
            }
        }
        report.skipped += before - kept.len();

        // Incremental filter: only rows missing or past the staleness cutoff
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.staleness_cutoff).unwrap_or_default();
        let last_updated = self.prices.last_updated(market, &kept).await?;
        let mut survivors: Vec<String> = kept
            .into_iter()
            .filter(|symbol| {
                last_updated
                    .get(symbol)
                    .map(|updated| *updated < cutoff)
                    .unwrap_or(true)
            })
            .collect();

        if survivors.is_empty() {
            // Nothing stale; force the core set through to keep the path warm
            survivors = self
                .config
                .core_symbols
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect();
            debug!(
                "PriceSyncer[{}]: nothing stale, force-syncing {} core symbols",
                market,
                survivors.len()
            );
        }

        for symbol in survivors {
            match self.sync_symbol(&symbol, market).await {
                Ok(()) => report.synced += 1,
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
        }

        Ok(report)
    }

    async fn sync_symbol(&self, symbol: &str, market: Market) -> Result<(), ApiError> {
        // WS-first: a healthy fleet with a fresh tick saves the REST call
        if self.fleet.is_healthy()
            && self
                .fleet
                .is_price_fresh(symbol, market, self.config.max_data_age)
            && let Some(tick) = self.fleet.get_latest_price(symbol, market)
        {
            let row = PriceCacheRow {
                symbol: symbol.to_string(),
                market,
                price: tick.price_raw,
                price_change_24h: tick.change_percent,
                last_updated: Utc::now(),
            };
            return self.prices.upsert(&row).await.map_err(|e| ApiError::Other {
                message: format!("store: {}", e),
            });
        }

        let price = self.rest.ticker_price(symbol, market).await?;
        let row = PriceCacheRow {
            symbol: symbol.to_string(),
            market,
            price,
            price_change_24h: None,
            last_updated: Utc::now(),
        };
        self.prices.upsert(&row).await.map_err(|e| ApiError::Other {
            message: format!("store: {}", e),
        })
    }
}

#[async_trait]
impl Syncer for PriceSyncer {
    fn name(&self) -> &'static str {
        "price"
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let mut report = SyncReport::default();

        for market in Market::ALL {
            match self.sync_market(market).await {
                Ok(market_report) => report.merge(market_report),
                Err(e) => {
                    warn!("PriceSyncer: {} cycle failed: {}", market, e);
                    self.stats.record_error(&e.to_string());
                    report.errors += 1;
                }
            }
        }

        self.stats
            .record_success(report.synced as u64, started.elapsed());
        if report.errors > 0 {
            info!(
                "PriceSyncer: completed with {} errors ({} synced, {} skipped)",
                report.errors, report.synced, report.skipped
            );
        }
        Ok(report)
    }

    fn stats(&self) -> &SyncStats {
        &self.stats
    }
}
