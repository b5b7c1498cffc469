//! Instrument Registry Syncer
//!
//! Fetches the full instrument universe for each market and reconciles the
//! store against it. Instruments that disappear from the upstream listing are
//! soft-deleted: flipped inactive with a deactivation timestamp, never
//! removed. Every downstream syncer derives its symbol universe from these
//! rows, so the supervisor runs this syncer first.

use crate::application::syncers::{SyncReport, SyncStats, Syncer};
use crate::domain::repositories::InstrumentRepository;
use crate::domain::types::Market;
use crate::infrastructure::binance::rest::BinanceRestClient;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

pub struct InstrumentRegistrySyncer {
    rest: Arc<BinanceRestClient>,
    instruments: Arc<dyn InstrumentRepository>,
    stats: SyncStats,
}

impl InstrumentRegistrySyncer {
    pub fn new(rest: Arc<BinanceRestClient>, instruments: Arc<dyn InstrumentRepository>) -> Self {
        Self {
            rest,
            instruments,
            stats: SyncStats::new(),
        }
    }
}

#[async_trait]
impl Syncer for InstrumentRegistrySyncer {
    fn name(&self) -> &'static str {
        "instrument_registry"
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let mut report = SyncReport::default();

        for market in Market::ALL {
            let fetched = match self.rest.exchange_info(market).await {
                Ok(instruments) => instruments,
                Err(e) => {
                    warn!(
                        "InstrumentRegistrySyncer: failed to fetch {} listing: {}",
                        market, e
                    );
                    self.stats.record_error(&e.to_string());
                    report.errors += 1;
                    continue;
                }
            };

            if fetched.is_empty() {
                // An empty listing would deactivate the whole market; treat it
                // as an upstream fault instead
                warn!(
                    "InstrumentRegistrySyncer: empty {} listing, skipping reconciliation",
                    market
                );
                report.errors += 1;
                continue;
            }

            match self
                .instruments
                .sync_universe(market, &fetched, Utc::now())
                .await
            {
                Ok(outcome) => {
                    info!(
                        "InstrumentRegistrySyncer: {} reconciled, {} upserted, {} deactivated",
                        market, outcome.upserted, outcome.deactivated
                    );
                    report.synced += outcome.upserted;
                }
                Err(e) => {
                    warn!(
                        "InstrumentRegistrySyncer: store reconciliation failed for {}: {}",
                        market, e
                    );
                    self.stats.record_error(&e.to_string());
                    report.errors += 1;
                }
            }
        }

        if report.errors == 0 {
            self.stats
                .record_success(report.synced as u64, started.elapsed());
        }
        Ok(report)
    }

    fn stats(&self) -> &SyncStats {
        &self.stats
    }
}
