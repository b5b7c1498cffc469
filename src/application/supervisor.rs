//! Pipeline Supervisor
//!
//! Owns the lifecycle of every syncer, the WebSocket fleet, the realtime
//! leaderboards and the monitoring loops. Builds all shared state (store
//! pool, rate limiter, invalid-symbol cache) once, wires it into the
//! components, runs the optional smoke sync, then launches the steady-state
//! ticking tasks. Shutdown is a watch broadcast with a bounded wait.

use crate::application::leaderboard::RealtimeLeaderboard;
use crate::application::monitoring::consistency::ConsistencyChecker;
use crate::application::monitoring::monitor::Monitoring;
use crate::application::scheduler::SmartScheduler;
use crate::application::syncers::candles::CandleSyncer;
use crate::application::syncers::depth::DepthSyncer;
use crate::application::syncers::futures_info::FuturesInfoSyncer;
use crate::application::syncers::instrument_registry::InstrumentRegistrySyncer;
use crate::application::syncers::price::PriceSyncer;
use crate::application::syncers::stats24h::StatsSyncer;
use crate::application::syncers::Syncer;
use crate::config::{Config, SyncPeriods};
use crate::domain::repositories::{
    CandleRepository, DepthRepository, InstrumentRepository, PriceCacheRepository,
    SnapshotRepository, StatsRepository, TradeRepository,
};
use crate::domain::types::Market;
use crate::infrastructure::binance::fleet::WsFleet;
use crate::infrastructure::binance::rest::BinanceRestClient;
use crate::infrastructure::cache::invalid_symbols::InvalidSymbolCache;
use crate::infrastructure::core::rate_limiter::RateLimiterPool;
use crate::infrastructure::observability::{Metrics, MetricsReporter};
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{
    SqliteCandleRepository, SqliteContractRepository, SqliteDepthRepository,
    SqliteFundingRateRepository, SqliteInstrumentRepository, SqlitePriceCacheRepository,
    SqliteSnapshotRepository, SqliteStatsRepository, SqliteTradeRepository,
};
use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// One-shot smoke-sync behavior before steady state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialSyncMode {
    Skip,
    Ordered,
    Random,
}

impl std::str::FromStr for InitialSyncMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(InitialSyncMode::Skip),
            "ordered" => Ok(InitialSyncMode::Ordered),
            "random" => Ok(InitialSyncMode::Random),
            _ => anyhow::bail!(
                "Invalid initial sync mode: {}. Must be 'skip', 'ordered' or 'random'",
                s
            ),
        }
    }
}

const REGISTRY_SMOKE_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const STALENESS_CHECK_INTERVAL: Duration = Duration::from_secs(300);
const STALENESS_LIMIT: Duration = Duration::from_secs(600);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Supervisor {
    config: Config,
    db: Database,
    metrics: Metrics,
    limiter: Arc<RateLimiterPool>,
    invalid: Arc<InvalidSymbolCache>,
    rest: Arc<BinanceRestClient>,
    fleet: Arc<WsFleet>,
    scheduler: Arc<SmartScheduler>,
    instruments: Arc<dyn InstrumentRepository>,
    leaderboards: Vec<Arc<RealtimeLeaderboard>>,
    syncers: Vec<Arc<dyn Syncer>>,
    registry_syncer: Arc<InstrumentRegistrySyncer>,
    consistency: Arc<ConsistencyChecker>,
    monitoring: Arc<Monitoring>,
    task_count: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    pub async fn build(config: Config) -> Result<Self> {
        info!("Building marketsync supervisor...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // 1. Store first; everything downstream needs the pool
        let db = Database::new(&config.database_url)
            .await
            .context("Failed to initialize database")?;

        let instruments: Arc<dyn InstrumentRepository> =
            Arc::new(SqliteInstrumentRepository::new(db.pool.clone()));
        let prices: Arc<dyn PriceCacheRepository> =
            Arc::new(SqlitePriceCacheRepository::new(db.pool.clone()));
        let candles: Arc<dyn CandleRepository> =
            Arc::new(SqliteCandleRepository::new(db.pool.clone()));
        let stats: Arc<dyn StatsRepository> = Arc::new(SqliteStatsRepository::new(db.pool.clone()));
        let depth: Arc<dyn DepthRepository> = Arc::new(SqliteDepthRepository::new(db.pool.clone()));
        let trades: Arc<dyn TradeRepository> =
            Arc::new(SqliteTradeRepository::new(db.pool.clone()));
        let contracts = Arc::new(SqliteContractRepository::new(db.pool.clone()));
        let funding = Arc::new(SqliteFundingRateRepository::new(db.pool.clone()));
        let snapshots: Arc<dyn SnapshotRepository> =
            Arc::new(SqliteSnapshotRepository::new(db.pool.clone()));

        // 2. Process-wide shared state, owned here
        let metrics = Metrics::new().context("Failed to build metrics registry")?;
        let limiter = Arc::new(RateLimiterPool::new(config.rate_limits));
        let invalid = Arc::new(InvalidSymbolCache::connect(config.kv.clone()).await);
        let rest = Arc::new(BinanceRestClient::new(
            config.api.clone(),
            limiter.clone(),
            shutdown_rx.clone(),
        ));

        // 3. WebSocket fleet
        let fleet = WsFleet::new(
            config.ws.clone(),
            prices.clone(),
            candles.clone(),
            depth.clone(),
            trades.clone(),
            stats.clone(),
            shutdown_rx.clone(),
        );

        let scheduler = SmartScheduler::new();

        // 4. Syncers
        let registry_syncer = Arc::new(InstrumentRegistrySyncer::new(
            rest.clone(),
            instruments.clone(),
        ));
        let price_syncer = Arc::new(PriceSyncer::new(
            config.price_sync(),
            rest.clone(),
            fleet.clone(),
            instruments.clone(),
            prices.clone(),
            invalid.clone(),
        ));
        let stats_syncer = Arc::new(StatsSyncer::new(
            config.stats_sync(),
            rest.clone(),
            instruments.clone(),
            stats.clone(),
            invalid.clone(),
        ));
        let candle_syncer = Arc::new(CandleSyncer::new(
            config.candle_sync(),
            rest.clone(),
            instruments.clone(),
            candles.clone(),
            invalid.clone(),
            shutdown_rx.clone(),
        ));
        let depth_syncer = Arc::new(DepthSyncer::new(
            config.depth_sync(),
            rest.clone(),
            instruments.clone(),
            depth.clone(),
            invalid.clone(),
            shutdown_rx.clone(),
        ));
        let futures_syncer = Arc::new(FuturesInfoSyncer::new(
            config.futures_sync(),
            rest.clone(),
            contracts,
            funding,
        ));

        let syncers: Vec<Arc<dyn Syncer>> = vec![
            registry_syncer.clone(),
            price_syncer,
            stats_syncer,
            candle_syncer,
            depth_syncer,
            futures_syncer,
        ];

        // 5. Leaderboards, one pipeline per market
        let mut leaderboards = Vec::new();
        if config.features.realtime_leaderboard {
            for market in Market::ALL {
                let ws_url = match market {
                    Market::Spot => config.ws.spot_ws_url.clone(),
                    Market::Futures => config.ws.futures_ws_url.clone(),
                };
                leaderboards.push(RealtimeLeaderboard::new(
                    market,
                    config.leaderboard.clone(),
                    ws_url,
                    candles.clone(),
                    stats.clone(),
                    snapshots.clone(),
                    shutdown_rx.clone(),
                ));
            }
        }

        // 6. Monitoring stack
        let consistency = ConsistencyChecker::new(
            config.consistency.clone(),
            prices.clone(),
            candles.clone(),
            depth.clone(),
        );
        let task_count = Arc::new(AtomicUsize::new(0));
        let monitoring = Monitoring::new(
            config.monitoring.clone(),
            fleet.clone(),
            syncers.clone(),
            leaderboards.clone(),
            consistency.clone(),
            metrics.clone(),
            task_count.clone(),
        );

        Ok(Self {
            config,
            db,
            metrics,
            limiter,
            invalid,
            rest,
            fleet,
            scheduler,
            instruments,
            leaderboards,
            syncers,
            registry_syncer,
            consistency,
            monitoring,
            task_count,
            tasks: Vec::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    fn syncer(&self, name: &str) -> Option<Arc<dyn Syncer>> {
        self.syncers.iter().find(|s| s.name() == name).cloned()
    }

    pub fn syncer_names(&self) -> Vec<&'static str> {
        self.syncers.iter().map(|s| s.name()).collect()
    }

    /// Run one named syncer cycle (CLI `sync-once`).
    pub async fn sync_once(&self, name: &str) -> Result<()> {
        let syncer = self
            .syncer(name)
            .with_context(|| format!("Unknown syncer: {}", name))?;
        let report = syncer.sync_once().await?;
        info!(
            "Supervisor: {} completed: {} synced, {} skipped, {} errors",
            name, report.synced, report.skipped, report.errors
        );
        if report.errors > 0 {
            anyhow::bail!("{} completed with {} errors", name, report.errors);
        }
        Ok(())
    }

    /// One-shot smoke sync per mode, then steady state.
    ///
    /// Ordered mode runs registry, then stats (the store the leaderboard
    /// seeds from), then starts the leaderboards, then smokes every other
    /// syncer. Smoke failures are reported, never fatal.
    pub async fn start(&mut self, mode: InitialSyncMode) -> Result<()> {
        info!("Supervisor: starting (initial sync mode: {:?})", mode);

        if mode != InitialSyncMode::Skip {
            // The registry smoke is always first and bounded: every
            // downstream syncer needs a symbol universe
            let registry = self.registry_syncer.clone();
            match tokio::time::timeout(REGISTRY_SMOKE_TIMEOUT, registry.sync_once()).await {
                Ok(Ok(report)) => info!(
                    "Supervisor: registry smoke sync done ({} instruments)",
                    report.synced
                ),
                Ok(Err(e)) => warn!("Supervisor: registry smoke sync failed: {}", e),
                Err(_) => warn!(
                    "Supervisor: registry smoke sync exceeded {:?}, continuing",
                    REGISTRY_SMOKE_TIMEOUT
                ),
            }
        }

        // Invalid-symbol revalidation runs once, after the registry pass has
        // refreshed instrument activity
        self.invalid
            .cleanup(self.instruments.as_ref(), self.rest.as_ref())
            .await;

        if mode == InitialSyncMode::Ordered {
            self.smoke_one("stats_24h").await;
        }

        // Fleet subscriptions from the freshly synced universe
        if self.config.features.ws_sync {
            let mut universes = HashMap::new();
            for market in Market::ALL {
                match self.instruments.active_symbols(market).await {
                    Ok(symbols) => {
                        universes.insert(market, symbols);
                    }
                    Err(e) => {
                        warn!(
                            "Supervisor: failed to load {} universe for the fleet: {}",
                            market, e
                        );
                    }
                }
            }
            self.fleet.start(universes).await?;
        }

        // Leaderboard start seeds the store immediately, then goes realtime
        for board in &self.leaderboards {
            if let Err(e) = board.start().await {
                error!(
                    "Supervisor: leaderboard {} failed to start: {}",
                    board.market(),
                    e
                );
            }
        }

        if mode != InitialSyncMode::Skip {
            let already_run: &[&str] = if mode == InitialSyncMode::Ordered {
                &["instrument_registry", "stats_24h"]
            } else {
                &["instrument_registry"]
            };
            let mut remaining: Vec<Arc<dyn Syncer>> = self
                .syncers
                .iter()
                .filter(|s| !already_run.contains(&s.name()))
                .cloned()
                .collect();
            if mode == InitialSyncMode::Random {
                remaining.shuffle(&mut rand::rng());
            }
            for syncer in remaining {
                Self::smoke(&syncer).await;
            }
        }

        self.spawn_steady_state();
        info!(
            "Supervisor: steady state entered with {} syncers, {} leaderboards",
            self.syncers.len(),
            self.leaderboards.len()
        );
        Ok(())
    }

    async fn smoke_one(&self, name: &str) {
        if let Some(syncer) = self.syncer(name) {
            Self::smoke(&syncer).await;
        }
    }

    async fn smoke(syncer: &Arc<dyn Syncer>) {
        match syncer.sync_once().await {
            Ok(report) => info!(
                "Supervisor: {} smoke sync done ({} synced, {} skipped, {} errors)",
                syncer.name(),
                report.synced,
                report.skipped,
                report.errors
            ),
            Err(e) => warn!("Supervisor: {} smoke sync failed: {}", syncer.name(), e),
        }
    }

    fn period_for(&self, name: &str) -> Duration {
        let periods = &self.config.periods;
        let minutes = match name {
            "instrument_registry" => periods.exchange_info,
            "price" => periods.price,
            "stats_24h" => periods.stats,
            "kline" => periods.kline,
            "depth" => periods.depth,
            "futures_info" => periods.futures,
            _ => periods.exchange_info,
        };
        SyncPeriods::as_duration(minutes)
    }

    fn spawn_steady_state(&mut self) {
        // Per-syncer tick tasks
        let syncers = self.syncers.clone();
        for syncer in &syncers {
            let syncer = syncer.clone();
            let period = self.period_for(syncer.name());
            let metrics = self.metrics.clone();
            let scheduler = self.scheduler.clone();
            let ws_backed = matches!(syncer.name(), "price" | "kline" | "depth");
            let smart_scheduler_on = self.config.features.smart_scheduler;
            let mut shutdown = self.shutdown_rx.clone();

            self.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // smoke sync covered the immediate run
                let mut tick: u64 = 0;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => return,
                    }

                    // With a healthy fleet, WS-backed syncers relax their duty
                    // cycle; REST behavior resumes the moment WS degrades
                    if smart_scheduler_on && ws_backed && scheduler.should_skip_cycle(tick) {
                        tick += 1;
                        continue;
                    }
                    tick += 1;

                    let started = std::time::Instant::now();
                    match syncer.sync_once().await {
                        Ok(report) => {
                            metrics.record_sync(
                                syncer.name(),
                                report.errors == 0,
                                report.synced as u64,
                                started.elapsed().as_secs_f64(),
                            );
                        }
                        Err(e) => {
                            error!("Supervisor: {} cycle failed: {}", syncer.name(), e);
                            syncer.stats().record_error(&e.to_string());
                            metrics.record_sync(
                                syncer.name(),
                                false,
                                0,
                                started.elapsed().as_secs_f64(),
                            );
                        }
                    }
                }
            });
        }

        // Heartbeat: DB probe every 30 s
        {
            let db = self.db.clone();
            let mut shutdown = self.shutdown_rx.clone();
            self.spawn(async move {
                let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => return,
                    }
                    if let Err(e) = db.ping().await {
                        error!("Supervisor: heartbeat failed: {}", e);
                    }
                }
            });
        }

        // Staleness check: every 5 min, flag syncers silent for > 10 min
        {
            let syncers = self.syncers.clone();
            let mut shutdown = self.shutdown_rx.clone();
            self.spawn(async move {
                let mut ticker = tokio::time::interval(STALENESS_CHECK_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => return,
                    }
                    for syncer in &syncers {
                        let snapshot = syncer.stats().snapshot();
                        let stale = snapshot
                            .last_sync_time
                            .map(|t| {
                                chrono::Utc::now() - t
                                    > chrono::Duration::from_std(STALENESS_LIMIT)
                                        .unwrap_or_default()
                            })
                            .unwrap_or(false);
                        if stale {
                            warn!(
                                "Supervisor: syncer {} has not synced since {:?}",
                                syncer.name(),
                                snapshot.last_sync_time
                            );
                        }
                    }
                }
            });
        }

        // Metrics reporter
        if self.config.features.metrics {
            let reporter =
                MetricsReporter::new(self.metrics.clone(), self.config.metrics_report_interval);
            let shutdown = self.shutdown_rx.clone();
            self.spawn(async move { reporter.run(shutdown).await });
        }

        // Consistency checker
        if self.config.features.consistency {
            let checker = self.consistency.clone();
            let shutdown = self.shutdown_rx.clone();
            self.spawn(async move { checker.run(shutdown).await });
        }

        // Monitoring aggregate
        if self.config.features.monitoring {
            let monitoring = self.monitoring.clone();
            let shutdown = self.shutdown_rx.clone();
            self.spawn(async move { monitoring.run(shutdown).await });
        }

        // Smart scheduler fleet watch
        if self.config.features.smart_scheduler {
            let scheduler = self.scheduler.clone();
            let fleet = self.fleet.clone();
            let scheduler_config = self.config.scheduler;
            let shutdown = self.shutdown_rx.clone();
            self.spawn(async move {
                scheduler.watch_fleet(fleet, scheduler_config, shutdown).await
            });
        }

        self.task_count
            .store(self.tasks.len(), Ordering::Release);
    }

    fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(future));
    }

    /// Broadcast shutdown and wait up to the grace period for every task.
    pub async fn shutdown(mut self) {
        info!("Supervisor: shutting down...");
        let _ = self.shutdown_tx.send(true);

        for board in &self.leaderboards {
            board.stop().await;
        }

        let drain = async {
            for task in self.tasks.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(
                "Supervisor: shutdown exceeded {:?}, releasing resources anyway",
                SHUTDOWN_GRACE
            );
        }

        // Block any further upstream calls, then drop the pool
        self.limiter.close();
        self.db.pool.close().await;
        info!("Supervisor: shutdown complete");
    }

    /// One-shot status summary for the CLI.
    pub async fn status(&self) -> Result<String> {
        self.db.ping().await?;
        let report = self.monitoring.check_once().await;
        let mut out = String::new();
        out.push_str(&format!(
            "overall: {:?}, health score {:.1}\n",
            report.overall, report.health_score
        ));
        for (component, health) in &report.components {
            out.push_str(&format!("  {:<22} {:?}\n", component, health));
        }
        for syncer in &self.syncers {
            let snapshot = syncer.stats().snapshot();
            out.push_str(&format!(
                "  {:<22} ok={} err={} last={}\n",
                syncer.name(),
                snapshot.success_count,
                snapshot.error_count,
                snapshot
                    .last_sync_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            ));
        }
        Ok(out)
    }
}
