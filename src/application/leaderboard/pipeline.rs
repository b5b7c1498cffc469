//! Realtime leaderboard pipeline.
//!
//! Self-contained per market: a dedicated WS manager feeds a bounded channel
//! of price updates; every update (and a timed tick) triggers a recompute of
//! the top-N board by change percent; the change detector decides which
//! recomputes become stored snapshots.

use crate::application::leaderboard::base_price::{BasePriceCache, BasePriceCacheConfig};
use crate::application::leaderboard::change_detector::{
    ChangeDetectionConfig, ChangeDetector, SaveDecision,
};
use crate::application::leaderboard::price_cache::{
    PriceUpdate, RealtimePriceCache, RealtimePriceCacheConfig,
};
use crate::application::leaderboard::snapshot_manager::{SnapshotManager, SnapshotRetentionConfig};
use crate::application::leaderboard::ws_manager::LeaderboardWsManager;
use crate::domain::repositories::{
    CandleRepository, SnapshotRepository, StatsRepository, StatsRow,
};
use crate::domain::types::{Market, PriceSource, RankedSymbol};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

/// How many stats rows the recompute pulls as its lookup table.
const STATS_LOOKUP_LIMIT: i64 = 500;
const CACHE_CLEANUP_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct LeaderboardConfig {
    pub top_symbols_count: usize,
    /// Timed recompute cadence; recomputes also fire on every price update.
    pub update_interval: Duration,
    /// Cadence of re-reading the top-K from the store and resubscribing.
    pub subscription_refresh: Duration,
    pub ws_reconnect_delay_secs: u64,
    /// Price-update channel depth. Senders drop when full.
    pub channel_capacity: usize,
    pub price_cache: RealtimePriceCacheConfig,
    pub base_price: BasePriceCacheConfig,
    pub change_detection: ChangeDetectionConfig,
    pub retention: SnapshotRetentionConfig,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self {
            top_symbols_count: 15,
            update_interval: Duration::from_secs(5),
            subscription_refresh: Duration::from_secs(300),
            ws_reconnect_delay_secs: 5,
            channel_capacity: 1000,
            price_cache: RealtimePriceCacheConfig::default(),
            base_price: BasePriceCacheConfig::default(),
            change_detection: ChangeDetectionConfig::default(),
            retention: SnapshotRetentionConfig::default(),
        }
    }
}

pub struct RealtimeLeaderboard {
    market: Market,
    config: LeaderboardConfig,
    price_cache: Arc<RealtimePriceCache>,
    base_prices: Arc<BasePriceCache>,
    detector: std::sync::Mutex<ChangeDetector>,
    snapshots: Arc<SnapshotManager>,
    snapshot_repo: Arc<dyn SnapshotRepository>,
    stats_repo: Arc<dyn StatsRepository>,
    ws: Arc<LeaderboardWsManager>,
    update_rx: Mutex<Option<mpsc::Receiver<PriceUpdate>>>,
    current: RwLock<Vec<RankedSymbol>>,
    /// Serializes recomputes; intake and the timed tick both trigger them.
    recompute_gate: Mutex<()>,
    store_has_prior: AtomicBool,
    saves: AtomicU64,
    recomputes: AtomicU64,
    last_recompute_ms: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl RealtimeLeaderboard {
    pub fn new(
        market: Market,
        config: LeaderboardConfig,
        ws_url: String,
        candles: Arc<dyn CandleRepository>,
        stats_repo: Arc<dyn StatsRepository>,
        snapshot_repo: Arc<dyn SnapshotRepository>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let (update_tx, update_rx) = mpsc::channel(config.channel_capacity.max(1));

        let ws = Arc::new(LeaderboardWsManager::new(
            ws_url,
            market,
            config.ws_reconnect_delay_secs,
            update_tx,
        ));
        let base_prices = Arc::new(BasePriceCache::new(
            config.base_price.clone(),
            market,
            candles,
            stats_repo.clone(),
        ));
        let snapshots = Arc::new(SnapshotManager::new(
            market,
            snapshot_repo.clone(),
            config.retention,
        ));

        Arc::new(Self {
            market,
            price_cache: Arc::new(RealtimePriceCache::new(config.price_cache.clone())),
            base_prices,
            detector: std::sync::Mutex::new(ChangeDetector::new(config.change_detection.clone())),
            snapshots,
            snapshot_repo,
            stats_repo,
            ws,
            update_rx: Mutex::new(Some(update_rx)),
            current: RwLock::new(Vec::new()),
            recompute_gate: Mutex::new(()),
            store_has_prior: AtomicBool::new(false),
            saves: AtomicU64::new(0),
            recomputes: AtomicU64::new(0),
            last_recompute_ms: AtomicU64::new(0),
            config,
            shutdown,
        })
    }

    /// Seed subscriptions and the first snapshot, then run the background
    /// tasks until shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Ok(true) = self.snapshot_repo.has_any(self.market).await {
            self.store_has_prior.store(true, Ordering::Release);
        }

        let initial = self.desired_symbols().await;
        self.ws.update_subscription(initial).await?;

        if let Err(e) = self.base_prices.refresh().await {
            warn!(
                "RealtimeLeaderboard[{}]: initial base price refresh failed: {}",
                self.market, e
            );
        }

        // Seed the store immediately rather than waiting for the first tick
        if let Err(e) = self.recompute().await {
            warn!(
                "RealtimeLeaderboard[{}]: seed recompute failed: {}",
                self.market, e
            );
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.intake_loop().await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.timed_recompute_loop().await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.subscription_maintenance_loop().await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.base_price_refresh_loop().await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.cache_cleanup_loop().await });

        let snapshots = self.snapshots.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { snapshots.retention_loop(shutdown).await });

        info!("RealtimeLeaderboard[{}]: started", self.market);
        Ok(())
    }

    /// Current top-K symbols from the store's 24h stats, core list fallback.
    async fn desired_symbols(&self) -> Vec<String> {
        let since = Utc::now() - ChronoDuration::hours(1);
        match self
            .stats_repo
            .top_by_change(self.market, since, self.config.top_symbols_count as i64)
            .await
        {
            Ok(rows) if !rows.is_empty() => rows.into_iter().map(|r| r.symbol).collect(),
            _ => self.config.base_price.core_symbols.clone(),
        }
    }

    /// Drain the bounded update channel; every tick updates the cache and
    /// unconditionally triggers a recompute.
    async fn intake_loop(self: Arc<Self>) {
        let mut rx = match self.update_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut shutdown = self.shutdown.clone();

        loop {
            let update = tokio::select! {
                update = rx.recv() => update,
                _ = shutdown.changed() => return,
            };
            let Some(update) = update else { return };

            self.price_cache.insert(update);
            if let Err(e) = self.recompute().await {
                debug!(
                    "RealtimeLeaderboard[{}]: recompute failed: {}",
                    self.market, e
                );
            }
        }
    }

    async fn timed_recompute_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if let Err(e) = self.recompute().await {
                debug!(
                    "RealtimeLeaderboard[{}]: timed recompute failed: {}",
                    self.market, e
                );
            }
        }
    }

    async fn subscription_maintenance_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.subscription_refresh);
        ticker.tick().await; // the start() call already subscribed

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let desired = self.desired_symbols().await;
            let current = self.ws.subscribed().await;
            let adds = desired.iter().filter(|s| !current.contains(s)).count();
            let removes = current.iter().filter(|s| !desired.contains(s)).count();
            if adds > 0 || removes > 0 {
                debug!(
                    "RealtimeLeaderboard[{}]: subscription drift (+{} / -{}), resubscribing",
                    self.market, adds, removes
                );
            }
            // One SUBSCRIBE with the full desired set; repeats are idempotent
            if let Err(e) = self.ws.update_subscription(desired).await {
                warn!(
                    "RealtimeLeaderboard[{}]: subscription refresh failed: {}",
                    self.market, e
                );
            }
        }
    }

    async fn base_price_refresh_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.base_price.refresh_interval);
        ticker.tick().await; // start() did the initial refresh

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if let Err(e) = self.base_prices.refresh().await {
                warn!(
                    "RealtimeLeaderboard[{}]: base price refresh failed: {}",
                    self.market, e
                );
            }
        }
    }

    async fn cache_cleanup_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(CACHE_CLEANUP_TICK);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            self.price_cache.cleanup();
        }
    }

    /// One recompute pass over the price cache.
    pub async fn recompute(&self) -> Result<()> {
        let _gate = self.recompute_gate.lock().await;
        self.recomputes.fetch_add(1, Ordering::Relaxed);
        let started = std::time::Instant::now();

        let cached = self.price_cache.snapshot();
        if cached.is_empty() {
            self.current.write().expect("board poisoned").clear();
            return Ok(());
        }

        // Stats lookup table; on failure the traditional path (base-price
        // cache) takes over
        let since = Utc::now() - ChronoDuration::hours(1);
        let stats_rows: Option<HashMap<String, StatsRow>> = match self
            .stats_repo
            .top_by_change(self.market, since, STATS_LOOKUP_LIMIT)
            .await
        {
            Ok(rows) => Some(rows.into_iter().map(|r| (r.symbol.clone(), r)).collect()),
            Err(e) => {
                debug!(
                    "RealtimeLeaderboard[{}]: stats lookup failed, traditional path: {}",
                    self.market, e
                );
                None
            }
        };

        let mut board = Vec::with_capacity(cached.len());
        for update in cached {
            let Some(entry) = self.rank_entry(&update, stats_rows.as_ref()).await else {
                continue;
            };
            board.push(entry);
        }

        board.sort_by(|a, b| {
            b.change_percent
                .partial_cmp(&a.change_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        board.truncate(self.config.top_symbols_count);
        for (i, item) in board.iter_mut().enumerate() {
            item.rank = i as u32 + 1;
        }

        let decision = {
            let mut detector = self.detector.lock().expect("detector poisoned");
            detector.evaluate(&board, self.store_has_prior.load(Ordering::Acquire))
        };

        if decision != SaveDecision::Skip {
            match self.snapshots.save(Utc::now(), &board).await {
                Ok(id) => {
                    self.store_has_prior.store(true, Ordering::Release);
                    self.saves.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "RealtimeLeaderboard[{}]: wrote snapshot {} ({:?})",
                        self.market, id, decision
                    );
                }
                Err(e) => {
                    warn!(
                        "RealtimeLeaderboard[{}]: snapshot save failed: {}",
                        self.market, e
                    );
                }
            }
        }

        *self.current.write().expect("board poisoned") = board;
        self.last_recompute_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn last_recompute_duration(&self) -> Duration {
        Duration::from_millis(self.last_recompute_ms.load(Ordering::Relaxed))
    }

    /// Resolve change percent and volume for one cached tick.
    ///
    /// Change percent priority: the WS tick's own change, then the stats row,
    /// then the base-price derivation. On the traditional path (no stats),
    /// symbols without a usable base price are skipped.
    async fn rank_entry(
        &self,
        update: &PriceUpdate,
        stats: Option<&HashMap<String, StatsRow>>,
    ) -> Option<RankedSymbol> {
        let stats_row = stats.and_then(|map| map.get(&update.symbol));

        let (change_percent, source) = if let Some(change) = update.change_percent {
            (change, PriceSource::Websocket)
        } else if let Some(row) = stats_row {
            (row.price_change_percent, PriceSource::Stats)
        } else {
            // Traditional path: derived from the base price; the tick's own
            // source label is preserved
            let change = self
                .base_prices
                .change_percent(&update.symbol, update.price)?;
            (change, update.source)
        };

        let volume_24h = if let Some(volume) = update.volume_24h {
            volume
        } else if let Some(row) = stats_row {
            row.volume
        } else {
            self.stats_repo
                .volume_24h(&update.symbol, self.market)
                .await
                .ok()
                .flatten()
                .unwrap_or(Decimal::ZERO)
        };

        Some(RankedSymbol {
            rank: 0,
            symbol: update.symbol.clone(),
            current_price: update.price,
            change_percent,
            volume_24h,
            price_change_percent: update.change_percent,
            data_source: source,
        })
    }

    pub fn current_board(&self) -> Vec<RankedSymbol> {
        self.current.read().expect("board poisoned").clone()
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    pub fn price_cache(&self) -> &RealtimePriceCache {
        &self.price_cache
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub async fn stop(&self) {
        self.ws.shutdown().await;
    }
}
