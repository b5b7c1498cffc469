//! WebSocket fleet
//!
//! One connection pool per market. Streams are grouped by type (ticker,
//! kline per interval, depth, trade) and split into groups of at most 100
//! streams, each bound to its own dedicated connection. When the symbol
//! universe exceeds the configured cap, subscriptions go to the top-K symbols
//! by activity score.
//!
//! Incoming messages land in per-kind caches; a periodic batch-save tick
//! drains them through the same repositories the REST syncers use.

use crate::domain::repositories::{
    ActivityMetrics, CandleRepository, DepthRepository, PriceCacheRepository, StatsRepository,
    TradeRepository,
};
use crate::domain::types::{Candle, DepthSnapshot, Market, PriceCacheRow, TradePrint};
use crate::infrastructure::binance::common::{stream_name, symbol_of_stream};
use crate::infrastructure::binance::websocket::{
    ConnectionSettings, ConnectionType, StreamKind, WsConnection, spawn_connection,
};
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Silence across a whole market that triggers a global reconnection.
const GLOBAL_RECONNECT_SILENCE: Duration = Duration::from_secs(300);
/// Message rate above which the fleet grows its subscription set.
const HIGH_RATE_MSGS_PER_SEC: f64 = 20.0;
/// Message rate below which the fleet shrinks a large subscription set.
const LOW_RATE_MSGS_PER_SEC: f64 = 1.0;
const LOW_RATE_GRACE: Duration = Duration::from_secs(60);
const ADJUST_ADD_COUNT: usize = 10;
const ADJUST_REMOVE_COUNT: usize = 20;
/// A universe is "large" once it passes this many subscriptions.
const LARGE_UNIVERSE: usize = 100;

#[derive(Debug, Clone)]
pub struct WsFleetConfig {
    pub spot_ws_url: String,
    pub futures_ws_url: String,
    /// Subscription cap per market.
    pub max_symbols: usize,
    pub group_size: usize,
    /// Connection cap per stream type; elastic (distributed stream-group)
    /// types may exceed it, simple types may not.
    pub nominal_connection_cap: usize,
    pub batch_interval: Duration,
    pub reconnect_cooldown: Duration,
    pub max_reconnect_attempts: u32,
    pub health_check_interval: Duration,
    pub auto_adjust: bool,
    pub kline_intervals: Vec<String>,
    pub subscribe_depth: bool,
    pub subscribe_trades: bool,
    pub core_symbols: Vec<String>,
}

impl Default for WsFleetConfig {
    fn default() -> Self {
        Self {
            spot_ws_url: super::common::DEFAULT_SPOT_WS_URL.to_string(),
            futures_ws_url: super::common::DEFAULT_FUTURES_WS_URL.to_string(),
            max_symbols: 400,
            group_size: 100,
            nominal_connection_cap: 8,
            batch_interval: Duration::from_secs(1),
            reconnect_cooldown: Duration::from_secs(5),
            max_reconnect_attempts: 3,
            health_check_interval: Duration::from_secs(30),
            auto_adjust: true,
            kline_intervals: vec!["1m".to_string()],
            subscribe_depth: true,
            subscribe_trades: true,
            core_symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "BNBUSDT".to_string(),
            ],
        }
    }
}

/// Latest price observed on a ticker stream. The raw string is preserved for
/// downstream precision.
#[derive(Debug, Clone)]
pub struct WsPrice {
    pub symbol: String,
    pub price_raw: String,
    pub price: Decimal,
    pub change_percent: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub observed_at_ms: i64,
}

/// Per-market health snapshot exposed to the monitoring component.
#[derive(Debug, Clone, Default)]
pub struct MarketHealth {
    pub connections: usize,
    pub healthy_connections: usize,
    pub last_message_age: Option<Duration>,
    pub message_count: u64,
    pub reconnect_count: u64,
    pub subscribed_symbols: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FleetHealth {
    pub markets: HashMap<Market, MarketHealth>,
}

struct MarketPool {
    connections: tokio::sync::Mutex<Vec<WsConnection>>,
    subscribed: RwLock<Vec<String>>,
    last_message_ms: AtomicI64,
    message_count: AtomicU64,
    /// Shared with every connection task; per-connection reconnect triggers
    /// and global reconnections both land here.
    reconnect_count: Arc<AtomicU64>,
    rate_window: Mutex<RateWindow>,
}

struct RateWindow {
    checked_at: Instant,
    count_at_check: u64,
    low_since: Option<Instant>,
}

pub struct WsFleet {
    config: WsFleetConfig,
    pools: HashMap<Market, Arc<MarketPool>>,
    prices: HashMap<Market, RwLock<HashMap<String, WsPrice>>>,
    kline_cache: Mutex<HashMap<(String, Market, String, i64), Candle>>,
    depth_cache: Mutex<HashMap<(String, Market), DepthSnapshot>>,
    trade_buffer: Mutex<Vec<TradePrint>>,
    price_repo: Arc<dyn PriceCacheRepository>,
    candle_repo: Arc<dyn CandleRepository>,
    depth_repo: Arc<dyn DepthRepository>,
    trade_repo: Arc<dyn TradeRepository>,
    stats_repo: Arc<dyn StatsRepository>,
    shutdown: watch::Receiver<bool>,
}

impl WsFleet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WsFleetConfig,
        price_repo: Arc<dyn PriceCacheRepository>,
        candle_repo: Arc<dyn CandleRepository>,
        depth_repo: Arc<dyn DepthRepository>,
        trade_repo: Arc<dyn TradeRepository>,
        stats_repo: Arc<dyn StatsRepository>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let mut pools = HashMap::new();
        let mut prices = HashMap::new();
        for market in Market::ALL {
            pools.insert(
                market,
                Arc::new(MarketPool {
                    connections: tokio::sync::Mutex::new(Vec::new()),
                    subscribed: RwLock::new(Vec::new()),
                    last_message_ms: AtomicI64::new(Utc::now().timestamp_millis()),
                    message_count: AtomicU64::new(0),
                    reconnect_count: Arc::new(AtomicU64::new(0)),
                    rate_window: Mutex::new(RateWindow {
                        checked_at: Instant::now(),
                        count_at_check: 0,
                        low_since: None,
                    }),
                }),
            );
            prices.insert(market, RwLock::new(HashMap::new()));
        }

        Arc::new(Self {
            config,
            pools,
            prices,
            kline_cache: Mutex::new(HashMap::new()),
            depth_cache: Mutex::new(HashMap::new()),
            trade_buffer: Mutex::new(Vec::new()),
            price_repo,
            candle_repo,
            depth_repo,
            trade_repo,
            stats_repo,
            shutdown,
        })
    }

    /// Subscribe each market's universe (capped by activity score) and start
    /// the batch-save and health loops.
    pub async fn start(self: &Arc<Self>, universes: HashMap<Market, Vec<String>>) -> Result<()> {
        for (market, universe) in universes {
            let selected = self.select_universe(market, universe).await;
            self.resubscribe_market(market, selected).await;
        }

        let fleet = Arc::clone(self);
        tokio::spawn(async move { fleet.batch_save_loop().await });

        let fleet = Arc::clone(self);
        tokio::spawn(async move { fleet.health_loop().await });

        Ok(())
    }

    /// Rank the universe by activity score and keep the top-K when it exceeds
    /// the configured cap.
    async fn select_universe(&self, market: Market, universe: Vec<String>) -> Vec<String> {
        if universe.len() <= self.config.max_symbols {
            return universe;
        }

        let metrics = self
            .stats_repo
            .activity_metrics(market)
            .await
            .unwrap_or_default();
        let fresh: HashSet<String> = {
            let prices = self.prices[&market].read().expect("price lock poisoned");
            let now_ms = Utc::now().timestamp_millis();
            prices
                .values()
                .filter(|p| now_ms - p.observed_at_ms < 60_000)
                .map(|p| p.symbol.clone())
                .collect()
        };

        let mut scored: Vec<(f64, String)> = universe
            .into_iter()
            .map(|symbol| {
                let score = activity_score(
                    &symbol,
                    metrics.get(&symbol),
                    fresh.contains(&symbol),
                    &self.config.core_symbols,
                );
                (score, symbol)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        info!(
            "WsFleet[{}]: universe exceeds cap, keeping top {} of {}",
            market,
            self.config.max_symbols,
            scored.len()
        );

        scored
            .into_iter()
            .take(self.config.max_symbols)
            .map(|(_, s)| s)
            .collect()
    }

    fn ws_url(&self, market: Market) -> &str {
        match market {
            Market::Spot => &self.config.spot_ws_url,
            Market::Futures => &self.config.futures_ws_url,
        }
    }

    fn enabled_kinds(&self) -> Vec<StreamKind> {
        let mut kinds = vec![StreamKind::Ticker];
        for interval in &self.config.kline_intervals {
            kinds.push(StreamKind::Kline(interval.clone()));
        }
        if self.config.subscribe_depth {
            kinds.push(StreamKind::Depth);
        }
        if self.config.subscribe_trades {
            kinds.push(StreamKind::Trade);
        }
        kinds
    }

    /// Tear down every connection in the market and rebuild the distributed
    /// stream groups for the desired symbol set.
    async fn resubscribe_market(self: &Arc<Self>, market: Market, symbols: Vec<String>) {
        let pool = self.pools[&market].clone();

        {
            let mut connections = pool.connections.lock().await;
            for conn in connections.drain(..) {
                conn.abort();
            }
        }

        let settings = ConnectionSettings {
            ws_url: self.ws_url(market).to_string(),
            reconnect_cooldown: self.config.reconnect_cooldown,
            max_reconnect_attempts: self.config.max_reconnect_attempts,
            read_deadline: Duration::from_secs(60),
        };

        let mut new_connections = Vec::new();
        for kind in self.enabled_kinds() {
            let suffix = kind.suffix();
            let streams: Vec<String> = symbols.iter().map(|s| stream_name(s, &suffix)).collect();

            for (group, group_streams) in
                split_into_groups(&streams, self.config.group_size).into_iter().enumerate()
            {
                let conn_type = ConnectionType {
                    market,
                    kind: kind.clone(),
                    group,
                    elastic: kind.is_elastic(),
                };
                if !conn_type.elastic && group >= self.config.nominal_connection_cap {
                    warn!(
                        "WsFleet[{}]: connection cap reached for {}, dropping remaining groups",
                        market,
                        conn_type.label()
                    );
                    break;
                }
                let fleet = Arc::clone(self);
                let dispatch: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(move |text: &str| {
                    fleet.handle_message(market, text);
                });
                new_connections.push(spawn_connection(
                    conn_type,
                    group_streams,
                    settings.clone(),
                    dispatch,
                    pool.reconnect_count.clone(),
                    self.shutdown.clone(),
                ));
            }
        }

        info!(
            "WsFleet[{}]: subscribed {} symbols across {} connections",
            market,
            symbols.len(),
            new_connections.len()
        );

        *pool.connections.lock().await = new_connections;
        *pool.subscribed.write().expect("subscribed lock poisoned") = symbols;
    }

    /// Parse one raw frame and route it into the matching cache.
    fn handle_message(&self, market: Market, text: &str) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };

        // Subscription acks carry only an id
        if value.get("result").is_some() || (value.get("id").is_some() && value.get("e").is_none())
        {
            return;
        }

        let pool = &self.pools[&market];
        pool.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        pool.message_count.fetch_add(1, Ordering::Relaxed);

        // Combined format wraps the payload; single-stream format is bare
        let (stream, data) = match (value.get("stream"), value.get("data")) {
            (Some(stream), Some(data)) => (
                stream.as_str().map(|s| s.to_string()),
                data.clone(),
            ),
            _ => (None, value),
        };

        self.handle_payload(market, stream.as_deref(), data);
    }

    fn handle_payload(&self, market: Market, stream: Option<&str>, data: serde_json::Value) {
        let event = data.get("e").and_then(|e| e.as_str()).unwrap_or_default();
        let by_suffix = |suffix: &str| stream.map(|s| s.contains(suffix)).unwrap_or(false);

        if event == "24hrTicker" || by_suffix("@ticker") {
            self.handle_ticker(market, &data);
        } else if event == "kline" || by_suffix("@kline_") {
            self.handle_kline(market, &data);
        } else if event == "depthUpdate" || data.get("lastUpdateId").is_some() || by_suffix("@depth")
        {
            self.handle_depth(market, stream, &data);
        } else if event == "trade" || event == "aggTrade" || by_suffix("@trade") {
            self.handle_trade(market, &data, event == "aggTrade");
        }
    }

    fn handle_ticker(&self, market: Market, data: &serde_json::Value) {
        let Some(symbol) = data.get("s").and_then(|s| s.as_str()) else {
            return;
        };
        let Some(price_raw) = data.get("c").and_then(|c| c.as_str()) else {
            return;
        };
        let Ok(price) = Decimal::from_str(price_raw) else {
            return;
        };

        let change_percent = data
            .get("P")
            .and_then(|p| p.as_str())
            .and_then(|p| Decimal::from_str(p).ok());
        let volume_24h = data
            .get("q")
            .and_then(|q| q.as_str())
            .and_then(|q| Decimal::from_str(q).ok());
        let observed_at_ms = data
            .get("E")
            .and_then(|e| e.as_i64())
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let tick = WsPrice {
            symbol: symbol.to_string(),
            price_raw: price_raw.to_string(),
            price,
            change_percent,
            volume_24h,
            observed_at_ms,
        };

        let mut prices = self.prices[&market].write().expect("price lock poisoned");
        prices.insert(symbol.to_string(), tick);
    }

    fn handle_kline(&self, market: Market, data: &serde_json::Value) {
        let Some(k) = data.get("k") else { return };
        let Some(symbol) = k.get("s").and_then(|s| s.as_str()) else {
            return;
        };
        let Some(interval) = k.get("i").and_then(|i| i.as_str()) else {
            return;
        };
        let Some(open_time) = k.get("t").and_then(|t| t.as_i64()) else {
            return;
        };

        let decimal_field = |key: &str| {
            k.get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| Decimal::from_str(s).ok())
        };
        let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
            decimal_field("o"),
            decimal_field("h"),
            decimal_field("l"),
            decimal_field("c"),
            decimal_field("v"),
        ) else {
            return;
        };

        let candle = Candle {
            symbol: symbol.to_string(),
            market,
            interval: interval.to_string(),
            open_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: decimal_field("q"),
            trade_count: k.get("n").and_then(|n| n.as_i64()),
        };

        let key = (
            symbol.to_string(),
            market,
            interval.to_string(),
            open_time,
        );
        self.kline_cache
            .lock()
            .expect("kline cache poisoned")
            .insert(key, candle);
    }

    fn handle_depth(&self, market: Market, stream: Option<&str>, data: &serde_json::Value) {
        // Spot partial depth carries no symbol; recover it from the stream name
        let symbol = data
            .get("s")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string())
            .or_else(|| stream.and_then(symbol_of_stream));
        let Some(symbol) = symbol else { return };

        let levels = |key_partial: &str, key_diff: &str| -> Vec<[String; 2]> {
            data.get(key_partial)
                .or_else(|| data.get(key_diff))
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default()
        };
        let bids = levels("bids", "b");
        let asks = levels("asks", "a");
        if bids.is_empty() && asks.is_empty() {
            return;
        }

        let last_update_id = data
            .get("lastUpdateId")
            .or_else(|| data.get("u"))
            .and_then(|v| v.as_i64())
            .unwrap_or_default();

        let snapshot = DepthSnapshot {
            symbol: symbol.clone(),
            market,
            last_update_id,
            bids,
            asks,
            snapshot_time_ms: Utc::now().timestamp_millis(),
        };

        self.depth_cache
            .lock()
            .expect("depth cache poisoned")
            .insert((symbol, market), snapshot);
    }

    fn handle_trade(&self, market: Market, data: &serde_json::Value, agg: bool) {
        let Some(symbol) = data.get("s").and_then(|s| s.as_str()) else {
            return;
        };
        let id_key = if agg { "a" } else { "t" };
        let Some(trade_id) = data.get(id_key).and_then(|t| t.as_i64()) else {
            return;
        };
        let (Some(price), Some(quantity)) = (
            data.get("p").and_then(|p| p.as_str()),
            data.get("q").and_then(|q| q.as_str()),
        ) else {
            return;
        };

        let print = TradePrint {
            symbol: symbol.to_string(),
            market,
            trade_id,
            price: price.to_string(),
            quantity: quantity.to_string(),
            trade_time: data
                .get("T")
                .and_then(|t| t.as_i64())
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            is_buyer_maker: data.get("m").and_then(|m| m.as_bool()).unwrap_or(false),
        };

        self.trade_buffer
            .lock()
            .expect("trade buffer poisoned")
            .push(print);
    }

    /// Drain all caches into the store on a fixed tick.
    async fn batch_save_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.batch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    // Final drain so shutdown loses at most one tick of data
                    self.flush_caches().await;
                    return;
                }
            }
            self.flush_caches().await;
        }
    }

    async fn flush_caches(&self) {
        let klines: Vec<Candle> = {
            let mut cache = self.kline_cache.lock().expect("kline cache poisoned");
            cache.drain().map(|(_, c)| c).collect()
        };
        if !klines.is_empty()
            && let Err(e) = self.candle_repo.upsert_batch(&klines).await
        {
            warn!("WsFleet: batch kline save failed: {}", e);
        }

        let depths: Vec<DepthSnapshot> = {
            let mut cache = self.depth_cache.lock().expect("depth cache poisoned");
            cache.drain().map(|(_, d)| d).collect()
        };
        for depth in &depths {
            if let Err(e) = self.depth_repo.insert(depth).await {
                warn!("WsFleet: batch depth save failed for {}: {}", depth.symbol, e);
            }
        }

        let trades: Vec<TradePrint> = {
            let mut buffer = self.trade_buffer.lock().expect("trade buffer poisoned");
            std::mem::take(&mut *buffer)
        };
        if !trades.is_empty()
            && let Err(e) = self.trade_repo.insert_batch(&trades).await
        {
            warn!("WsFleet: batch trade save failed: {}", e);
        }

        for market in Market::ALL {
            let ticks: Vec<WsPrice> = {
                let prices = self.prices[&market].read().expect("price lock poisoned");
                prices.values().cloned().collect()
            };
            let now = Utc::now();
            for tick in ticks {
                // Only persist ticks from the current batch window
                if now.timestamp_millis() - tick.observed_at_ms
                    > self.config.batch_interval.as_millis() as i64 * 2
                {
                    continue;
                }
                let row = PriceCacheRow {
                    symbol: tick.symbol.clone(),
                    market,
                    price: tick.price_raw.clone(),
                    price_change_24h: tick.change_percent,
                    last_updated: now,
                };
                if let Err(e) = self.price_repo.upsert(&row).await {
                    warn!("WsFleet: price cache save failed for {}: {}", tick.symbol, e);
                }
            }
        }
    }

    /// Watch for market-wide silence and drive dynamic subscription sizing.
    async fn health_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            for market in Market::ALL {
                let pool = self.pools[&market].clone();
                let subscribed = pool
                    .subscribed
                    .read()
                    .expect("subscribed lock poisoned")
                    .clone();
                if subscribed.is_empty() {
                    continue;
                }

                let silence_ms =
                    Utc::now().timestamp_millis() - pool.last_message_ms.load(Ordering::Acquire);
                if silence_ms > GLOBAL_RECONNECT_SILENCE.as_millis() as i64 {
                    warn!(
                        "WsFleet[{}]: no message for {}s, triggering global reconnection",
                        market,
                        silence_ms / 1000
                    );
                    pool.reconnect_count.fetch_add(1, Ordering::Relaxed);
                    self.resubscribe_market(market, subscribed.clone()).await;
                    // Reset so the next check does not immediately re-trigger
                    pool.last_message_ms
                        .store(Utc::now().timestamp_millis(), Ordering::Release);
                    continue;
                }

                if self.config.auto_adjust {
                    self.adjust_subscriptions(market, &pool, subscribed).await;
                }
            }
        }
    }

    async fn adjust_subscriptions(
        self: &Arc<Self>,
        market: Market,
        pool: &Arc<MarketPool>,
        subscribed: Vec<String>,
    ) {
        let total = pool.message_count.load(Ordering::Relaxed);
        let (rate, low_for) = {
            let mut window = pool.rate_window.lock().expect("rate window poisoned");
            let elapsed = window.checked_at.elapsed().as_secs_f64().max(0.001);
            let rate = (total.saturating_sub(window.count_at_check)) as f64 / elapsed;
            window.checked_at = Instant::now();
            window.count_at_check = total;

            let low_for = if rate < LOW_RATE_MSGS_PER_SEC {
                let since = *window.low_since.get_or_insert_with(Instant::now);
                since.elapsed()
            } else {
                window.low_since = None;
                Duration::ZERO
            };
            (rate, low_for)
        };

        if rate > HIGH_RATE_MSGS_PER_SEC && subscribed.len() < self.config.max_symbols {
            let metrics = self
                .stats_repo
                .activity_metrics(market)
                .await
                .unwrap_or_default();
            let current: HashSet<&String> = subscribed.iter().collect();
            let mut candidates: Vec<(f64, String)> = metrics
                .iter()
                .filter(|(symbol, _)| !current.contains(symbol))
                .map(|(symbol, m)| {
                    (
                        activity_score(symbol, Some(m), false, &self.config.core_symbols),
                        symbol.clone(),
                    )
                })
                .collect();
            candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

            let room = self.config.max_symbols - subscribed.len();
            let additions: Vec<String> = candidates
                .into_iter()
                .take(ADJUST_ADD_COUNT.min(room))
                .map(|(_, s)| s)
                .collect();
            if !additions.is_empty() {
                info!(
                    "WsFleet[{}]: high message rate ({:.1}/s), adding {} subscriptions",
                    market,
                    rate,
                    additions.len()
                );
                let mut desired = subscribed;
                desired.extend(additions);
                self.resubscribe_market(market, desired).await;
            }
        } else if low_for > LOW_RATE_GRACE && subscribed.len() > LARGE_UNIVERSE {
            let metrics = self
                .stats_repo
                .activity_metrics(market)
                .await
                .unwrap_or_default();
            let mut scored: Vec<(f64, String)> = subscribed
                .iter()
                .map(|symbol| {
                    (
                        activity_score(
                            symbol,
                            metrics.get(symbol),
                            false,
                            &self.config.core_symbols,
                        ),
                        symbol.clone(),
                    )
                })
                .collect();
            // Lowest scores first; those get dropped
            scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            let drop: HashSet<String> = scored
                .into_iter()
                .take(ADJUST_REMOVE_COUNT)
                .map(|(_, s)| s)
                .collect();

            info!(
                "WsFleet[{}]: low message rate ({:.1}/s) for {:?}, removing {} subscriptions",
                market,
                rate,
                low_for,
                drop.len()
            );
            let desired: Vec<String> = subscribed
                .into_iter()
                .filter(|s| !drop.contains(s))
                .collect();
            self.resubscribe_market(market, desired).await;
        }
    }

    // ----- read API -----

    pub fn get_latest_price(&self, symbol: &str, market: Market) -> Option<WsPrice> {
        self.prices[&market]
            .read()
            .expect("price lock poisoned")
            .get(symbol)
            .cloned()
    }

    pub fn is_price_fresh(&self, symbol: &str, market: Market, max_age: Duration) -> bool {
        self.get_latest_price(symbol, market)
            .map(|p| {
                let age_ms = Utc::now().timestamp_millis() - p.observed_at_ms;
                age_ms >= 0 && (age_ms as u128) < max_age.as_millis()
            })
            .unwrap_or(false)
    }

    /// The fleet is healthy when every subscribed market has seen a message
    /// within the global-silence window.
    pub fn is_healthy(&self) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        self.pools.values().all(|pool| {
            let subscribed = pool
                .subscribed
                .read()
                .expect("subscribed lock poisoned")
                .len();
            if subscribed == 0 {
                return true;
            }
            now_ms - pool.last_message_ms.load(Ordering::Acquire)
                < GLOBAL_RECONNECT_SILENCE.as_millis() as i64
        })
    }

    pub async fn get_health_status(&self) -> FleetHealth {
        let mut health = FleetHealth::default();
        let now_ms = Utc::now().timestamp_millis();
        for (market, pool) in &self.pools {
            let connections = pool.connections.lock().await;
            let last_ms = pool.last_message_ms.load(Ordering::Acquire);
            health.markets.insert(
                *market,
                MarketHealth {
                    connections: connections.len(),
                    healthy_connections: connections.iter().filter(|c| c.is_healthy()).count(),
                    last_message_age: (now_ms >= last_ms)
                        .then(|| Duration::from_millis((now_ms - last_ms) as u64)),
                    message_count: pool.message_count.load(Ordering::Relaxed),
                    reconnect_count: pool.reconnect_count.load(Ordering::Relaxed),
                    subscribed_symbols: pool
                        .subscribed
                        .read()
                        .expect("subscribed lock poisoned")
                        .len(),
                },
            );
        }
        health
    }

    pub fn reconnect_count(&self) -> u64 {
        self.pools
            .values()
            .map(|p| p.reconnect_count.load(Ordering::Relaxed))
            .sum()
    }
}

/// Activity score for smart symbol selection: fresh cached price, 24h volume
/// and quote volume, absolute change as a volatility proxy, and a boost for
/// the curated core set.
pub fn activity_score(
    symbol: &str,
    metrics: Option<&ActivityMetrics>,
    has_fresh_price: bool,
    core_symbols: &[String],
) -> f64 {
    let mut score = 0.0;
    if has_fresh_price {
        score += 25.0;
    }
    if let Some(m) = metrics {
        score += m.volume.max(0.0).ln_1p();
        score += m.quote_volume.max(0.0).ln_1p();
        score += m.change_percent_abs * 2.0;
    }
    if core_symbols.iter().any(|c| c == symbol) {
        score += 50.0;
    }
    score
}

/// Split a stream list into groups of at most `group_size`.
pub fn split_into_groups(streams: &[String], group_size: usize) -> Vec<Vec<String>> {
    if streams.is_empty() {
        return Vec::new();
    }
    streams
        .chunks(group_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_are_bounded_at_group_size() {
        let streams: Vec<String> = (0..250).map(|i| format!("sym{}@ticker", i)).collect();
        let groups = split_into_groups(&streams, 100);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 100);
        assert_eq!(groups[2].len(), 50);
        assert!(split_into_groups(&[], 100).is_empty());
    }

    #[test]
    fn core_symbols_outrank_quiet_symbols() {
        let core = vec!["BTCUSDT".to_string()];
        let quiet = ActivityMetrics {
            volume: 10.0,
            quote_volume: 100.0,
            change_percent_abs: 0.1,
        };
        let core_score = activity_score("BTCUSDT", Some(&quiet), false, &core);
        let other_score = activity_score("DOGEUSDT", Some(&quiet), false, &core);
        assert!(core_score > other_score);
    }

    #[test]
    fn volatile_high_volume_symbols_score_higher() {
        let busy = ActivityMetrics {
            volume: 1_000_000.0,
            quote_volume: 50_000_000.0,
            change_percent_abs: 12.0,
        };
        let quiet = ActivityMetrics {
            volume: 100.0,
            quote_volume: 1_000.0,
            change_percent_abs: 0.2,
        };
        let busy_score = activity_score("AUSDT", Some(&busy), false, &[]);
        let quiet_score = activity_score("BUSDT", Some(&quiet), true, &[]);
        assert!(busy_score > quiet_score);
    }
}
