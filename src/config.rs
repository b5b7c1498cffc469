//! Environment-driven configuration.
//!
//! `Config::from_env` reads the full tree once at startup. The supervisor is
//! the only component that sees the whole struct; it builds small
//! per-component configs from it and passes them by value, so no syncer holds
//! a reference into the global tree.

use crate::application::leaderboard::base_price::BasePriceCacheConfig;
use crate::application::leaderboard::{
    ChangeDetectionConfig, LeaderboardConfig, RealtimePriceCacheConfig, SnapshotRetentionConfig,
};
use crate::application::monitoring::{ConsistencyConfig, MonitoringThresholds};
use crate::application::scheduler::SchedulerConfig;
use crate::application::syncers::candles::CandleSyncConfig;
use crate::application::syncers::depth::DepthSyncConfig;
use crate::application::syncers::futures_info::FuturesSyncConfig;
use crate::application::syncers::price::PriceSyncConfig;
use crate::application::syncers::stats24h::StatsSyncConfig;
use crate::infrastructure::binance::common;
use crate::infrastructure::binance::fleet::WsFleetConfig;
use crate::infrastructure::binance::rest::BinanceApiConfig;
use crate::infrastructure::cache::invalid_symbols::InvalidSymbolCacheConfig;
use crate::infrastructure::core::rate_limiter::RateLimiterConfig;
use anyhow::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Sync periods in fractional minutes.
#[derive(Debug, Clone, Copy)]
pub struct SyncPeriods {
    pub price: f64,
    pub kline: f64,
    pub futures: f64,
    pub depth: f64,
    pub exchange_info: f64,
    pub stats: f64,
}

impl SyncPeriods {
    pub fn as_duration(minutes: f64) -> Duration {
        Duration::from_secs_f64(minutes.max(0.01) * 60.0)
    }
}

impl Default for SyncPeriods {
    fn default() -> Self {
        Self {
            price: 1.0,
            kline: 5.0,
            futures: 10.0,
            depth: 0.5,
            exchange_info: 60.0,
            stats: 30.0,
        }
    }
}

/// Feature switches. Defaults lean everything on; tests and constrained
/// deployments turn pieces off.
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlags {
    pub incremental_sync: bool,
    pub historical_funding: bool,
    pub realtime_leaderboard: bool,
    pub ws_sync: bool,
    pub smart_scheduler: bool,
    pub consistency: bool,
    pub monitoring: bool,
    pub metrics: bool,
    pub caching: bool,
    pub redis_cache: bool,
    pub data_validation: bool,
    pub compression: bool,
    pub historical_sync: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            incremental_sync: true,
            historical_funding: true,
            realtime_leaderboard: true,
            ws_sync: true,
            smart_scheduler: true,
            consistency: true,
            monitoring: true,
            metrics: true,
            caching: true,
            redis_cache: true,
            data_validation: true,
            compression: false,
            historical_sync: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub api: BinanceApiConfig,
    pub ws: WsFleetConfig,
    pub periods: SyncPeriods,
    pub features: FeatureFlags,
    pub leaderboard: LeaderboardConfig,
    pub rate_limits: RateLimiterConfig,
    pub kv: InvalidSymbolCacheConfig,
    pub consistency: ConsistencyConfig,
    pub monitoring: MonitoringThresholds,
    pub scheduler: SchedulerConfig,
    pub metrics_report_interval: Duration,
    pub core_symbols: Vec<String>,
    pub historical_funding_window_hours: i64,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse {}={}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default_secs)?))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env_string("DATABASE_URL", "sqlite://marketsync.db");

        let api = BinanceApiConfig {
            spot_rest_url: env_string("BINANCE_SPOT_REST_URL", common::DEFAULT_SPOT_REST_URL),
            futures_rest_url: env_string(
                "BINANCE_FUTURES_REST_URL",
                common::DEFAULT_FUTURES_REST_URL,
            ),
            timeout: env_secs("API_TIMEOUT_SECS", 10)?,
        };

        let core_symbols: Vec<String> = env_string("CORE_SYMBOLS", "BTCUSDT,ETHUSDT,BNBUSDT")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let ws = WsFleetConfig {
            spot_ws_url: env_string("BINANCE_SPOT_WS_URL", common::DEFAULT_SPOT_WS_URL),
            futures_ws_url: env_string("BINANCE_FUTURES_WS_URL", common::DEFAULT_FUTURES_WS_URL),
            max_symbols: env_parse("WS_MAX_SYMBOLS", 400usize)?,
            group_size: env_parse("WS_GROUP_SIZE", 100usize)?,
            nominal_connection_cap: env_parse("WS_CONNECTION_CAP", 8usize)?,
            batch_interval: Duration::from_millis(env_parse("WS_BATCH_INTERVAL_MS", 1000u64)?),
            reconnect_cooldown: env_secs("WS_RECONNECT_COOLDOWN_SECS", 5)?,
            max_reconnect_attempts: env_parse("WS_MAX_RECONNECT_ATTEMPTS", 3u32)?,
            health_check_interval: env_secs("WS_HEALTH_CHECK_SECS", 30)?,
            auto_adjust: env_bool("WS_AUTO_ADJUST", true),
            kline_intervals: env_string("WS_KLINE_INTERVALS", "1m")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            subscribe_depth: env_bool("WS_SUBSCRIBE_DEPTH", true),
            subscribe_trades: env_bool("WS_SUBSCRIBE_TRADES", true),
            core_symbols: core_symbols.clone(),
        };

        let periods = SyncPeriods {
            price: env_parse("PRICE_SYNC_PERIOD_MIN", 1.0f64)?,
            kline: env_parse("KLINE_SYNC_PERIOD_MIN", 5.0f64)?,
            futures: env_parse("FUTURES_SYNC_PERIOD_MIN", 10.0f64)?,
            depth: env_parse("DEPTH_SYNC_PERIOD_MIN", 0.5f64)?,
            exchange_info: env_parse("EXCHANGE_INFO_SYNC_PERIOD_MIN", 60.0f64)?,
            stats: env_parse("STATS_SYNC_PERIOD_MIN", 30.0f64)?,
        };

        let features = FeatureFlags {
            incremental_sync: env_bool("ENABLE_INCREMENTAL_SYNC", true),
            historical_funding: env_bool("ENABLE_HISTORICAL_FUNDING", true),
            realtime_leaderboard: env_bool("ENABLE_REALTIME_LEADERBOARD", true),
            ws_sync: env_bool("ENABLE_WS_SYNC", true),
            smart_scheduler: env_bool("ENABLE_SMART_SCHEDULER", true),
            consistency: env_bool("ENABLE_CONSISTENCY_CHECK", true),
            monitoring: env_bool("ENABLE_MONITORING", true),
            metrics: env_bool("ENABLE_METRICS", true),
            caching: env_bool("ENABLE_CACHING", true),
            redis_cache: env_bool("ENABLE_REDIS_CACHE", true),
            data_validation: env_bool("ENABLE_DATA_VALIDATION", true),
            compression: env_bool("ENABLE_COMPRESSION", false),
            historical_sync: env_bool("ENABLE_HISTORICAL_SYNC", false),
        };

        let change_detection = ChangeDetectionConfig {
            rank_axis: env_bool("LEADERBOARD_RANK_AXIS", false),
            price_axis: env_bool("LEADERBOARD_PRICE_AXIS", false),
            percent_axis: env_bool("LEADERBOARD_PERCENT_AXIS", true),
            volume_axis: env_bool("LEADERBOARD_VOLUME_AXIS", false),
            rank_threshold: env_parse("LEADERBOARD_RANK_THRESHOLD", 3u32)?,
            price_threshold_pct: env_parse("LEADERBOARD_PRICE_THRESHOLD_PCT", 1.0f64)?,
            percent_threshold: env_parse("LEADERBOARD_PERCENT_THRESHOLD", 0.5f64)?,
            volume_threshold_pct: env_parse("LEADERBOARD_VOLUME_THRESHOLD_PCT", 10.0f64)?,
            min_save_interval: env_secs("LEADERBOARD_MIN_SAVE_SECS", 30)?,
            max_save_interval: env_secs("LEADERBOARD_MAX_SAVE_SECS", 300)?,
        };

        let leaderboard = LeaderboardConfig {
            top_symbols_count: env_parse("LEADERBOARD_TOP_SYMBOLS", 15usize)?,
            update_interval: env_secs("LEADERBOARD_UPDATE_SECS", 5)?,
            subscription_refresh: env_secs("LEADERBOARD_SUBSCRIPTION_REFRESH_SECS", 300)?,
            ws_reconnect_delay_secs: env_parse("LEADERBOARD_WS_RECONNECT_SECS", 5u64)?,
            channel_capacity: env_parse("LEADERBOARD_CHANNEL_CAPACITY", 1000usize)?,
            price_cache: RealtimePriceCacheConfig {
                max_entries: env_parse("LEADERBOARD_PRICE_CACHE_MAX", 10_000usize)?,
                standard_ttl: env_secs("LEADERBOARD_PRICE_CACHE_TTL_SECS", 300)?,
            },
            base_price: BasePriceCacheConfig {
                refresh_interval: env_secs("LEADERBOARD_BASE_REFRESH_SECS", 3600)?,
                top_symbols: env_parse("LEADERBOARD_BASE_TOP_SYMBOLS", 100i64)?,
                core_symbols: core_symbols.clone(),
            },
            change_detection,
            retention: SnapshotRetentionConfig {
                retention_period: env_secs("LEADERBOARD_RETENTION_SECS", 3600)?,
                max_snapshots: env_parse("LEADERBOARD_MAX_SNAPSHOTS", 10i64)?,
            },
        };

        let rate_limits = RateLimiterConfig {
            price_per_sec: env_parse("RATE_LIMIT_PRICE", 8u32)?,
            candles_per_sec: env_parse("RATE_LIMIT_CANDLES", 5u32)?,
            depth_per_sec: env_parse("RATE_LIMIT_DEPTH", 5u32)?,
            general_per_sec: env_parse("RATE_LIMIT_GENERAL", 6u32)?,
        };

        let kv = InvalidSymbolCacheConfig {
            address: env_string("REDIS_ADDRESS", "redis://127.0.0.1:6379"),
            password: env_string("REDIS_PASSWORD", ""),
            db: env_parse("REDIS_DB", 0i64)?,
            key_prefix: env_string("REDIS_KEY_PREFIX", "invalid_symbol:"),
            enabled: features.redis_cache,
        };

        let consistency = ConsistencyConfig {
            check_interval: env_secs("CONSISTENCY_CHECK_SECS", 300)?,
            consistency_window: env_secs("CONSISTENCY_WINDOW_SECS", 1800)?,
            max_data_age: env_secs("MAX_DATA_AGE_SECS", 600)?,
        };

        let monitoring = MonitoringThresholds {
            ws_downtime: env_secs("THRESHOLD_WS_DOWNTIME_SECS", 120)?,
            ws_reconnects_per_check: env_parse("THRESHOLD_WS_RECONNECTS", 5u64)?,
            syncer_error_rate: env_parse("THRESHOLD_API_FAILURE_RATE", 0.2f64)?,
            consistency_score_floor: env_parse("THRESHOLD_CONSISTENCY_SCORE", 70.0f64)?,
            memory_pct: env_parse("THRESHOLD_MEMORY_PCT", 85.0f64)?,
            cpu_pct: env_parse("THRESHOLD_CPU_PCT", 85.0f64)?,
            task_count: env_parse("THRESHOLD_TASK_COUNT", 2000usize)?,
            alert_cooldown: env_secs("ALERT_COOLDOWN_SECS", 300)?,
            check_interval: env_secs("MONITORING_CHECK_SECS", 60)?,
        };

        let scheduler = SchedulerConfig {
            reconnect_threshold: env_parse("SCHEDULER_RECONNECT_THRESHOLD", 10u64)?,
            poll_interval: env_secs("SCHEDULER_POLL_SECS", 15)?,
        };

        Ok(Self {
            database_url,
            api,
            ws,
            periods,
            features,
            leaderboard,
            rate_limits,
            kv,
            consistency,
            monitoring,
            scheduler,
            metrics_report_interval: env_secs("METRICS_REPORT_SECS", 60)?,
            core_symbols,
            historical_funding_window_hours: env_parse("HISTORICAL_FUNDING_WINDOW_HOURS", 4i64)?,
        })
    }

    // ----- per-component configs, built once and passed by value -----

    pub fn price_sync(&self) -> PriceSyncConfig {
        PriceSyncConfig {
            staleness_cutoff: Duration::from_secs(300),
            max_data_age: Duration::from_secs(30),
            core_symbols: self.core_symbols.clone(),
        }
    }

    pub fn stats_sync(&self) -> StatsSyncConfig {
        StatsSyncConfig::default()
    }

    pub fn candle_sync(&self) -> CandleSyncConfig {
        CandleSyncConfig::default()
    }

    pub fn depth_sync(&self) -> DepthSyncConfig {
        DepthSyncConfig::default()
    }

    pub fn futures_sync(&self) -> FuturesSyncConfig {
        FuturesSyncConfig {
            historical_window_hours: self.historical_funding_window_hours,
            historical_funding_enabled: self.features.historical_funding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_without_env() {
        let config = Config::from_env().expect("defaults must parse");
        assert_eq!(config.leaderboard.top_symbols_count, 15);
        assert_eq!(config.rate_limits.candles_per_sec, 5);
        assert!(config.features.realtime_leaderboard);
        assert!(!config.core_symbols.is_empty());
    }

    #[test]
    fn fractional_periods_convert_to_durations() {
        assert_eq!(SyncPeriods::as_duration(0.5), Duration::from_secs(30));
        assert_eq!(SyncPeriods::as_duration(2.0), Duration::from_secs(120));
    }
}
