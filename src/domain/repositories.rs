//! Repository Pattern Abstractions
//!
//! Repository traits for every table the pipeline owns. Syncers and the
//! realtime leaderboard talk to these traits only; the SQLite implementations
//! live in `infrastructure::persistence`.

use crate::domain::types::{
    Candle, DepthSnapshot, FundingRate, FuturesContract, Instrument, Market, PriceCacheRow,
    RankedSymbol, StatsWindow, Ticker24h, TradePrint,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Outcome of one registry reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrySyncOutcome {
    pub upserted: usize,
    pub deactivated: usize,
}

/// Repository for the instrument universe (soft-delete semantics).
#[async_trait]
pub trait InstrumentRepository: Send + Sync {
    /// Reconcile the stored universe for one market against a full upstream
    /// listing, in a single transaction: upsert every fetched row as active,
    /// deactivate every active row missing from the fetch.
    async fn sync_universe(
        &self,
        market: Market,
        fetched: &[Instrument],
        now: DateTime<Utc>,
    ) -> Result<RegistrySyncOutcome>;

    /// Symbols currently flagged active for the market.
    async fn active_symbols(&self, market: Market) -> Result<Vec<String>>;

    /// `Some(is_active)` when the instrument is known, `None` when absent.
    async fn activity(&self, symbol: &str, market: Market) -> Result<Option<bool>>;
}

/// Repository for the single current-price row per `(symbol, market)`.
#[async_trait]
pub trait PriceCacheRepository: Send + Sync {
    async fn upsert(&self, row: &PriceCacheRow) -> Result<()>;

    /// `last_updated` per symbol for the given candidates; missing symbols are
    /// absent from the map.
    async fn last_updated(
        &self,
        market: Market,
        symbols: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>>;

    /// Rows touched since the cutoff, across markets (consistency probe).
    async fn count_updated_since(&self, cutoff: DateTime<Utc>) -> Result<i64>;

    /// Most recent `last_updated` across all rows.
    async fn newest_update(&self) -> Result<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait CandleRepository: Send + Sync {
    /// Upsert a validated batch; returns the number of rows written.
    async fn upsert_batch(&self, candles: &[Candle]) -> Result<u64>;

    /// Rows for the key with `open_time` at or after the cutoff.
    async fn count_recent(
        &self,
        symbol: &str,
        market: Market,
        interval: &str,
        cutoff_ms: i64,
    ) -> Result<i64>;

    /// Latest `open_time` for the key, if any row exists.
    async fn latest_open_time(
        &self,
        symbol: &str,
        market: Market,
        interval: &str,
    ) -> Result<Option<i64>>;

    /// Rows of one interval (any symbol) newer than the cutoff (consistency probe).
    async fn count_interval_since(&self, interval: &str, cutoff_ms: i64) -> Result<i64>;

    /// Newest `open_time` across all rows.
    async fn newest_open_time(&self) -> Result<Option<i64>>;

    /// For each requested symbol, the close of its most recent 1h candle with
    /// `open_time <= cutoff_ms`. One batched query; symbols without a
    /// qualifying row are absent.
    async fn base_prices(
        &self,
        market: Market,
        symbols: &[String],
        cutoff_ms: i64,
    ) -> Result<HashMap<String, Decimal>>;
}

/// Freshness/quality summary used by the 24h-stats incremental rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsFreshness {
    pub recent_rows: i64,
    /// Fraction of recent rows with positive volume and price.
    pub quality_ratio: f64,
    pub latest_update: Option<DateTime<Utc>>,
}

/// One row of the stats table as the leaderboard consumes it.
#[derive(Debug, Clone)]
pub struct StatsRow {
    pub symbol: String,
    pub last_price: Decimal,
    pub price_change_percent: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
}

#[async_trait]
pub trait StatsRepository: Send + Sync {
    /// Upsert the in-place current row for `(symbol, market)`.
    async fn upsert_current(&self, ticker: &Ticker24h, now: DateTime<Utc>) -> Result<()>;

    /// Insert the immutable hour-window history row; conflicts are ignored.
    async fn insert_history(
        &self,
        ticker: &Ticker24h,
        window: &StatsWindow,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Incremental-rule inputs for one symbol over the trailing 24 h of
    /// history rows.
    async fn freshness(
        &self,
        symbol: &str,
        market: Market,
        since: DateTime<Utc>,
    ) -> Result<StatsFreshness>;

    /// Rows with positive volume and price updated since the cutoff, ordered
    /// by change percent descending.
    async fn top_by_change(
        &self,
        market: Market,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StatsRow>>;

    /// Symbols by quote volume descending (base-price refresh candidates).
    async fn top_by_volume(
        &self,
        market: Market,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>>;

    /// Volume / quote-volume / |change%| per symbol, for WS activity scoring.
    async fn activity_metrics(&self, market: Market) -> Result<HashMap<String, ActivityMetrics>>;

    /// 24h volume for one symbol, if a stats row exists.
    async fn volume_24h(&self, symbol: &str, market: Market) -> Result<Option<Decimal>>;
}

/// Store-derived inputs to the WS fleet's activity score.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityMetrics {
    pub volume: f64,
    pub quote_volume: f64,
    pub change_percent_abs: f64,
}

#[async_trait]
pub trait DepthRepository: Send + Sync {
    async fn insert(&self, snapshot: &DepthSnapshot) -> Result<()>;

    /// Most recent snapshot time per symbol among the candidates.
    async fn latest_snapshot_times(
        &self,
        market: Market,
        symbols: &[String],
    ) -> Result<HashMap<String, i64>>;

    /// Snapshots newer than the cutoff (consistency probe).
    async fn count_since(&self, cutoff_ms: i64) -> Result<i64>;
}

#[async_trait]
pub trait TradeRepository: Send + Sync {
    /// Append a batch of prints; duplicate trade ids are ignored.
    async fn insert_batch(&self, trades: &[TradePrint]) -> Result<u64>;
}

#[async_trait]
pub trait FundingRateRepository: Send + Sync {
    async fn upsert(&self, rate: &FundingRate) -> Result<()>;
}

#[async_trait]
pub trait ContractRepository: Send + Sync {
    async fn upsert_batch(&self, contracts: &[FuturesContract]) -> Result<u64>;
}

/// Repository for leaderboard snapshots (header + items).
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Persist one snapshot: header first, then items in rank order, in a
    /// single transaction. Returns the new header id.
    async fn save(
        &self,
        market: Market,
        timestamp: DateTime<Utc>,
        items: &[RankedSymbol],
    ) -> Result<i64>;

    /// Whether any snapshot exists for the market (first-run detection).
    async fn has_any(&self, market: Market) -> Result<bool>;

    /// Delete headers (and their items) older than the cutoff.
    async fn delete_older_than(&self, market: Market, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Keep only the newest `keep` headers for the market.
    async fn retain_newest(&self, market: Market, keep: i64) -> Result<u64>;
}
