use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the exchange an instrument trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Market {
    #[default]
    Spot,
    Futures,
}

impl Market {
    pub const ALL: [Market; 2] = [Market::Spot, Market::Futures];

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::Futures => "futures",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Market {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spot" => Ok(Market::Spot),
            "futures" => Ok(Market::Futures),
            _ => anyhow::bail!("Invalid market: {}. Must be 'spot' or 'futures'", s),
        }
    }
}

/// One tradable pair as listed by the exchange, qualified by market.
///
/// Rows are soft-deleted: an instrument that disappears from the upstream
/// listing keeps its row with `is_active = false` and a `deactivated_at`
/// timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub market: Market,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub base_precision: i32,
    pub quote_precision: i32,
    /// Exchange filter rules, serialized as received.
    pub filters: String,
    pub permissions: String,
    pub is_active: bool,
    pub last_seen_active: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Latest known price for one `(symbol, market)` key. Upserted in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceCacheRow {
    pub symbol: String,
    pub market: Market,
    /// Price exactly as the exchange returned it.
    pub price: String,
    pub price_change_24h: Option<Decimal>,
    pub last_updated: DateTime<Utc>,
}

/// OHLCV bar for `(symbol, market, interval, open_time)`.
///
/// `open_time` is exchange-derived epoch milliseconds. No mutation after the
/// bar closes; re-syncs upsert the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub market: Market,
    pub interval: String,
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Option<Decimal>,
    pub trade_count: Option<i64>,
}

/// Top-of-book depth snapshot, append-only.
///
/// Bids and asks hold `[price, quantity]` string pairs in the exact order the
/// exchange sent them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub symbol: String,
    pub market: Market,
    pub last_update_id: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
    pub snapshot_time_ms: i64,
}

/// Rolling 24-hour ticker for one `(symbol, market)`.
///
/// Numeric fields stay as the strings the exchange returned; arithmetic is
/// done on parsed copies only where a consumer needs it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,
    pub market: Market,
    pub price_change: String,
    pub price_change_percent: String,
    pub weighted_avg_price: String,
    pub last_price: String,
    pub open_price: String,
    pub high_price: String,
    pub low_price: String,
    pub volume: String,
    pub quote_volume: String,
    pub open_time: i64,
    pub close_time: i64,
    pub trade_count: i64,
    /// Best bid, merged from the futures book ticker when available.
    pub bid_price: Option<String>,
    pub ask_price: Option<String>,
}

/// Hour-aligned UTC window for a 24h-stats history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: i64,
}

impl StatsWindow {
    /// The one-hour window containing `now`, aligned down to the UTC hour.
    pub fn hourly(now: DateTime<Utc>) -> Self {
        let start = now
            .date_naive()
            .and_hms_opt(chrono::Timelike::hour(&now), 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now);
        Self {
            start,
            end: start + chrono::Duration::hours(1),
            duration_secs: 3600,
        }
    }
}

/// Where a resolved funding rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingSource {
    Historical,
    Realtime,
    Settled,
}

impl FundingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundingSource::Historical => "historical",
            FundingSource::Realtime => "realtime",
            FundingSource::Settled => "settled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    pub funding_rate: String,
    pub funding_time: i64,
    pub source: FundingSource,
}

/// Perpetual contract definition from the futures exchange info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesContract {
    pub symbol: String,
    pub status: String,
    pub contract_type: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// JSON-serialized arrays, stored as text.
    pub order_types: String,
    pub time_in_force: String,
    pub filters: String,
    pub underlying_sub_type: String,
}

/// A single trade print from the WS trade stream. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePrint {
    pub symbol: String,
    pub market: Market,
    pub trade_id: i64,
    pub price: String,
    pub quantity: String,
    pub trade_time: i64,
    pub is_buyer_maker: bool,
}

/// Source of a realtime price observation, in falling order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    Websocket,
    Http,
    Stats,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Websocket => "websocket",
            PriceSource::Http => "http",
            PriceSource::Stats => "stats",
        }
    }
}

/// One entry of a computed leaderboard, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedSymbol {
    pub rank: u32,
    pub symbol: String,
    pub current_price: Decimal,
    pub change_percent: Decimal,
    pub volume_24h: Decimal,
    pub price_change_percent: Option<Decimal>,
    pub data_source: PriceSource,
}

/// Header of a persisted leaderboard snapshot.
#[derive(Debug, Clone)]
pub struct GainersSnapshot {
    pub id: i64,
    pub market: Market,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_round_trips_through_str() {
        for market in Market::ALL {
            let parsed: Market = market.as_str().parse().unwrap();
            assert_eq!(parsed, market);
        }
        assert!("margin".parse::<Market>().is_err());
    }

    #[test]
    fn hourly_window_aligns_to_utc_hour() {
        let now = DateTime::parse_from_rfc3339("2024-03-05T13:47:21Z")
            .unwrap()
            .with_timezone(&Utc);
        let window = StatsWindow::hourly(now);
        assert_eq!(window.start.to_rfc3339(), "2024-03-05T13:00:00+00:00");
        assert_eq!(window.end.to_rfc3339(), "2024-03-05T14:00:00+00:00");
        assert_eq!(window.duration_secs, 3600);
    }
}
