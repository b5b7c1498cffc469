//! Common types and constants for Binance infrastructure

use crate::domain::types::Market;

pub const DEFAULT_SPOT_REST_URL: &str = "https://api.binance.com";
pub const DEFAULT_FUTURES_REST_URL: &str = "https://fapi.binance.com";
pub const DEFAULT_SPOT_WS_URL: &str = "wss://stream.binance.com:9443";
pub const DEFAULT_FUTURES_WS_URL: &str = "wss://fstream.binance.com";

/// Kline intervals the pipeline syncs, most granular first.
pub const SYNC_INTERVALS: &[&str] = &["1m", "5m", "15m", "1h", "4h", "1d"];

/// Minimum rows within the trailing 24 h before a key counts as covered.
pub fn interval_min_rows(interval: &str) -> i64 {
    match interval {
        "1m" => 100,
        "5m" => 50,
        "15m" => 30,
        "1h" | "4h" => 10,
        "1d" => 5,
        _ => 10,
    }
}

/// Stream name for one symbol and suffix, e.g. `btcusdt@ticker`.
pub fn stream_name(symbol: &str, suffix: &str) -> String {
    format!("{}{}", symbol.to_lowercase(), suffix)
}

/// Symbol back out of a stream name: `btcusdt@kline_1m` -> `BTCUSDT`.
pub fn symbol_of_stream(stream: &str) -> Option<String> {
    stream
        .split('@')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_uppercase())
}

/// REST path prefix differs between the two markets.
pub fn rest_path(market: Market, endpoint: &str) -> String {
    match market {
        Market::Spot => format!("/api/v3/{}", endpoint),
        Market::Futures => format!("/fapi/v1/{}", endpoint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names_are_lowercased() {
        assert_eq!(stream_name("BTCUSDT", "@ticker"), "btcusdt@ticker");
        assert_eq!(stream_name("ethusdt", "@kline_1m"), "ethusdt@kline_1m");
    }

    #[test]
    fn symbol_recovers_from_stream_name() {
        assert_eq!(
            symbol_of_stream("btcusdt@kline_1m").as_deref(),
            Some("BTCUSDT")
        );
        assert_eq!(symbol_of_stream("ethusdt@ticker").as_deref(), Some("ETHUSDT"));
        assert_eq!(symbol_of_stream("@ticker"), None);
    }

    #[test]
    fn rest_paths_split_by_market() {
        assert_eq!(rest_path(Market::Spot, "klines"), "/api/v3/klines");
        assert_eq!(rest_path(Market::Futures, "klines"), "/fapi/v1/klines");
    }

    #[test]
    fn interval_minimums_match_sync_policy() {
        assert_eq!(interval_min_rows("1m"), 100);
        assert_eq!(interval_min_rows("1h"), interval_min_rows("4h"));
        assert_eq!(interval_min_rows("1d"), 5);
    }
}
