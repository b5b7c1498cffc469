//! Upsert semantics across the price cache, kline and stats tables.

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use marketsync::domain::repositories::{
    CandleRepository, PriceCacheRepository, StatsRepository,
};
use marketsync::domain::types::{Candle, Market, PriceCacheRow, StatsWindow, Ticker24h};
use marketsync::infrastructure::persistence::database::Database;
use marketsync::infrastructure::persistence::repositories::{
    SqliteCandleRepository, SqlitePriceCacheRepository, SqliteStatsRepository,
};
use rust_decimal::Decimal;
use sqlx::Row;
use std::str::FromStr;

fn candle(symbol: &str, open_time: i64, close: &str) -> Candle {
    Candle {
        symbol: symbol.to_string(),
        market: Market::Spot,
        interval: "1h".to_string(),
        open_time,
        open: Decimal::from_str("100").unwrap(),
        high: Decimal::from_str("110").unwrap(),
        low: Decimal::from_str("95").unwrap(),
        close: Decimal::from_str(close).unwrap(),
        volume: Decimal::from_str("12.5").unwrap(),
        quote_volume: None,
        trade_count: Some(42),
    }
}

fn ticker(symbol: &str, last_price: &str) -> Ticker24h {
    Ticker24h {
        symbol: symbol.to_string(),
        market: Market::Spot,
        price_change: "10".to_string(),
        price_change_percent: "2.5".to_string(),
        weighted_avg_price: "105".to_string(),
        last_price: last_price.to_string(),
        open_price: "100".to_string(),
        high_price: "110".to_string(),
        low_price: "95".to_string(),
        volume: "5000".to_string(),
        quote_volume: "525000".to_string(),
        open_time: 0,
        close_time: 0,
        trade_count: 1234,
        bid_price: None,
        ask_price: None,
    }
}

#[tokio::test]
async fn price_upsert_keeps_one_row_with_the_latest_value() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqlitePriceCacheRepository::new(db.pool.clone());

    let mut row = PriceCacheRow {
        symbol: "BTCUSDT".to_string(),
        market: Market::Spot,
        price: "50000.10".to_string(),
        price_change_24h: None,
        last_updated: Utc::now() - ChronoDuration::minutes(10),
    };
    repo.upsert(&row).await.unwrap();

    row.price = "50100.20".to_string();
    row.last_updated = Utc::now();
    repo.upsert(&row).await.unwrap();

    let stored = sqlx::query("SELECT price, COUNT(*) OVER () AS total FROM price_caches")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(stored.get::<String, _>("price"), "50100.20");
    assert_eq!(stored.get::<i64, _>("total"), 1);

    // The incremental filter sees the fresh timestamp
    let updated = repo
        .last_updated(Market::Spot, &["BTCUSDT".to_string()])
        .await
        .unwrap();
    let age = Utc::now() - updated["BTCUSDT"];
    assert!(age < ChronoDuration::minutes(1));
}

#[tokio::test]
async fn candle_upsert_is_idempotent_with_second_value_winning() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteCandleRepository::new(db.pool.clone());

    let open_time = Utc::now().timestamp_millis();
    repo.upsert_batch(&[candle("BTCUSDT", open_time, "105")])
        .await
        .unwrap();
    repo.upsert_batch(&[candle("BTCUSDT", open_time, "106")])
        .await
        .unwrap();

    assert_eq!(
        repo.count_recent(
            "BTCUSDT",
            Market::Spot,
            "1h",
            open_time - 1000,
        )
        .await
        .unwrap(),
        1
    );

    let stored = sqlx::query("SELECT close_price FROM market_klines")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(stored.get::<String, _>("close_price"), "106");
    assert_eq!(
        repo.latest_open_time("BTCUSDT", Market::Spot, "1h")
            .await
            .unwrap(),
        Some(open_time)
    );
}

#[tokio::test]
async fn base_prices_pick_the_newest_hour_bar_at_or_before_the_cutoff() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteCandleRepository::new(db.pool.clone());

    let now = Utc::now();
    let h25 = (now - ChronoDuration::hours(25)).timestamp_millis();
    let h26 = (now - ChronoDuration::hours(26)).timestamp_millis();
    let h1 = (now - ChronoDuration::hours(1)).timestamp_millis();

    repo.upsert_batch(&[
        candle("BTCUSDT", h26, "48000"),
        candle("BTCUSDT", h25, "49000"),
        // Too recent for a 24h base
        candle("BTCUSDT", h1, "51000"),
        candle("ETHUSDT", h25, "3000"),
    ])
    .await
    .unwrap();

    let cutoff = (now - ChronoDuration::hours(24)).timestamp_millis();
    let bases = repo
        .base_prices(
            Market::Spot,
            &["BTCUSDT".to_string(), "ETHUSDT".to_string(), "XRPUSDT".to_string()],
            cutoff,
        )
        .await
        .unwrap();

    assert_eq!(bases["BTCUSDT"], Decimal::from_str("49000").unwrap());
    assert_eq!(bases["ETHUSDT"], Decimal::from_str("3000").unwrap());
    assert!(!bases.contains_key("XRPUSDT"));
}

#[tokio::test]
async fn stats_history_window_conflicts_are_ignored() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteStatsRepository::new(db.pool.clone());

    let now = Utc::now().with_nanosecond(0).unwrap();
    let window = StatsWindow::hourly(now);

    repo.insert_history(&ticker("BTCUSDT", "50000"), &window, now)
        .await
        .unwrap();
    // Second write into the same hour window is a no-op
    repo.insert_history(&ticker("BTCUSDT", "50500"), &window, now)
        .await
        .unwrap();

    let stored = sqlx::query(
        "SELECT last_price, COUNT(*) OVER () AS total FROM binance_24h_stats_history",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(stored.get::<String, _>("last_price"), "50000");
    assert_eq!(stored.get::<i64, _>("total"), 1);
}

#[tokio::test]
async fn stats_freshness_reports_count_quality_and_latest() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteStatsRepository::new(db.pool.clone());

    let now = Utc::now();
    for i in 0..3 {
        let window_time = now - ChronoDuration::hours(i);
        let window = StatsWindow::hourly(window_time);
        let mut t = ticker("BTCUSDT", "50000");
        if i == 2 {
            // One junk row with zero volume
            t.volume = "0".to_string();
        }
        repo.insert_history(&t, &window, window_time).await.unwrap();
    }

    let freshness = repo
        .freshness("BTCUSDT", Market::Spot, now - ChronoDuration::hours(24))
        .await
        .unwrap();
    assert_eq!(freshness.recent_rows, 3);
    assert!((freshness.quality_ratio - 2.0 / 3.0).abs() < 1e-9);
    assert!(freshness.latest_update.is_some());
}

#[tokio::test]
async fn current_stats_upsert_updates_in_place() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteStatsRepository::new(db.pool.clone());

    let now = Utc::now();
    repo.upsert_current(&ticker("BTCUSDT", "50000"), now)
        .await
        .unwrap();
    let mut merged = ticker("BTCUSDT", "50100");
    merged.bid_price = Some("50099".to_string());
    merged.ask_price = Some("50101".to_string());
    repo.upsert_current(&merged, now).await.unwrap();

    let stored = sqlx::query(
        "SELECT last_price, bid_price, COUNT(*) OVER () AS total FROM binance_24h_stats",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(stored.get::<i64, _>("total"), 1);
    assert_eq!(stored.get::<String, _>("last_price"), "50100");
    assert_eq!(stored.get::<Option<String>, _>("bid_price").as_deref(), Some("50099"));
}
