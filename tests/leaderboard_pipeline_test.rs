//! End-to-end leaderboard recompute against an in-memory store, without any
//! live WebSocket.

use chrono::Utc;
use marketsync::application::leaderboard::price_cache::PriceUpdate;
use marketsync::application::leaderboard::{LeaderboardConfig, RealtimeLeaderboard};
use marketsync::domain::repositories::{
    CandleRepository, SnapshotRepository, StatsRepository,
};
use marketsync::domain::types::{Market, PriceSource};
use marketsync::infrastructure::persistence::database::Database;
use marketsync::infrastructure::persistence::repositories::{
    SqliteCandleRepository, SqliteSnapshotRepository, SqliteStatsRepository,
};
use rust_decimal::Decimal;
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn update(symbol: &str, price: &str, change: &str) -> PriceUpdate {
    PriceUpdate {
        symbol: symbol.to_string(),
        price: Decimal::from_str(price).unwrap(),
        price_raw: price.to_string(),
        volume_24h: Some(Decimal::from_str("1000").unwrap()),
        change_percent: Some(Decimal::from_str(change).unwrap()),
        source: PriceSource::Websocket,
        observed_at: Utc::now(),
    }
}

async fn build_board(
    db: &Database,
    top: usize,
) -> (
    Arc<RealtimeLeaderboard>,
    Arc<dyn SnapshotRepository>,
    watch::Sender<bool>,
) {
    let candles: Arc<dyn CandleRepository> = Arc::new(SqliteCandleRepository::new(db.pool.clone()));
    let stats: Arc<dyn StatsRepository> = Arc::new(SqliteStatsRepository::new(db.pool.clone()));
    let snapshots: Arc<dyn SnapshotRepository> =
        Arc::new(SqliteSnapshotRepository::new(db.pool.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let config = LeaderboardConfig {
        top_symbols_count: top,
        ..Default::default()
    };
    let board = RealtimeLeaderboard::new(
        Market::Spot,
        config,
        "wss://example.invalid".to_string(),
        candles,
        stats,
        snapshots.clone(),
        shutdown_rx,
    );
    (board, snapshots, shutdown_tx)
}

#[tokio::test]
async fn first_recompute_writes_a_ranked_snapshot() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let (board, snapshots, _shutdown) = build_board(&db, 2).await;

    board.price_cache().insert(update("BTCUSDT", "50000", "3.0"));
    board.price_cache().insert(update("ETHUSDT", "3000", "2.5"));
    board.price_cache().insert(update("BNBUSDT", "500", "1.0"));

    board.recompute().await.unwrap();

    // First run forces the write regardless of thresholds
    assert!(snapshots.has_any(Market::Spot).await.unwrap());
    assert_eq!(board.save_count(), 1);

    let current = board.current_board();
    assert_eq!(current.len(), 2);
    assert_eq!(current[0].rank, 1);
    assert_eq!(current[0].symbol, "BTCUSDT");
    assert_eq!(current[0].change_percent, Decimal::from_str("3.0").unwrap());
    assert_eq!(current[1].rank, 2);
    assert_eq!(current[1].symbol, "ETHUSDT");

    let items = sqlx::query("SELECT rank, symbol FROM realtime_gainers_items ORDER BY rank")
        .fetch_all(&db.pool)
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].get::<String, _>("symbol"), "BTCUSDT");
    assert_eq!(items[1].get::<String, _>("symbol"), "ETHUSDT");
}

#[tokio::test]
async fn recomputes_inside_min_interval_do_not_write_again() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let (board, _snapshots, _shutdown) = build_board(&db, 2).await;

    board.price_cache().insert(update("BTCUSDT", "50000", "3.0"));
    board.recompute().await.unwrap();
    assert_eq!(board.save_count(), 1);

    // A large move seconds later is still held by the 30s floor
    board.price_cache().insert(update("BTCUSDT", "55000", "9.0"));
    board.recompute().await.unwrap();
    board.recompute().await.unwrap();
    assert_eq!(board.save_count(), 1);

    let headers = sqlx::query("SELECT COUNT(*) AS count FROM realtime_gainers_snapshots")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(headers.get::<i64, _>("count"), 1);
}

#[tokio::test]
async fn empty_price_cache_clears_the_board_without_writing() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let (board, snapshots, _shutdown) = build_board(&db, 2).await;

    board.recompute().await.unwrap();

    assert!(board.current_board().is_empty());
    assert!(!snapshots.has_any(Market::Spot).await.unwrap());
    assert_eq!(board.save_count(), 0);
}

#[tokio::test]
async fn change_percent_falls_back_to_the_stats_table() {
    let db = Database::new("sqlite::memory:").await.unwrap();

    // Seed a stats row carrying the change percent
    let stats = SqliteStatsRepository::new(db.pool.clone());
    let ticker = marketsync::domain::types::Ticker24h {
        symbol: "SOLUSDT".to_string(),
        market: Market::Spot,
        price_change: "5".to_string(),
        price_change_percent: "4.2".to_string(),
        weighted_avg_price: "120".to_string(),
        last_price: "125".to_string(),
        open_price: "120".to_string(),
        high_price: "126".to_string(),
        low_price: "119".to_string(),
        volume: "9000".to_string(),
        quote_volume: "1080000".to_string(),
        open_time: 0,
        close_time: 0,
        trade_count: 10,
        bid_price: None,
        ask_price: None,
    };
    stats.upsert_current(&ticker, Utc::now()).await.unwrap();

    let (board, _snapshots, _shutdown) = build_board(&db, 5).await;

    // Tick without its own change percent
    let mut tick = update("SOLUSDT", "125", "0");
    tick.change_percent = None;
    tick.volume_24h = None;
    board.price_cache().insert(tick);

    board.recompute().await.unwrap();

    let current = board.current_board();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].change_percent, Decimal::from_str("4.2").unwrap());
    assert_eq!(current[0].data_source, PriceSource::Stats);
    assert_eq!(current[0].volume_24h, Decimal::from_str("9000").unwrap());

    // Board metadata sanity
    assert!(board.recompute_count() >= 1);
    assert!(board.last_recompute_duration() < Duration::from_secs(5));
}
