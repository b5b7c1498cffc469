//! Depth snapshot and trade print persistence.

use chrono::Utc;
use marketsync::domain::repositories::{DepthRepository, TradeRepository};
use marketsync::domain::types::{DepthSnapshot, Market, TradePrint};
use marketsync::infrastructure::persistence::database::Database;
use marketsync::infrastructure::persistence::repositories::{
    SqliteDepthRepository, SqliteTradeRepository,
};
use sqlx::Row;

fn snapshot(symbol: &str, time_ms: i64) -> DepthSnapshot {
    DepthSnapshot {
        symbol: symbol.to_string(),
        market: Market::Spot,
        last_update_id: 987654,
        bids: vec![
            ["50000.10".to_string(), "1.5".to_string()],
            ["50000.00".to_string(), "2.0".to_string()],
        ],
        asks: vec![["50000.20".to_string(), "0.8".to_string()]],
        snapshot_time_ms: time_ms,
    }
}

#[tokio::test]
async fn depth_snapshots_append_and_preserve_level_order() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteDepthRepository::new(db.pool.clone());

    let now_ms = Utc::now().timestamp_millis();
    repo.insert(&snapshot("BTCUSDT", now_ms - 1000)).await.unwrap();
    repo.insert(&snapshot("BTCUSDT", now_ms)).await.unwrap();

    // Append-only: both rows survive
    assert_eq!(repo.count_since(now_ms - 5000).await.unwrap(), 2);

    let latest = repo
        .latest_snapshot_times(Market::Spot, &["BTCUSDT".to_string()])
        .await
        .unwrap();
    assert_eq!(latest["BTCUSDT"], now_ms);

    // Levels persist exactly as received, order intact
    let row = sqlx::query("SELECT bids FROM binance_order_book_depth ORDER BY id LIMIT 1")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    let bids: Vec<[String; 2]> = serde_json::from_str(&row.get::<String, _>("bids")).unwrap();
    assert_eq!(bids[0], ["50000.10".to_string(), "1.5".to_string()]);
    assert_eq!(bids[1], ["50000.00".to_string(), "2.0".to_string()]);
}

#[tokio::test]
async fn duplicate_trade_ids_are_ignored() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteTradeRepository::new(db.pool.clone());

    let print = TradePrint {
        symbol: "BTCUSDT".to_string(),
        market: Market::Spot,
        trade_id: 1,
        price: "50000.10".to_string(),
        quantity: "0.25".to_string(),
        trade_time: Utc::now().timestamp_millis(),
        is_buyer_maker: false,
    };

    let written = repo
        .insert_batch(&[print.clone(), print.clone()])
        .await
        .unwrap();
    assert_eq!(written, 1);

    // Replaying the same batch later writes nothing new
    let replay = repo.insert_batch(&[print]).await.unwrap();
    assert_eq!(replay, 0);
}
