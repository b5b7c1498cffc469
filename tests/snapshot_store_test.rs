//! Leaderboard snapshot persistence: rank integrity, header/item coupling,
//! retention policies.

use chrono::{Duration as ChronoDuration, Utc};
use marketsync::domain::repositories::SnapshotRepository;
use marketsync::domain::types::{Market, PriceSource, RankedSymbol};
use marketsync::infrastructure::persistence::database::Database;
use marketsync::infrastructure::persistence::repositories::SqliteSnapshotRepository;
use rust_decimal::Decimal;
use sqlx::Row;
use std::str::FromStr;

fn ranked(rank: u32, symbol: &str, change: &str) -> RankedSymbol {
    RankedSymbol {
        rank,
        symbol: symbol.to_string(),
        current_price: Decimal::from_str("50000").unwrap(),
        change_percent: Decimal::from_str(change).unwrap(),
        volume_24h: Decimal::from_str("1000000").unwrap(),
        price_change_percent: Some(Decimal::from_str(change).unwrap()),
        data_source: PriceSource::Websocket,
    }
}

#[tokio::test]
async fn snapshot_items_keep_contiguous_ranks_under_their_header() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteSnapshotRepository::new(db.pool.clone());

    assert!(!repo.has_any(Market::Spot).await.unwrap());

    let items = vec![
        ranked(1, "BTCUSDT", "3.0"),
        ranked(2, "ETHUSDT", "2.5"),
    ];
    let id = repo.save(Market::Spot, Utc::now(), &items).await.unwrap();
    assert!(repo.has_any(Market::Spot).await.unwrap());
    assert!(!repo.has_any(Market::Futures).await.unwrap());

    let rows = sqlx::query(
        "SELECT rank, symbol, price_change_24h FROM realtime_gainers_items WHERE snapshot_id = ? ORDER BY rank",
    )
    .bind(id)
    .fetch_all(&db.pool)
    .await
    .unwrap();

    assert_eq!(rows.len(), 2);
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.get::<i64, _>("rank"), i as i64 + 1);
    }
    assert_eq!(rows[0].get::<String, _>("symbol"), "BTCUSDT");
    assert_eq!(rows[0].get::<String, _>("price_change_24h"), "3.0");
    assert_eq!(rows[1].get::<String, _>("symbol"), "ETHUSDT");

    // No orphan items: every item row joins to a header
    let orphans = sqlx::query(
        r#"
        SELECT COUNT(*) AS count FROM realtime_gainers_items i
        LEFT JOIN realtime_gainers_snapshots s ON s.id = i.snapshot_id
        WHERE s.id IS NULL
        "#,
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(orphans.get::<i64, _>("count"), 0);
}

#[tokio::test]
async fn count_retention_keeps_only_the_newest_snapshots() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteSnapshotRepository::new(db.pool.clone());

    let base = Utc::now();
    for i in 0..5 {
        let ts = base + ChronoDuration::seconds(i);
        repo.save(Market::Spot, ts, &[ranked(1, "BTCUSDT", "1.0")])
            .await
            .unwrap();
    }

    let removed = repo.retain_newest(Market::Spot, 2).await.unwrap();
    assert_eq!(removed, 3);

    let headers = sqlx::query("SELECT COUNT(*) AS count FROM realtime_gainers_snapshots")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(headers.get::<i64, _>("count"), 2);

    // Items cascade with their headers
    let items = sqlx::query("SELECT COUNT(*) AS count FROM realtime_gainers_items")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(items.get::<i64, _>("count"), 2);
}

#[tokio::test]
async fn time_retention_deletes_old_headers_only() {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let repo = SqliteSnapshotRepository::new(db.pool.clone());

    let old = Utc::now() - ChronoDuration::hours(3);
    let fresh = Utc::now();
    repo.save(Market::Spot, old, &[ranked(1, "BTCUSDT", "1.0")])
        .await
        .unwrap();
    repo.save(Market::Spot, fresh, &[ranked(1, "ETHUSDT", "2.0")])
        .await
        .unwrap();

    let cutoff = Utc::now() - ChronoDuration::hours(1);
    let removed = repo.delete_older_than(Market::Spot, cutoff).await.unwrap();
    assert_eq!(removed, 1);

    let remaining = sqlx::query("SELECT COUNT(*) AS count FROM realtime_gainers_snapshots")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(remaining.get::<i64, _>("count"), 1);
}
