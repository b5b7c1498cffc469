use crate::domain::repositories::DepthRepository;
use crate::domain::types::{DepthSnapshot, Market};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

pub struct SqliteDepthRepository {
    pool: SqlitePool,
}

impl SqliteDepthRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DepthRepository for SqliteDepthRepository {
    async fn insert(&self, snapshot: &DepthSnapshot) -> Result<()> {
        // Levels are persisted exactly as received, as JSON text
        sqlx::query(
            r#"
            INSERT INTO binance_order_book_depth (
                symbol, market_type, last_update_id, bids, asks, snapshot_time
            )
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.symbol)
        .bind(snapshot.market.as_str())
        .bind(snapshot.last_update_id)
        .bind(serde_json::to_string(&snapshot.bids)?)
        .bind(serde_json::to_string(&snapshot.asks)?)
        .bind(snapshot.snapshot_time_ms)
        .execute(&self.pool)
        .await
        .context("Failed to insert depth snapshot")?;

        Ok(())
    }

    async fn latest_snapshot_times(
        &self,
        market: Market,
        symbols: &[String],
    ) -> Result<HashMap<String, i64>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let symbols_json = serde_json::to_string(symbols)?;
        let rows = sqlx::query(
            r#"
            SELECT symbol, MAX(snapshot_time) AS latest
            FROM binance_order_book_depth
            WHERE market_type = ? AND symbol IN (SELECT value FROM json_each(?))
            GROUP BY symbol
            "#,
        )
        .bind(market.as_str())
        .bind(&symbols_json)
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(
                row.try_get::<String, _>("symbol")?,
                row.try_get::<i64, _>("latest")?,
            );
        }
        Ok(map)
    }

    async fn count_since(&self, cutoff_ms: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM binance_order_book_depth WHERE snapshot_time >= ?",
        )
        .bind(cutoff_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }
}
