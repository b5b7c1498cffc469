use crate::domain::repositories::SnapshotRepository;
use crate::domain::types::{Market, RankedSymbol};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqliteSnapshotRepository {
    pool: SqlitePool,
}

impl SqliteSnapshotRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    /// Header first, then items in rank order, one transaction: readers never
    /// see an item row without its header.
    async fn save(
        &self,
        market: Market,
        timestamp: DateTime<Utc>,
        items: &[RankedSymbol],
    ) -> Result<i64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to open snapshot transaction")?;

        let header = sqlx::query(
            r#"
            INSERT INTO realtime_gainers_snapshots (kind, timestamp, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(market.as_str())
        .bind(timestamp)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .context("Failed to insert snapshot header")?;

        let snapshot_id = header.last_insert_rowid();

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO realtime_gainers_items (
                    snapshot_id, rank, symbol, current_price, price_change_24h,
                    volume_24h, price_change_percent, data_source
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(snapshot_id)
            .bind(item.rank as i64)
            .bind(&item.symbol)
            .bind(item.current_price.to_string())
            .bind(item.change_percent.to_string())
            .bind(item.volume_24h.to_string())
            .bind(item.price_change_percent.map(|d| d.to_string()))
            .bind(item.data_source.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to insert snapshot item")?;
        }

        tx.commit()
            .await
            .context("Failed to commit snapshot transaction")?;

        Ok(snapshot_id)
    }

    async fn has_any(&self, market: Market) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM realtime_gainers_snapshots WHERE kind = ?",
        )
        .bind(market.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("count")? > 0)
    }

    async fn delete_older_than(&self, market: Market, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM realtime_gainers_snapshots WHERE kind = ? AND timestamp < ?",
        )
        .bind(market.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to apply time retention")?;
        Ok(result.rows_affected())
    }

    async fn retain_newest(&self, market: Market, keep: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM realtime_gainers_snapshots
            WHERE kind = ? AND id NOT IN (
                SELECT id FROM realtime_gainers_snapshots
                WHERE kind = ?
                ORDER BY timestamp DESC
                LIMIT ?
            )
            "#,
        )
        .bind(market.as_str())
        .bind(market.as_str())
        .bind(keep)
        .execute(&self.pool)
        .await
        .context("Failed to apply count retention")?;
        Ok(result.rows_affected())
    }
}
