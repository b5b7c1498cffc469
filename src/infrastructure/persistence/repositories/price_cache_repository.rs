use crate::domain::repositories::PriceCacheRepository;
use crate::domain::types::{Market, PriceCacheRow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

pub struct SqlitePriceCacheRepository {
    pool: SqlitePool,
}

impl SqlitePriceCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PriceCacheRepository for SqlitePriceCacheRepository {
    async fn upsert(&self, row: &PriceCacheRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_caches (symbol, kind, price, price_change_24h, last_updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(symbol, kind) DO UPDATE SET
                price = excluded.price,
                price_change_24h = excluded.price_change_24h,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&row.symbol)
        .bind(row.market.as_str())
        .bind(&row.price)
        .bind(row.price_change_24h.map(|d| d.to_string()))
        .bind(row.last_updated)
        .execute(&self.pool)
        .await
        .context("Failed to upsert price cache row")?;

        Ok(())
    }

    async fn last_updated(
        &self,
        market: Market,
        symbols: &[String],
    ) -> Result<HashMap<String, DateTime<Utc>>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let symbols_json = serde_json::to_string(symbols)?;
        let rows = sqlx::query(
            r#"
            SELECT symbol, last_updated FROM price_caches
            WHERE kind = ? AND symbol IN (SELECT value FROM json_each(?))
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
                row.try_get::<DateTime<Utc>, _>("last_updated")?,
            );
        }
        Ok(map)
    }

    async fn count_updated_since(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM price_caches WHERE last_updated >= ?")
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    async fn newest_update(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(last_updated) AS newest FROM price_caches")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<DateTime<Utc>>, _>("newest")?)
    }
}
