use crate::domain::repositories::CandleRepository;
use crate::domain::types::{Candle, Market};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

pub struct SqliteCandleRepository {
    pool: SqlitePool,
}

impl SqliteCandleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandleRepository for SqliteCandleRepository {
    async fn upsert_batch(&self, candles: &[Candle]) -> Result<u64> {
        if candles.is_empty() {
            return Ok(0);
        }

        // Short transaction per batch keeps writer lock hold times low
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for candle in candles {
            let result = sqlx::query(
                r#"
                INSERT INTO market_klines (
                    symbol, kind, interval, open_time,
                    open_price, high_price, low_price, close_price,
                    volume, quote_volume, trade_count
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(symbol, kind, interval, open_time) DO UPDATE SET
                    open_price = excluded.open_price,
                    high_price = excluded.high_price,
                    low_price = excluded.low_price,
                    close_price = excluded.close_price,
                    volume = excluded.volume,
                    quote_volume = excluded.quote_volume,
                    trade_count = excluded.trade_count
                "#,
            )
            .bind(&candle.symbol)
            .bind(candle.market.as_str())
            .bind(&candle.interval)
            .bind(candle.open_time)
            .bind(candle.open.to_string())
            .bind(candle.high.to_string())
            .bind(candle.low.to_string())
            .bind(candle.close.to_string())
            .bind(candle.volume.to_string())
            .bind(candle.quote_volume.map(|d| d.to_string()))
            .bind(candle.trade_count)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert candle")?;
            written += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit candle batch")?;
        Ok(written)
    }

    async fn count_recent(
        &self,
        symbol: &str,
        market: Market,
        interval: &str,
        cutoff_ms: i64,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM market_klines
            WHERE symbol = ? AND kind = ? AND interval = ? AND open_time >= ?
            "#,
        )
        .bind(symbol)
        .bind(market.as_str())
        .bind(interval)
        .bind(cutoff_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }

    async fn latest_open_time(
        &self,
        symbol: &str,
        market: Market,
        interval: &str,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(open_time) AS latest FROM market_klines
            WHERE symbol = ? AND kind = ? AND interval = ?
            "#,
        )
        .bind(symbol)
        .bind(market.as_str())
        .bind(interval)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Option<i64>, _>("latest")?)
    }

    async fn count_interval_since(&self, interval: &str, cutoff_ms: i64) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM market_klines WHERE interval = ? AND open_time >= ?",
        )
        .bind(interval)
        .bind(cutoff_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }

    async fn newest_open_time(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(open_time) AS newest FROM market_klines")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("newest")?)
    }

    async fn base_prices(
        &self,
        market: Market,
        symbols: &[String],
        cutoff_ms: i64,
    ) -> Result<HashMap<String, Decimal>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        // One IN-query; per symbol, the newest 1h bar at or before the cutoff
        let symbols_json = serde_json::to_string(symbols)?;
        let rows = sqlx::query(
            r#"
            SELECT k.symbol, k.close_price
            FROM market_klines k
            JOIN (
                SELECT symbol, MAX(open_time) AS open_time
                FROM market_klines
                WHERE kind = ? AND interval = '1h' AND open_time <= ?
                  AND symbol IN (SELECT value FROM json_each(?))
                GROUP BY symbol
            ) latest ON latest.symbol = k.symbol AND latest.open_time = k.open_time
            WHERE k.kind = ? AND k.interval = '1h'
            "#,
        )
        .bind(market.as_str())
        .bind(cutoff_ms)
        .bind(&symbols_json)
        .bind(market.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let symbol: String = row.try_get("symbol")?;
            let close: String = row.try_get("close_price")?;
            if let Ok(price) = Decimal::from_str(&close) {
                map.insert(symbol, price);
            }
        }
        Ok(map)
    }
}
