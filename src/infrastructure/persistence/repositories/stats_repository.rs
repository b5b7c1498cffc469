use crate::domain::repositories::{ActivityMetrics, StatsFreshness, StatsRepository, StatsRow};
use crate::domain::types::{Market, StatsWindow, Ticker24h};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

pub struct SqliteStatsRepository {
    pool: SqlitePool,
}

impl SqliteStatsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatsRepository for SqliteStatsRepository {
    async fn upsert_current(&self, ticker: &Ticker24h, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO binance_24h_stats (
                symbol, market_type, price_change, price_change_percent,
                weighted_avg_price, last_price, open_price, high_price, low_price,
                volume, quote_volume, open_time, close_time, trade_count,
                bid_price, ask_price, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(symbol, market_type) DO UPDATE SET
                price_change = excluded.price_change,
                price_change_percent = excluded.price_change_percent,
                weighted_avg_price = excluded.weighted_avg_price,
                last_price = excluded.last_price,
                open_price = excluded.open_price,
                high_price = excluded.high_price,
                low_price = excluded.low_price,
                volume = excluded.volume,
                quote_volume = excluded.quote_volume,
                open_time = excluded.open_time,
                close_time = excluded.close_time,
                trade_count = excluded.trade_count,
                bid_price = excluded.bid_price,
                ask_price = excluded.ask_price,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&ticker.symbol)
        .bind(ticker.market.as_str())
        .bind(&ticker.price_change)
        .bind(&ticker.price_change_percent)
        .bind(&ticker.weighted_avg_price)
        .bind(&ticker.last_price)
        .bind(&ticker.open_price)
        .bind(&ticker.high_price)
        .bind(&ticker.low_price)
        .bind(&ticker.volume)
        .bind(&ticker.quote_volume)
        .bind(ticker.open_time)
        .bind(ticker.close_time)
        .bind(ticker.trade_count)
        .bind(&ticker.bid_price)
        .bind(&ticker.ask_price)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to upsert current 24h stats")?;

        Ok(())
    }

    async fn insert_history(
        &self,
        ticker: &Ticker24h,
        window: &StatsWindow,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO binance_24h_stats_history (
                symbol, market_type, window_start, window_end, window_duration,
                price_change, price_change_percent, weighted_avg_price, last_price,
                open_price, high_price, low_price, volume, quote_volume,
                trade_count, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(symbol, market_type, window_start, window_end) DO NOTHING
            "#,
        )
        .bind(&ticker.symbol)
        .bind(ticker.market.as_str())
        .bind(window.start)
        .bind(window.end)
        .bind(window.duration_secs)
        .bind(&ticker.price_change)
        .bind(&ticker.price_change_percent)
        .bind(&ticker.weighted_avg_price)
        .bind(&ticker.last_price)
        .bind(&ticker.open_price)
        .bind(&ticker.high_price)
        .bind(&ticker.low_price)
        .bind(&ticker.volume)
        .bind(&ticker.quote_volume)
        .bind(ticker.trade_count)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert 24h stats history")?;

        Ok(())
    }

    async fn freshness(
        &self,
        symbol: &str,
        market: Market,
        since: DateTime<Utc>,
    ) -> Result<StatsFreshness> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN CAST(volume AS REAL) > 0 AND CAST(last_price AS REAL) > 0
                    THEN 1 ELSE 0 END) AS good,
                MAX(created_at) AS latest
            FROM binance_24h_stats_history
            WHERE symbol = ? AND market_type = ? AND created_at >= ?
            "#,
        )
        .bind(symbol)
        .bind(market.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let good: Option<i64> = row.try_get("good")?;
        let latest: Option<DateTime<Utc>> = row.try_get("latest")?;

        Ok(StatsFreshness {
            recent_rows: total,
            quality_ratio: if total > 0 {
                good.unwrap_or(0) as f64 / total as f64
            } else {
                0.0
            },
            latest_update: latest,
        })
    }

    async fn top_by_change(
        &self,
        market: Market,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<StatsRow>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, last_price, price_change_percent, volume, quote_volume
            FROM binance_24h_stats
            WHERE market_type = ? AND updated_at >= ?
              AND CAST(volume AS REAL) > 0 AND CAST(last_price AS REAL) > 0
            ORDER BY CAST(price_change_percent AS REAL) DESC
            LIMIT ?
            "#,
        )
        .bind(market.as_str())
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StatsRow {
                symbol: row.try_get("symbol")?,
                last_price: parse_decimal(row.try_get("last_price")?),
                price_change_percent: parse_decimal(row.try_get("price_change_percent")?),
                volume: parse_decimal(row.try_get("volume")?),
                quote_volume: parse_decimal(row.try_get("quote_volume")?),
            });
        }
        Ok(out)
    }

    async fn top_by_volume(
        &self,
        market: Market,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol FROM binance_24h_stats
            WHERE market_type = ? AND updated_at >= ?
            ORDER BY CAST(quote_volume AS REAL) DESC
            LIMIT ?
            "#,
        )
        .bind(market.as_str())
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("symbol").map_err(Into::into))
            .collect()
    }

    async fn activity_metrics(&self, market: Market) -> Result<HashMap<String, ActivityMetrics>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol,
                   CAST(volume AS REAL) AS volume,
                   CAST(quote_volume AS REAL) AS quote_volume,
                   ABS(CAST(price_change_percent AS REAL)) AS change_abs
            FROM binance_24h_stats
            WHERE market_type = ?
            "#,
        )
        .bind(market.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(
                row.try_get::<String, _>("symbol")?,
                ActivityMetrics {
                    volume: row.try_get("volume")?,
                    quote_volume: row.try_get("quote_volume")?,
                    change_percent_abs: row.try_get("change_abs")?,
                },
            );
        }
        Ok(map)
    }

    async fn volume_24h(&self, symbol: &str, market: Market) -> Result<Option<Decimal>> {
        let row = sqlx::query(
            "SELECT volume FROM binance_24h_stats WHERE symbol = ? AND market_type = ?",
        )
        .bind(symbol)
        .bind(market.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| parse_decimal(r.try_get("volume").unwrap_or_default())))
    }
}

fn parse_decimal(raw: String) -> Decimal {
    Decimal::from_str(&raw).unwrap_or_default()
}
