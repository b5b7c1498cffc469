use crate::domain::repositories::{InstrumentRepository, RegistrySyncOutcome};
use crate::domain::types::{Instrument, Market};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

pub struct SqliteInstrumentRepository {
    pool: SqlitePool,
}

impl SqliteInstrumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstrumentRepository for SqliteInstrumentRepository {
    /// Reconcile one market's universe in a single transaction so readers
    /// never observe a half-applied listing.
    async fn sync_universe(
        &self,
        market: Market,
        fetched: &[Instrument],
        now: DateTime<Utc>,
    ) -> Result<RegistrySyncOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to open registry sync transaction")?;

        for inst in fetched {
            sqlx::query(
                r#"
                INSERT INTO binance_exchange_info (
                    symbol, market_type, status, base_asset, quote_asset,
                    base_precision, quote_precision, filters, permissions,
                    is_active, last_seen_active, deactivated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, NULL)
                ON CONFLICT(symbol, market_type) DO UPDATE SET
                    status = excluded.status,
                    base_asset = excluded.base_asset,
                    quote_asset = excluded.quote_asset,
                    base_precision = excluded.base_precision,
                    quote_precision = excluded.quote_precision,
                    filters = excluded.filters,
                    permissions = excluded.permissions,
                    is_active = 1,
                    last_seen_active = excluded.last_seen_active,
                    deactivated_at = NULL
                "#,
            )
            .bind(&inst.symbol)
            .bind(market.as_str())
            .bind(&inst.status)
            .bind(&inst.base_asset)
            .bind(&inst.quote_asset)
            .bind(inst.base_precision)
            .bind(inst.quote_precision)
            .bind(&inst.filters)
            .bind(&inst.permissions)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert instrument")?;
        }

        // Soft delete: anything active that the upstream listing no longer
        // contains flips inactive with a deactivation timestamp.
        let symbols_json = serde_json::to_string(
            &fetched.iter().map(|i| i.symbol.as_str()).collect::<Vec<_>>(),
        )?;
        let deactivated = sqlx::query(
            r#"
            UPDATE binance_exchange_info
            SET is_active = 0, deactivated_at = ?
            WHERE market_type = ?
              AND is_active = 1
              AND symbol NOT IN (SELECT value FROM json_each(?))
            "#,
        )
        .bind(now)
        .bind(market.as_str())
        .bind(&symbols_json)
        .execute(&mut *tx)
        .await
        .context("Failed to deactivate delisted instruments")?;

        tx.commit()
            .await
            .context("Failed to commit registry sync transaction")?;

        Ok(RegistrySyncOutcome {
            upserted: fetched.len(),
            deactivated: deactivated.rows_affected() as usize,
        })
    }

    async fn active_symbols(&self, market: Market) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT symbol FROM binance_exchange_info WHERE market_type = ? AND is_active = 1 ORDER BY symbol",
        )
        .bind(market.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("symbol").map_err(Into::into))
            .collect()
    }

    async fn activity(&self, symbol: &str, market: Market) -> Result<Option<bool>> {
        let row = sqlx::query(
            "SELECT is_active FROM binance_exchange_info WHERE symbol = ? AND market_type = ?",
        )
        .bind(symbol)
        .bind(market.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<bool, _>("is_active")?)),
            None => Ok(None),
        }
    }
}
