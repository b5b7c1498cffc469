use crate::domain::repositories::{ContractRepository, FundingRateRepository};
use crate::domain::types::{FundingRate, FuturesContract};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

pub struct SqliteContractRepository {
    pool: SqlitePool,
}

impl SqliteContractRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContractRepository for SqliteContractRepository {
    async fn upsert_batch(&self, contracts: &[FuturesContract]) -> Result<u64> {
        if contracts.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for contract in contracts {
            let result = sqlx::query(
                r#"
                INSERT INTO binance_futures_contract (
                    symbol, status, contract_type, base_asset, quote_asset,
                    order_types, time_in_force, filters, underlying_sub_type
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(symbol) DO UPDATE SET
                    status = excluded.status,
                    contract_type = excluded.contract_type,
                    base_asset = excluded.base_asset,
                    quote_asset = excluded.quote_asset,
                    order_types = excluded.order_types,
                    time_in_force = excluded.time_in_force,
                    filters = excluded.filters,
                    underlying_sub_type = excluded.underlying_sub_type
                "#,
            )
            .bind(&contract.symbol)
            .bind(&contract.status)
            .bind(&contract.contract_type)
            .bind(&contract.base_asset)
            .bind(&contract.quote_asset)
            .bind(&contract.order_types)
            .bind(&contract.time_in_force)
            .bind(&contract.filters)
            .bind(&contract.underlying_sub_type)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert futures contract")?;
            written += result.rows_affected();
        }

        tx.commit()
            .await
            .context("Failed to commit contract batch")?;
        Ok(written)
    }
}

pub struct SqliteFundingRateRepository {
    pool: SqlitePool,
}

impl SqliteFundingRateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FundingRateRepository for SqliteFundingRateRepository {
    async fn upsert(&self, rate: &FundingRate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO binance_funding_rate (symbol, funding_rate, funding_time, source)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(symbol, funding_time) DO UPDATE SET
                funding_rate = excluded.funding_rate,
                source = excluded.source
            "#,
        )
        .bind(&rate.symbol)
        .bind(&rate.funding_rate)
        .bind(rate.funding_time)
        .bind(rate.source.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to upsert funding rate")?;

        Ok(())
    }
}
