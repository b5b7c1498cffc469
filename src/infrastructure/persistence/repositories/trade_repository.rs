use crate::domain::repositories::TradeRepository;
use crate::domain::types::TradePrint;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

pub struct SqliteTradeRepository {
    pool: SqlitePool,
}

impl SqliteTradeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TradeRepository for SqliteTradeRepository {
    async fn insert_batch(&self, trades: &[TradePrint]) -> Result<u64> {
        if trades.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for trade in trades {
            let result = sqlx::query(
                r#"
                INSERT INTO binance_trades (
                    symbol, market_type, trade_id, price, quantity, trade_time, is_buyer_maker
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(symbol, market_type, trade_id) DO NOTHING
                "#,
            )
            .bind(&trade.symbol)
            .bind(trade.market.as_str())
            .bind(trade.trade_id)
            .bind(&trade.price)
            .bind(&trade.quantity)
            .bind(trade.trade_time)
            .bind(trade.is_buyer_maker)
            .execute(&mut *tx)
            .await
            .context("Failed to insert trade print")?;
            written += result.rows_affected();
        }

        tx.commit().await.context("Failed to commit trade batch")?;
        Ok(written)
    }
}
