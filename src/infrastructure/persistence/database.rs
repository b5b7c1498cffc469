use anyhow::{Context, Result};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs;
use tracing::info;

/// Singleton database wrapper
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self> {
        // Ensure the directory exists if it's a file path
        if let Some(path_part) = db_url.strip_prefix("sqlite://") {
            let path = Path::new(path_part);
            if let Some(parent) = path.parent()
                && !parent.exists()
            {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .create_if_missing(true)
            .foreign_keys(true) // Item rows cascade from snapshot header deletes
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal); // Better for concurrency

        // An in-memory database exists per connection; pin the pool to one
        let in_memory = db_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 20 })
            .min_connections(if in_memory { 1 } else { 10 })
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!("Connected to database: {}", db_url);

        let db = Self { pool };
        db.init().await?;

        Ok(db)
    }

    /// Probe used by the supervisor heartbeat.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database heartbeat probe failed")?;
        Ok(())
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;

        // 1. Instrument registry (soft-delete lifecycle)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS binance_exchange_info (
                symbol TEXT NOT NULL,
                market_type TEXT NOT NULL,
                status TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                quote_asset TEXT NOT NULL,
                base_precision INTEGER NOT NULL DEFAULT 8,
                quote_precision INTEGER NOT NULL DEFAULT 8,
                filters TEXT NOT NULL DEFAULT '[]',
                permissions TEXT NOT NULL DEFAULT '[]',
                is_active BOOLEAN NOT NULL DEFAULT 1,
                last_seen_active DATETIME NOT NULL,
                deactivated_at DATETIME,
                PRIMARY KEY (symbol, market_type)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create binance_exchange_info table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_exchange_info_active
            ON binance_exchange_info (market_type, is_active);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create exchange info index")?;

        // 2. Current price per (symbol, kind)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_caches (
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                price TEXT NOT NULL,
                price_change_24h TEXT,
                last_updated DATETIME NOT NULL,
                PRIMARY KEY (symbol, kind)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create price_caches table")?;

        // 3. Klines
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS market_klines (
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open_price TEXT NOT NULL,
                high_price TEXT NOT NULL,
                low_price TEXT NOT NULL,
                close_price TEXT NOT NULL,
                volume TEXT NOT NULL,
                quote_volume TEXT,
                trade_count INTEGER,
                PRIMARY KEY (symbol, kind, interval, open_time)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create market_klines table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_klines_interval_time
            ON market_klines (interval, open_time);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create kline index")?;

        // 4. 24h stats, current + hourly-window history
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS binance_24h_stats (
                symbol TEXT NOT NULL,
                market_type TEXT NOT NULL,
                price_change TEXT NOT NULL,
                price_change_percent TEXT NOT NULL,
                weighted_avg_price TEXT NOT NULL,
                last_price TEXT NOT NULL,
                open_price TEXT NOT NULL,
                high_price TEXT NOT NULL,
                low_price TEXT NOT NULL,
                volume TEXT NOT NULL,
                quote_volume TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER NOT NULL,
                trade_count INTEGER NOT NULL,
                bid_price TEXT,
                ask_price TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                PRIMARY KEY (symbol, market_type)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create binance_24h_stats table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS binance_24h_stats_history (
                symbol TEXT NOT NULL,
                market_type TEXT NOT NULL,
                window_start DATETIME NOT NULL,
                window_end DATETIME NOT NULL,
                window_duration INTEGER NOT NULL,
                price_change TEXT NOT NULL,
                price_change_percent TEXT NOT NULL,
                weighted_avg_price TEXT NOT NULL,
                last_price TEXT NOT NULL,
                open_price TEXT NOT NULL,
                high_price TEXT NOT NULL,
                low_price TEXT NOT NULL,
                volume TEXT NOT NULL,
                quote_volume TEXT NOT NULL,
                trade_count INTEGER NOT NULL,
                created_at DATETIME NOT NULL,
                PRIMARY KEY (symbol, market_type, window_start, window_end)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create binance_24h_stats_history table")?;

        // 5. Order-book depth snapshots (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS binance_order_book_depth (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                market_type TEXT NOT NULL,
                last_update_id INTEGER NOT NULL,
                bids TEXT NOT NULL,
                asks TEXT NOT NULL,
                snapshot_time INTEGER NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create binance_order_book_depth table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_depth_symbol_time
            ON binance_order_book_depth (symbol, market_type, snapshot_time);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create depth index")?;

        // 6. Trade prints (append-only)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS binance_trades (
                symbol TEXT NOT NULL,
                market_type TEXT NOT NULL,
                trade_id INTEGER NOT NULL,
                price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                trade_time INTEGER NOT NULL,
                is_buyer_maker BOOLEAN NOT NULL,
                PRIMARY KEY (symbol, market_type, trade_id)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create binance_trades table")?;

        // 7. Futures contracts + funding rates
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS binance_futures_contract (
                symbol TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                contract_type TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                quote_asset TEXT NOT NULL,
                order_types TEXT NOT NULL DEFAULT '[]',
                time_in_force TEXT NOT NULL DEFAULT '[]',
                filters TEXT NOT NULL DEFAULT '[]',
                underlying_sub_type TEXT NOT NULL DEFAULT '[]'
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create binance_futures_contract table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS binance_funding_rate (
                symbol TEXT NOT NULL,
                funding_rate TEXT NOT NULL,
                funding_time INTEGER NOT NULL,
                source TEXT NOT NULL,
                PRIMARY KEY (symbol, funding_time)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create binance_funding_rate table")?;

        // 8. Leaderboard snapshots: header + items, items cascade on delete
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS realtime_gainers_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                timestamp DATETIME NOT NULL,
                created_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create realtime_gainers_snapshots table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_gainers_kind_time
            ON realtime_gainers_snapshots (kind, timestamp);
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create gainers index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS realtime_gainers_items (
                snapshot_id INTEGER NOT NULL
                    REFERENCES realtime_gainers_snapshots(id) ON DELETE CASCADE,
                rank INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                current_price TEXT NOT NULL,
                price_change_24h TEXT NOT NULL,
                volume_24h TEXT NOT NULL,
                price_change_percent TEXT,
                data_source TEXT NOT NULL,
                PRIMARY KEY (snapshot_id, rank)
            );
            "#,
        )
        .execute(&mut *conn)
        .await
        .context("Failed to create realtime_gainers_items table")?;

        info!("Database schema initialized.");
        Ok(())
    }
}
