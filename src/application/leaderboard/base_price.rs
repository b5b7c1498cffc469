//! Base-price cache.
//!
//! Per symbol, the close of the most recent 1h candle whose open time is at
//! least 24 h old. Used to derive a 24h change percent when neither the WS
//! tick nor the stats table carries one. A background refresher overwrites
//! the whole cache hourly with one batched store query; entries expire at
//! twice the refresh interval so one failed refresh cannot pin stale data.

use crate::domain::repositories::{CandleRepository, StatsRepository};
use crate::domain::types::Market;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
struct BasePrice {
    price: Decimal,
    refreshed_at: Instant,
}

#[derive(Debug, Clone)]
pub struct BasePriceCacheConfig {
    pub refresh_interval: Duration,
    /// Candidate pool size from the stats table.
    pub top_symbols: i64,
    pub core_symbols: Vec<String>,
}

impl Default for BasePriceCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(3600),
            top_symbols: 100,
            core_symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "BNBUSDT".to_string(),
            ],
        }
    }
}

pub struct BasePriceCache {
    config: BasePriceCacheConfig,
    market: Market,
    candles: Arc<dyn CandleRepository>,
    stats: Arc<dyn StatsRepository>,
    entries: RwLock<HashMap<String, BasePrice>>,
}

impl BasePriceCache {
    pub fn new(
        config: BasePriceCacheConfig,
        market: Market,
        candles: Arc<dyn CandleRepository>,
        stats: Arc<dyn StatsRepository>,
    ) -> Self {
        Self {
            config,
            market,
            candles,
            stats,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Live base price for one symbol, if the cache holds a fresh one.
    pub fn get(&self, symbol: &str) -> Option<Decimal> {
        let expiry = self.config.refresh_interval * 2;
        let entries = self.entries.read().expect("base price cache poisoned");
        entries.get(symbol).and_then(|entry| {
            (entry.refreshed_at.elapsed() < expiry).then_some(entry.price)
        })
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("base price cache poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One refresh pass: candidates are the union of current keys, the
    /// top-100 active symbols from the last 24 h of stats, and the core list;
    /// one IN-query resolves them all.
    pub async fn refresh(&self) -> Result<usize> {
        let mut candidates: HashSet<String> = {
            let entries = self.entries.read().expect("base price cache poisoned");
            entries.keys().cloned().collect()
        };

        let since = Utc::now() - ChronoDuration::hours(24);
        match self
            .stats
            .top_by_volume(self.market, since, self.config.top_symbols)
            .await
        {
            Ok(symbols) => candidates.extend(symbols),
            Err(e) => warn!(
                "BasePriceCache[{}]: stats candidate query failed: {}",
                self.market, e
            ),
        }
        candidates.extend(self.config.core_symbols.iter().cloned());

        if candidates.is_empty() {
            return Ok(0);
        }

        let cutoff_ms = (Utc::now() - ChronoDuration::hours(24)).timestamp_millis();
        let symbols: Vec<String> = candidates.into_iter().collect();
        let prices = self
            .candles
            .base_prices(self.market, &symbols, cutoff_ms)
            .await?;

        let now = Instant::now();
        let mut refreshed = 0usize;
        {
            let mut entries = self.entries.write().expect("base price cache poisoned");
            for (symbol, price) in prices {
                // Zero closes are junk rows; keep whatever we had
                if price.is_zero() {
                    debug!(
                        "BasePriceCache[{}]: skipping zero base price for {}",
                        self.market, symbol
                    );
                    continue;
                }
                entries.insert(
                    symbol,
                    BasePrice {
                        price,
                        refreshed_at: now,
                    },
                );
                refreshed += 1;
            }
        }

        info!(
            "BasePriceCache[{}]: refreshed {} of {} candidates",
            self.market,
            refreshed,
            symbols.len()
        );
        Ok(refreshed)
    }

    /// Change percent against the cached base: `(last - base) / base * 100`.
    pub fn change_percent(&self, symbol: &str, last_price: Decimal) -> Option<Decimal> {
        let base = self.get(symbol)?;
        if base.is_zero() {
            return None;
        }
        Some((last_price - base) / base * Decimal::from(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn cache_with_entry(symbol: &str, price: &str, age: Duration) -> BasePriceCache {
        struct NoCandles;
        struct NoStats;

        #[async_trait::async_trait]
        impl CandleRepository for NoCandles {
            async fn upsert_batch(&self, _: &[crate::domain::types::Candle]) -> Result<u64> {
                Ok(0)
            }
            async fn count_recent(&self, _: &str, _: Market, _: &str, _: i64) -> Result<i64> {
                Ok(0)
            }
            async fn latest_open_time(&self, _: &str, _: Market, _: &str) -> Result<Option<i64>> {
                Ok(None)
            }
            async fn count_interval_since(&self, _: &str, _: i64) -> Result<i64> {
                Ok(0)
            }
            async fn newest_open_time(&self) -> Result<Option<i64>> {
                Ok(None)
            }
            async fn base_prices(
                &self,
                _: Market,
                _: &[String],
                _: i64,
            ) -> Result<HashMap<String, Decimal>> {
                Ok(HashMap::new())
            }
        }

        #[async_trait::async_trait]
        impl StatsRepository for NoStats {
            async fn upsert_current(
                &self,
                _: &crate::domain::types::Ticker24h,
                _: chrono::DateTime<Utc>,
            ) -> Result<()> {
                Ok(())
            }
            async fn insert_history(
                &self,
                _: &crate::domain::types::Ticker24h,
                _: &crate::domain::types::StatsWindow,
                _: chrono::DateTime<Utc>,
            ) -> Result<()> {
                Ok(())
            }
            async fn freshness(
                &self,
                _: &str,
                _: Market,
                _: chrono::DateTime<Utc>,
            ) -> Result<crate::domain::repositories::StatsFreshness> {
                Ok(Default::default())
            }
            async fn top_by_change(
                &self,
                _: Market,
                _: chrono::DateTime<Utc>,
                _: i64,
            ) -> Result<Vec<crate::domain::repositories::StatsRow>> {
                Ok(Vec::new())
            }
            async fn top_by_volume(
                &self,
                _: Market,
                _: chrono::DateTime<Utc>,
                _: i64,
            ) -> Result<Vec<String>> {
                Ok(Vec::new())
            }
            async fn activity_metrics(
                &self,
                _: Market,
            ) -> Result<HashMap<String, crate::domain::repositories::ActivityMetrics>> {
                Ok(HashMap::new())
            }
            async fn volume_24h(&self, _: &str, _: Market) -> Result<Option<Decimal>> {
                Ok(None)
            }
        }

        let cache = BasePriceCache::new(
            BasePriceCacheConfig {
                refresh_interval: Duration::from_secs(60),
                top_symbols: 100,
                core_symbols: Vec::new(),
            },
            Market::Spot,
            Arc::new(NoCandles),
            Arc::new(NoStats),
        );
        cache.entries.write().unwrap().insert(
            symbol.to_string(),
            BasePrice {
                price: Decimal::from_str(price).unwrap(),
                refreshed_at: Instant::now() - age,
            },
        );
        cache
    }

    #[test]
    fn change_percent_derives_from_base() {
        let cache = cache_with_entry("BTCUSDT", "50000", Duration::ZERO);
        let change = cache
            .change_percent("BTCUSDT", Decimal::from_str("51500").unwrap())
            .unwrap();
        assert_eq!(change, Decimal::from_str("3").unwrap());
    }

    #[test]
    fn entries_expire_at_twice_the_refresh_interval() {
        let fresh = cache_with_entry("BTCUSDT", "50000", Duration::from_secs(90));
        assert!(fresh.get("BTCUSDT").is_some());

        let stale = cache_with_entry("BTCUSDT", "50000", Duration::from_secs(121));
        assert!(stale.get("BTCUSDT").is_none());
    }
}
