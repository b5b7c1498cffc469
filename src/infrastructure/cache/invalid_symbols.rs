//! Cross-process invalid-symbol blocklist.
//!
//! Symbols proven non-tradable by an upstream `invalid symbol` error are
//! marked in an external KV with a 24 h TTL so sibling processes skip them
//! too. A local in-process set mirrors every mark this process makes and
//! serves hot-path reads without a KV round-trip.
//!
//! KV failures are fail-open: `is_invalid` answers `false` on a KV error so
//! symbols are retried and re-marked rather than silently dropped. The local
//! set still answers for marks made here, which keeps a KV outage from
//! re-issuing calls this process already knows are bad.

use crate::domain::repositories::InstrumentRepository;
use crate::domain::types::Market;
use crate::infrastructure::binance::rest::BinanceRestClient;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct InvalidSymbolCacheConfig {
    pub address: String,
    pub password: String,
    pub db: i64,
    pub key_prefix: String,
    pub enabled: bool,
}

impl Default for InvalidSymbolCacheConfig {
    fn default() -> Self {
        Self {
            address: "redis://127.0.0.1:6379".to_string(),
            password: String::new(),
            db: 0,
            key_prefix: "invalid_symbol:".to_string(),
            enabled: true,
        }
    }
}

pub struct InvalidSymbolCache {
    manager: Option<ConnectionManager>,
    prefix: String,
    ttl: Duration,
    local: RwLock<HashMap<String, Instant>>,
}

impl InvalidSymbolCache {
    /// Connect to the KV. Connection failure is not fatal: the cache degrades
    /// to the local set and logs once.
    pub async fn connect(config: InvalidSymbolCacheConfig) -> Self {
        let manager = if config.enabled {
            match Self::open_manager(&config).await {
                Ok(mgr) => {
                    info!("InvalidSymbolCache: connected to KV at {}", config.address);
                    Some(mgr)
                }
                Err(e) => {
                    warn!(
                        "InvalidSymbolCache: KV unavailable ({}), running with local set only",
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            manager,
            prefix: config.key_prefix,
            ttl: DEFAULT_TTL,
            local: RwLock::new(HashMap::new()),
        }
    }

    /// Local-only cache for tests and KV-disabled deployments.
    pub fn disabled() -> Self {
        Self {
            manager: None,
            prefix: "invalid_symbol:".to_string(),
            ttl: DEFAULT_TTL,
            local: RwLock::new(HashMap::new()),
        }
    }

    async fn open_manager(config: &InvalidSymbolCacheConfig) -> redis::RedisResult<ConnectionManager> {
        let url = if config.password.is_empty() {
            format!("{}/{}", config.address.trim_end_matches('/'), config.db)
        } else {
            // redis://:password@host:port/db
            let without_scheme = config.address.trim_start_matches("redis://");
            format!(
                "redis://:{}@{}/{}",
                config.password,
                without_scheme.trim_end_matches('/'),
                config.db
            )
        };
        let client = redis::Client::open(url)?;
        client.get_connection_manager().await
    }

    fn key(&self, symbol: &str, market: Market) -> String {
        format!("{}{}_{}", self.prefix, symbol, market)
    }

    /// Mark a symbol invalid in the KV (TTL 24 h) and in the local set.
    pub async fn mark_invalid(&self, symbol: &str, market: Market) {
        let key = self.key(symbol, market);

        {
            let mut local = self.local.write().expect("local set poisoned");
            local.insert(key.clone(), Instant::now() + self.ttl);
        }

        if let Some(manager) = &self.manager {
            let mut conn = manager.clone();
            let result = redis::cmd("SET")
                .arg(&key)
                .arg("")
                .arg("EX")
                .arg(self.ttl.as_secs())
                .query_async::<()>(&mut conn)
                .await;
            match result {
                Ok(()) => info!(
                    "InvalidSymbolCache: marked {} ({}) invalid for 24h",
                    symbol, market
                ),
                Err(e) => warn!(
                    "InvalidSymbolCache: failed to mark {} ({}) in KV: {}",
                    symbol, market, e
                ),
            }
        } else {
            info!(
                "InvalidSymbolCache: marked {} ({}) invalid locally",
                symbol, market
            );
        }
    }

    /// Whether the symbol is currently blocklisted. Fail-open on KV errors.
    pub async fn is_invalid(&self, symbol: &str, market: Market) -> bool {
        let key = self.key(symbol, market);

        {
            let local = self.local.read().expect("local set poisoned");
            if let Some(expiry) = local.get(&key)
                && *expiry > Instant::now()
            {
                return true;
            }
        }

        if let Some(manager) = &self.manager {
            let mut conn = manager.clone();
            match redis::cmd("EXISTS")
                .arg(&key)
                .query_async::<bool>(&mut conn)
                .await
            {
                Ok(exists) => return exists,
                Err(e) => {
                    debug!("InvalidSymbolCache: KV read failed ({}), assuming valid", e);
                    return false;
                }
            }
        }

        false
    }

    /// Startup revalidation pass over every KV entry.
    ///
    /// Entries for instruments the registry says are inactive are dropped
    /// silently; entries for active instruments get one lightweight candle
    /// probe and are dropped only when the probe succeeds.
    pub async fn cleanup(
        &self,
        instruments: &dyn InstrumentRepository,
        rest: &BinanceRestClient,
    ) {
        let Some(manager) = &self.manager else {
            debug!("InvalidSymbolCache: no KV connection, skipping cleanup");
            return;
        };

        let mut conn = manager.clone();
        let pattern = format!("{}*", self.prefix);
        let keys: Vec<String> = match redis::cmd("KEYS")
            .arg(&pattern)
            .query_async::<Vec<String>>(&mut conn)
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                warn!("InvalidSymbolCache: cleanup scan failed: {}", e);
                return;
            }
        };

        let mut dropped = 0usize;
        let mut retained = 0usize;

        for key in keys {
            let Some((symbol, market)) = self.parse_key(&key) else {
                continue;
            };

            let still_invalid = match instruments.activity(&symbol, market).await {
                Ok(Some(true)) => {
                    // Registry says tradable: confirm with one 1-minute candle
                    rest.klines(&symbol, market, "1m", 1).await.is_err()
                }
                // Inactive or unknown in the registry: the mark is moot
                Ok(Some(false)) | Ok(None) => false,
                Err(e) => {
                    warn!(
                        "InvalidSymbolCache: registry lookup failed for {} ({}): {}",
                        symbol, market, e
                    );
                    true
                }
            };

            if still_invalid {
                retained += 1;
            } else {
                let _ = redis::cmd("DEL")
                    .arg(&key)
                    .query_async::<i64>(&mut conn)
                    .await;
                self.local.write().expect("local set poisoned").remove(&key);
                dropped += 1;
            }
        }

        info!(
            "InvalidSymbolCache: cleanup complete, dropped {} entries, retained {}",
            dropped, retained
        );
    }

    fn parse_key(&self, key: &str) -> Option<(String, Market)> {
        let rest = key.strip_prefix(&self.prefix)?;
        let (symbol, market) = rest.rsplit_once('_')?;
        let market = Market::from_str(market).ok()?;
        Some((symbol.to_string(), market))
    }

    /// Drop expired local entries. Cheap; runs on a supervisor tick.
    pub fn evict_expired_local(&self) {
        let now = Instant::now();
        let mut local = self.local.write().expect("local set poisoned");
        local.retain(|_, expiry| *expiry > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_set_answers_without_kv() {
        let cache = InvalidSymbolCache::disabled();
        assert!(!cache.is_invalid("FAKEUSDT", Market::Spot).await);

        cache.mark_invalid("FAKEUSDT", Market::Spot).await;
        assert!(cache.is_invalid("FAKEUSDT", Market::Spot).await);
        // Market-qualified: the same symbol on the other market is unaffected
        assert!(!cache.is_invalid("FAKEUSDT", Market::Futures).await);
    }

    #[test]
    fn keys_parse_back_to_symbol_and_market() {
        let cache = InvalidSymbolCache::disabled();
        let key = cache.key("BTCUSDT", Market::Futures);
        assert_eq!(key, "invalid_symbol:BTCUSDT_futures");
        assert_eq!(
            cache.parse_key(&key),
            Some(("BTCUSDT".to_string(), Market::Futures))
        );
        assert_eq!(cache.parse_key("unrelated"), None);
    }

    #[tokio::test]
    async fn expired_local_entries_are_evicted() {
        let cache = InvalidSymbolCache::disabled();
        {
            let mut local = cache.local.write().unwrap();
            local.insert(
                cache.key("OLDUSDT", Market::Spot),
                Instant::now() - Duration::from_secs(1),
            );
        }
        assert!(!cache.is_invalid("OLDUSDT", Market::Spot).await);
        cache.evict_expired_local();
        assert!(cache.local.read().unwrap().is_empty());
    }
}
