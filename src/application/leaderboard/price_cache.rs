//! Realtime price cache for the leaderboard pipeline.
//!
//! Entries carry a dynamic expiry driven by access frequency: symbols read
//! often stay cached longer. Expiry is only ever extended. When the cache is
//! full a new write is dropped rather than evicting a live entry (soft
//! backpressure). Access statistics live under their own lock so bookkeeping
//! never contends with hot reads.

use crate::domain::types::PriceSource;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::warn;

/// One price observation flowing from a WS manager into the cache.
#[derive(Debug, Clone)]
pub struct PriceUpdate {
    pub symbol: String,
    pub price: Decimal,
    pub price_raw: String,
    pub volume_24h: Option<Decimal>,
    pub change_percent: Option<Decimal>,
    pub source: PriceSource,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CachedPrice {
    pub update: PriceUpdate,
    expires_at: Instant,
}

struct AccessStat {
    /// Moving average of seconds between reads, window 2.
    ema_interval_secs: f64,
    last_access: Instant,
}

#[derive(Debug, Clone)]
pub struct RealtimePriceCacheConfig {
    pub max_entries: usize,
    /// Baseline TTL applied on every write.
    pub standard_ttl: Duration,
}

impl Default for RealtimePriceCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            standard_ttl: Duration::from_secs(300),
        }
    }
}

/// Access-frequency bucket to TTL.
fn ttl_for_interval(ema_interval_secs: f64) -> Duration {
    if ema_interval_secs < 30.0 {
        Duration::from_secs(15 * 60)
    } else if ema_interval_secs < 120.0 {
        Duration::from_secs(10 * 60)
    } else if ema_interval_secs < 600.0 {
        Duration::from_secs(5 * 60)
    } else {
        Duration::from_secs(2 * 60)
    }
}

const ACCESS_STAT_IDLE_LIMIT: Duration = Duration::from_secs(24 * 3600);

pub struct RealtimePriceCache {
    config: RealtimePriceCacheConfig,
    entries: RwLock<HashMap<String, CachedPrice>>,
    access: Mutex<HashMap<String, AccessStat>>,
    dropped_writes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RealtimePriceCache {
    pub fn new(config: RealtimePriceCacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            access: Mutex::new(HashMap::new()),
            dropped_writes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, update: PriceUpdate) {
        self.insert_at(update, Instant::now())
    }

    fn insert_at(&self, update: PriceUpdate, now: Instant) {
        let mut entries = self.entries.write().expect("price cache poisoned");

        if entries.len() >= self.config.max_entries && !entries.contains_key(&update.symbol) {
            // Full cache drops the incoming write; live entries stay put
            let dropped = self.dropped_writes.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(
                    "RealtimePriceCache: full ({} entries), dropped {} writes so far",
                    entries.len(),
                    dropped
                );
            }
            return;
        }

        let standard_expiry = now + self.config.standard_ttl;
        let expires_at = entries
            .get(&update.symbol)
            .map(|existing| existing.expires_at.max(standard_expiry))
            .unwrap_or(standard_expiry);

        entries.insert(
            update.symbol.clone(),
            CachedPrice { update, expires_at },
        );
    }

    pub fn get(&self, symbol: &str) -> Option<PriceUpdate> {
        self.get_at(symbol, Instant::now())
    }

    fn get_at(&self, symbol: &str, now: Instant) -> Option<PriceUpdate> {
        let new_ttl = {
            let mut access = self.access.lock().expect("access stats poisoned");
            let stat = access.entry(symbol.to_string()).or_insert(AccessStat {
                ema_interval_secs: self.config.standard_ttl.as_secs_f64(),
                last_access: now,
            });
            let interval = now.duration_since(stat.last_access).as_secs_f64();
            if interval > 0.0 {
                stat.ema_interval_secs = (stat.ema_interval_secs + interval) / 2.0;
            }
            stat.last_access = now;
            ttl_for_interval(stat.ema_interval_secs)
        };

        let mut entries = self.entries.write().expect("price cache poisoned");
        let live = entries
            .get_mut(symbol)
            .filter(|entry| entry.expires_at > now);
        let Some(entry) = live else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        // Extend only; frequent access never shortens a live expiry
        entry.expires_at = entry.expires_at.max(now + new_ttl);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.update.clone())
    }

    /// Fraction of reads served from a live entry. 1.0 before any read.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            1.0
        } else {
            hits as f64 / (hits + misses) as f64
        }
    }

    /// All live entries, for a recompute pass.
    pub fn snapshot(&self) -> Vec<PriceUpdate> {
        let now = Instant::now();
        let entries = self.entries.read().expect("price cache poisoned");
        entries
            .values()
            .filter(|e| e.expires_at > now)
            .map(|e| e.update.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("price cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("price cache poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn dropped_writes(&self) -> u64 {
        self.dropped_writes.load(Ordering::Relaxed)
    }

    /// Evict expired entries and long-idle access stats. Runs every minute.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&self, now: Instant) {
        {
            let mut entries = self.entries.write().expect("price cache poisoned");
            entries.retain(|_, e| e.expires_at > now);
        }
        {
            let mut access = self.access.lock().expect("access stats poisoned");
            access.retain(|_, s| now.duration_since(s.last_access) < ACCESS_STAT_IDLE_LIMIT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(symbol: &str) -> PriceUpdate {
        PriceUpdate {
            symbol: symbol.to_string(),
            price: Decimal::from(100),
            price_raw: "100".to_string(),
            volume_24h: None,
            change_percent: None,
            source: PriceSource::Websocket,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn frequent_access_maps_to_longer_ttl() {
        assert_eq!(ttl_for_interval(5.0), Duration::from_secs(900));
        assert_eq!(ttl_for_interval(60.0), Duration::from_secs(600));
        assert_eq!(ttl_for_interval(300.0), Duration::from_secs(300));
        assert_eq!(ttl_for_interval(3600.0), Duration::from_secs(120));
    }

    #[test]
    fn full_cache_drops_new_writes_without_evicting() {
        let cache = RealtimePriceCache::new(RealtimePriceCacheConfig {
            max_entries: 2,
            standard_ttl: Duration::from_secs(300),
        });

        cache.insert(update("BTCUSDT"));
        cache.insert(update("ETHUSDT"));
        cache.insert(update("BNBUSDT"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.dropped_writes(), 1);
        assert!(cache.get("BTCUSDT").is_some());
        assert!(cache.get("BNBUSDT").is_none());

        // Overwriting an existing key is not a drop
        cache.insert(update("BTCUSDT"));
        assert_eq!(cache.dropped_writes(), 1);
    }

    #[test]
    fn expiry_is_extended_never_shortened() {
        let cache = RealtimePriceCache::new(RealtimePriceCacheConfig::default());
        let t0 = Instant::now();

        cache.insert_at(update("BTCUSDT"), t0);
        let initial_expiry = cache
            .entries
            .read()
            .unwrap()
            .get("BTCUSDT")
            .unwrap()
            .expires_at;

        // A fast second read drives the frequency EMA into the 15-minute bucket
        cache.get_at("BTCUSDT", t0 + Duration::from_secs(1));
        cache.get_at("BTCUSDT", t0 + Duration::from_secs(2));
        let after_reads = cache
            .entries
            .read()
            .unwrap()
            .get("BTCUSDT")
            .unwrap()
            .expires_at;
        assert!(after_reads >= initial_expiry);

        // Re-inserting keeps the extended expiry
        cache.insert_at(update("BTCUSDT"), t0 + Duration::from_secs(3));
        let after_write = cache
            .entries
            .read()
            .unwrap()
            .get("BTCUSDT")
            .unwrap()
            .expires_at;
        assert!(after_write >= after_reads);
    }

    #[test]
    fn cleanup_evicts_expired_entries() {
        let cache = RealtimePriceCache::new(RealtimePriceCacheConfig {
            max_entries: 10,
            standard_ttl: Duration::from_secs(1),
        });
        let t0 = Instant::now();
        cache.insert_at(update("BTCUSDT"), t0);

        cache.cleanup_at(t0 + Duration::from_secs(2));
        assert!(cache.is_empty());
    }
}
