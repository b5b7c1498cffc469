//! Snapshot manager: transactional saves plus retention.
//!
//! Retention runs two concurrent policies on one tick: headers older than the
//! retention period are deleted, and only the newest `max_snapshots` headers
//! survive. Item rows cascade from header deletion.

use crate::domain::repositories::SnapshotRepository;
use crate::domain::types::{Market, RankedSymbol};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const RETENTION_TICK: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
pub struct SnapshotRetentionConfig {
    pub retention_period: Duration,
    pub max_snapshots: i64,
}

impl Default for SnapshotRetentionConfig {
    fn default() -> Self {
        Self {
            retention_period: Duration::from_secs(3600),
            max_snapshots: 10,
        }
    }
}

pub struct SnapshotManager {
    market: Market,
    repo: Arc<dyn SnapshotRepository>,
    config: RwLock<SnapshotRetentionConfig>,
}

impl SnapshotManager {
    pub fn new(
        market: Market,
        repo: Arc<dyn SnapshotRepository>,
        config: SnapshotRetentionConfig,
    ) -> Self {
        Self {
            market,
            repo,
            config: RwLock::new(config),
        }
    }

    /// Persist one snapshot (header + items, single transaction).
    pub async fn save(
        &self,
        timestamp: DateTime<Utc>,
        items: &[RankedSymbol],
    ) -> Result<i64> {
        let id = self.repo.save(self.market, timestamp, items).await?;
        debug!(
            "SnapshotManager[{}]: saved snapshot {} with {} items",
            self.market,
            id,
            items.len()
        );
        Ok(id)
    }

    pub fn set_retention_period(&self, period: Duration) {
        self.config
            .write()
            .expect("retention config poisoned")
            .retention_period = period;
    }

    pub fn set_max_snapshots(&self, max: i64) {
        self.config
            .write()
            .expect("retention config poisoned")
            .max_snapshots = max;
    }

    /// One retention pass: time policy, then count policy.
    pub async fn enforce_retention(&self) -> Result<(u64, u64)> {
        let config = *self.config.read().expect("retention config poisoned");

        let cutoff = Utc::now()
            - ChronoDuration::from_std(config.retention_period).unwrap_or_default();
        let by_time = self.repo.delete_older_than(self.market, cutoff).await?;
        let by_count = self
            .repo
            .retain_newest(self.market, config.max_snapshots)
            .await?;

        if by_time > 0 || by_count > 0 {
            info!(
                "SnapshotManager[{}]: retention removed {} by age, {} by count",
                self.market, by_time, by_count
            );
        }
        Ok((by_time, by_count))
    }

    /// Background retention loop on a 10-minute tick.
    pub async fn retention_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(RETENTION_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if let Err(e) = self.enforce_retention().await {
                warn!(
                    "SnapshotManager[{}]: retention pass failed: {}",
                    self.market, e
                );
            }
        }
    }
}
