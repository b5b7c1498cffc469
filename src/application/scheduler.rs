//! Smart scheduler: arbitrates WS-healthy vs REST-fallback duty cycles.
//!
//! The contract is deliberately small: a shared `ws_healthy` boolean plus a
//! monotonic counter of transitions. REST-capable syncers poll the flag; when
//! the fleet is healthy they may stretch their periods or skip cycles, and
//! they revert to full REST behavior the moment it degrades.

use crate::infrastructure::binance::fleet::WsFleet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Total fleet reconnects above which WS is considered degraded.
    pub reconnect_threshold: u64,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconnect_threshold: 10,
            poll_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Default)]
pub struct SmartScheduler {
    ws_healthy: AtomicBool,
    transitions: AtomicU64,
    skipped_cycles: AtomicU64,
}

impl SmartScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record one observation of fleet health.
    pub fn observe(&self, healthy: bool) {
        let previous = self.ws_healthy.swap(healthy, Ordering::AcqRel);
        if previous != healthy {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            info!(
                "SmartScheduler: WS health transition -> {}",
                if healthy { "healthy" } else { "unhealthy" }
            );
        }
    }

    pub fn ws_healthy(&self) -> bool {
        self.ws_healthy.load(Ordering::Acquire)
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Duty-cycle decision for a WS-backed REST syncer: with a healthy fleet,
    /// every other tick is skipped. `tick` is the caller's running counter.
    pub fn should_skip_cycle(&self, tick: u64) -> bool {
        let skip = self.ws_healthy() && tick % 2 == 1;
        if skip {
            self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
        }
        skip
    }

    pub fn skipped_cycles(&self) -> u64 {
        self.skipped_cycles.load(Ordering::Relaxed)
    }

    /// Poll the fleet and keep the shared flag current.
    pub async fn watch_fleet(
        self: Arc<Self>,
        fleet: Arc<WsFleet>,
        config: SchedulerConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(config.poll_interval);
        let mut reconnects_at_last_tick = fleet.reconnect_count();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let reconnects = fleet.reconnect_count();
            let reconnect_burst = reconnects.saturating_sub(reconnects_at_last_tick)
                >= config.reconnect_threshold;
            reconnects_at_last_tick = reconnects;

            self.observe(fleet.is_healthy() && !reconnect_burst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_count_only_changes() {
        let scheduler = SmartScheduler::new();
        assert_eq!(scheduler.transitions(), 0);

        scheduler.observe(true);
        scheduler.observe(true);
        assert_eq!(scheduler.transitions(), 1);

        scheduler.observe(false);
        scheduler.observe(true);
        assert_eq!(scheduler.transitions(), 3);
    }

    #[test]
    fn healthy_fleet_skips_alternate_cycles() {
        let scheduler = SmartScheduler::new();

        // Unhealthy: full REST behavior, no skips
        scheduler.observe(false);
        assert!(!scheduler.should_skip_cycle(0));
        assert!(!scheduler.should_skip_cycle(1));

        scheduler.observe(true);
        assert!(!scheduler.should_skip_cycle(0));
        assert!(scheduler.should_skip_cycle(1));
        assert!(!scheduler.should_skip_cycle(2));
        assert_eq!(scheduler.skipped_cycles(), 1);
    }
}
