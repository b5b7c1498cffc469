//! Leaderboard change detector.
//!
//! Decides which recomputes become stored snapshots. A write happens on the
//! first run (no prior state in this process and no prior snapshot in the
//! store), when an enabled axis crosses its threshold past the minimum save
//! interval, or unconditionally once the maximum interval has elapsed.

use crate::domain::types::RankedSymbol;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ChangeDetectionConfig {
    pub rank_axis: bool,
    pub price_axis: bool,
    pub percent_axis: bool,
    pub volume_axis: bool,
    /// Rank movement (positions) that counts as significant.
    pub rank_threshold: u32,
    /// Absolute price movement, percent of the previous price.
    pub price_threshold_pct: f64,
    /// Change-percent delta in percentage points.
    pub percent_threshold: f64,
    /// Volume delta, percent of the previous volume.
    pub volume_threshold_pct: f64,
    /// Floor between writes; prevents write storms.
    pub min_save_interval: Duration,
    /// Ceiling between writes; guarantees periodic liveness saves.
    pub max_save_interval: Duration,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        // Production default: only the change-percent axis is armed
        Self {
            rank_axis: false,
            price_axis: false,
            percent_axis: true,
            volume_axis: false,
            rank_threshold: 3,
            price_threshold_pct: 1.0,
            percent_threshold: 0.5,
            volume_threshold_pct: 10.0,
            min_save_interval: Duration::from_secs(30),
            max_save_interval: Duration::from_secs(300),
        }
    }
}

/// Why (or whether) a recompute gets persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveDecision {
    FirstRun,
    Significant(Axis),
    Periodic,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Rank,
    Price,
    ChangePercent,
    Volume,
}

pub struct ChangeDetector {
    config: ChangeDetectionConfig,
    last_emitted: Option<Vec<RankedSymbol>>,
    last_save: Option<Instant>,
    /// Interval reference before the first write (process start).
    reference: Instant,
    saves: u64,
    skips: u64,
}

impl ChangeDetector {
    pub fn new(config: ChangeDetectionConfig) -> Self {
        Self {
            config,
            last_emitted: None,
            last_save: None,
            reference: Instant::now(),
            saves: 0,
            skips: 0,
        }
    }

    /// Evaluate one recompute. `store_has_prior` is whether any snapshot
    /// already exists in the store for this market.
    pub fn evaluate(&mut self, ranked: &[RankedSymbol], store_has_prior: bool) -> SaveDecision {
        self.evaluate_at(ranked, store_has_prior, Instant::now())
    }

    fn evaluate_at(
        &mut self,
        ranked: &[RankedSymbol],
        store_has_prior: bool,
        now: Instant,
    ) -> SaveDecision {
        // First run forces a write regardless of thresholds
        if self.last_emitted.is_none() && !store_has_prior {
            return self.record_save(ranked, now, SaveDecision::FirstRun);
        }

        let since_save = now.duration_since(self.last_save.unwrap_or(self.reference));

        if since_save >= self.config.max_save_interval {
            return self.record_save(ranked, now, SaveDecision::Periodic);
        }

        // No liveness pressure yet; only a significant change past the
        // minimum interval writes
        if since_save >= self.config.min_save_interval
            && let Some(axis) = self.significant_axis(ranked)
        {
            return self.record_save(ranked, now, SaveDecision::Significant(axis));
        }

        self.skips += 1;
        SaveDecision::Skip
    }

    fn record_save(
        &mut self,
        ranked: &[RankedSymbol],
        now: Instant,
        decision: SaveDecision,
    ) -> SaveDecision {
        self.last_emitted = Some(ranked.to_vec());
        self.last_save = Some(now);
        self.saves += 1;
        decision
    }

    fn significant_axis(&self, ranked: &[RankedSymbol]) -> Option<Axis> {
        let previous = self.last_emitted.as_ref()?;
        let prev_by_symbol: HashMap<&str, &RankedSymbol> = previous
            .iter()
            .map(|item| (item.symbol.as_str(), item))
            .collect();

        for item in ranked {
            let Some(prev) = prev_by_symbol.get(item.symbol.as_str()) else {
                // A symbol entering the board is a rank change by definition
                if self.config.rank_axis {
                    return Some(Axis::Rank);
                }
                continue;
            };

            if self.config.rank_axis
                && item.rank.abs_diff(prev.rank) >= self.config.rank_threshold
            {
                return Some(Axis::Rank);
            }

            if self.config.price_axis
                && !prev.current_price.is_zero()
                && pct_delta(prev.current_price, item.current_price)
                    >= self.config.price_threshold_pct
            {
                return Some(Axis::Price);
            }

            if self.config.percent_axis {
                let delta = (item.change_percent - prev.change_percent)
                    .abs()
                    .to_f64()
                    .unwrap_or(0.0);
                if delta >= self.config.percent_threshold {
                    return Some(Axis::ChangePercent);
                }
            }

            if self.config.volume_axis
                && !prev.volume_24h.is_zero()
                && pct_delta(prev.volume_24h, item.volume_24h) >= self.config.volume_threshold_pct
            {
                return Some(Axis::Volume);
            }
        }

        None
    }

    pub fn save_count(&self) -> u64 {
        self.saves
    }

    pub fn skip_count(&self) -> u64 {
        self.skips
    }
}

fn pct_delta(previous: Decimal, current: Decimal) -> f64 {
    ((current - previous) / previous * Decimal::from(100))
        .abs()
        .to_f64()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::PriceSource;
    use std::str::FromStr;

    fn item(symbol: &str, rank: u32, price: &str, change: &str) -> RankedSymbol {
        RankedSymbol {
            rank,
            symbol: symbol.to_string(),
            current_price: Decimal::from_str(price).unwrap(),
            change_percent: Decimal::from_str(change).unwrap(),
            volume_24h: Decimal::from(1000),
            price_change_percent: None,
            data_source: PriceSource::Websocket,
        }
    }

    fn board(changes: &[(&str, &str)]) -> Vec<RankedSymbol> {
        changes
            .iter()
            .enumerate()
            .map(|(i, (symbol, change))| item(symbol, i as u32 + 1, "100", change))
            .collect()
    }

    #[test]
    fn first_run_forces_a_write_regardless_of_thresholds() {
        let mut detector = ChangeDetector::new(ChangeDetectionConfig::default());
        let ranked = board(&[("BTCUSDT", "3.0"), ("ETHUSDT", "2.5")]);
        assert_eq!(detector.evaluate(&ranked, false), SaveDecision::FirstRun);
    }

    #[test]
    fn prior_store_snapshot_suppresses_first_run() {
        let mut detector = ChangeDetector::new(ChangeDetectionConfig::default());
        let ranked = board(&[("BTCUSDT", "3.0")]);
        // Identical board, prior snapshot exists: nothing to write yet
        assert_eq!(detector.evaluate(&ranked, true), SaveDecision::Skip);
    }

    #[test]
    fn significant_change_respects_min_interval() {
        let config = ChangeDetectionConfig {
            min_save_interval: Duration::from_secs(30),
            ..Default::default()
        };
        let mut detector = ChangeDetector::new(config);
        let t0 = Instant::now();

        let first = board(&[("BTCUSDT", "3.0")]);
        assert_eq!(
            detector.evaluate_at(&first, false, t0),
            SaveDecision::FirstRun
        );

        // Big move 5 seconds later: still inside the minimum interval
        let moved = board(&[("BTCUSDT", "9.0")]);
        assert_eq!(
            detector.evaluate_at(&moved, false, t0 + Duration::from_secs(5)),
            SaveDecision::Skip
        );

        // Same move past the minimum interval writes
        assert_eq!(
            detector.evaluate_at(&moved, false, t0 + Duration::from_secs(31)),
            SaveDecision::Significant(Axis::ChangePercent)
        );
    }

    #[test]
    fn periodic_write_fires_after_max_interval_without_changes() {
        let config = ChangeDetectionConfig {
            min_save_interval: Duration::from_secs(30),
            max_save_interval: Duration::from_secs(300),
            ..Default::default()
        };
        let mut detector = ChangeDetector::new(config);
        let t0 = Instant::now();

        let ranked = board(&[("BTCUSDT", "3.0")]);
        detector.evaluate_at(&ranked, false, t0);

        // Identical board inside the max interval: skip
        assert_eq!(
            detector.evaluate_at(&ranked, false, t0 + Duration::from_secs(200)),
            SaveDecision::Skip
        );

        // Identical board past the max interval: liveness write
        assert_eq!(
            detector.evaluate_at(&ranked, false, t0 + Duration::from_secs(301)),
            SaveDecision::Periodic
        );
    }

    #[test]
    fn disabled_axes_do_not_trigger() {
        // Default config arms only the change-percent axis
        let mut detector = ChangeDetector::new(ChangeDetectionConfig::default());
        let t0 = Instant::now();

        detector.evaluate_at(&board(&[("BTCUSDT", "3.0")]), false, t0);

        // Rank reshuffle with identical change percents: no armed axis fires
        let reshuffled = vec![
            item("ETHUSDT", 1, "100", "3.0"),
            item("BTCUSDT", 2, "100", "3.0"),
        ];
        assert_eq!(
            detector.evaluate_at(&reshuffled, false, t0 + Duration::from_secs(60)),
            SaveDecision::Skip
        );
    }
}
