//! Consistency checker: periodic audits that each data kind has fresh rows.

use crate::domain::repositories::{CandleRepository, DepthRepository, PriceCacheRepository};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Intervals the checker audits; a gap in any of them is a high-severity issue.
const AUDITED_INTERVALS: &[&str] = &["1m", "5m", "1h"];
const MAX_TRACKED_ISSUES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IssueSeverity {
    Medium,
    High,
    Critical,
}

impl IssueSeverity {
    /// Score deduction per issue of this severity.
    fn deduction(&self) -> f64 {
        match self {
            IssueSeverity::Medium => 10.0,
            IssueSeverity::High => 25.0,
            IssueSeverity::Critical => 50.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsistencyIssue {
    pub severity: IssueSeverity,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConsistencyConfig {
    pub check_interval: Duration,
    /// Rows must exist within this trailing window.
    pub consistency_window: Duration,
    /// Newest-row age beyond this is a medium issue.
    pub max_data_age: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            consistency_window: Duration::from_secs(1800),
            max_data_age: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsistencyStats {
    pub score: f64,
    pub checks_run: u64,
    pub issues: Vec<ConsistencyIssue>,
}

pub struct ConsistencyChecker {
    config: ConsistencyConfig,
    prices: Arc<dyn PriceCacheRepository>,
    candles: Arc<dyn CandleRepository>,
    depth: Arc<dyn DepthRepository>,
    issues: RwLock<VecDeque<ConsistencyIssue>>,
    /// Moving-average score, starts at 100.
    score: RwLock<f64>,
    checks_run: std::sync::atomic::AtomicU64,
}

impl ConsistencyChecker {
    pub fn new(
        config: ConsistencyConfig,
        prices: Arc<dyn PriceCacheRepository>,
        candles: Arc<dyn CandleRepository>,
        depth: Arc<dyn DepthRepository>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            prices,
            candles,
            depth,
            issues: RwLock::new(VecDeque::new()),
            score: RwLock::new(100.0),
            checks_run: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// One audit pass. Returns the issues found this round.
    pub async fn check_once(&self) -> Result<Vec<ConsistencyIssue>> {
        let now = Utc::now();
        let window_start =
            now - ChronoDuration::from_std(self.config.consistency_window).unwrap_or_default();
        let mut found = Vec::new();

        // Price cache must be moving
        let price_rows = self.prices.count_updated_since(window_start).await?;
        if price_rows == 0 {
            found.push(ConsistencyIssue {
                severity: IssueSeverity::Critical,
                message: format!(
                    "no price_caches rows updated in the last {:?}",
                    self.config.consistency_window
                ),
                detected_at: now,
            });
        }

        // Candle flow per audited interval
        let window_start_ms = window_start.timestamp_millis();
        for interval in AUDITED_INTERVALS {
            let rows = self
                .candles
                .count_interval_since(interval, window_start_ms)
                .await?;
            if rows == 0 {
                found.push(ConsistencyIssue {
                    severity: IssueSeverity::High,
                    message: format!("no {} candles in the last window", interval),
                    detected_at: now,
                });
            }
        }

        // Depth flow
        let depth_rows = self.depth.count_since(window_start_ms).await?;
        if depth_rows == 0 {
            found.push(ConsistencyIssue {
                severity: IssueSeverity::High,
                message: "no depth snapshots in the last window".to_string(),
                detected_at: now,
            });
        }

        // Age of the newest rows
        let max_age = ChronoDuration::from_std(self.config.max_data_age).unwrap_or_default();
        if let Some(newest) = self.prices.newest_update().await?
            && now - newest > max_age
        {
            found.push(ConsistencyIssue {
                severity: IssueSeverity::Medium,
                message: format!("newest price row is {} old", format_age(now - newest)),
                detected_at: now,
            });
        }
        if let Some(newest_ms) = self.candles.newest_open_time().await? {
            let age_ms = now.timestamp_millis() - newest_ms;
            if age_ms > max_age.num_milliseconds() {
                found.push(ConsistencyIssue {
                    severity: IssueSeverity::Medium,
                    message: format!("newest candle is {}s old", age_ms / 1000),
                    detected_at: now,
                });
            }
        }

        self.record(&found);
        Ok(found)
    }

    fn record(&self, found: &[ConsistencyIssue]) {
        self.checks_run
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        {
            let mut issues = self.issues.write().expect("issues poisoned");
            for issue in found {
                if issues.len() == MAX_TRACKED_ISSUES {
                    issues.pop_front();
                }
                issues.push_back(issue.clone());
            }
        }

        let round_score = (100.0
            - found.iter().map(|i| i.severity.deduction()).sum::<f64>())
        .max(0.0);
        let mut score = self.score.write().expect("score poisoned");
        // Moving average smooths one bad round
        *score = *score * 0.7 + round_score * 0.3;
    }

    pub fn stats(&self) -> ConsistencyStats {
        ConsistencyStats {
            score: *self.score.read().expect("score poisoned"),
            checks_run: self.checks_run.load(std::sync::atomic::Ordering::Relaxed),
            issues: self
                .issues
                .read()
                .expect("issues poisoned")
                .iter()
                .cloned()
                .collect(),
        }
    }

    pub fn score(&self) -> f64 {
        *self.score.read().expect("score poisoned")
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            match self.check_once().await {
                Ok(found) if found.is_empty() => {
                    debug!("ConsistencyChecker: all data kinds fresh");
                }
                Ok(found) => {
                    for issue in &found {
                        warn!(
                            "ConsistencyChecker: {:?} issue: {}",
                            issue.severity, issue.message
                        );
                    }
                }
                Err(e) => warn!("ConsistencyChecker: audit failed: {}", e),
            }
        }
    }
}

fn format_age(age: ChronoDuration) -> String {
    format!("{}s", age.num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_deductions_are_ordered() {
        assert!(IssueSeverity::Critical.deduction() > IssueSeverity::High.deduction());
        assert!(IssueSeverity::High.deduction() > IssueSeverity::Medium.deduction());
    }
}
