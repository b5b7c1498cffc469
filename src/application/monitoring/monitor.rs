//! Monitoring aggregate.
//!
//! Collects signals from the WS fleet, every syncer's statistics, the
//! consistency checker and the OS, raises typed alerts under a per-alert
//! cooldown, classifies each component, and folds everything into a single
//! health score in [0, 100].

use crate::application::leaderboard::RealtimeLeaderboard;
use crate::application::monitoring::consistency::ConsistencyChecker;
use crate::application::syncers::{ComponentHealth, Syncer};
use crate::infrastructure::binance::fleet::WsFleet;
use crate::infrastructure::observability::Metrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    WsSilence,
    ReconnectStorm,
    SyncerFailing,
    LowConsistency,
    HighMemory,
    HighCpu,
    TaskFlood,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub component: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct MonitoringThresholds {
    pub ws_downtime: Duration,
    pub ws_reconnects_per_check: u64,
    pub syncer_error_rate: f64,
    pub consistency_score_floor: f64,
    pub memory_pct: f64,
    pub cpu_pct: f64,
    pub task_count: usize,
    pub alert_cooldown: Duration,
    pub check_interval: Duration,
}

impl Default for MonitoringThresholds {
    fn default() -> Self {
        Self {
            ws_downtime: Duration::from_secs(120),
            ws_reconnects_per_check: 5,
            syncer_error_rate: 0.2,
            consistency_score_floor: 70.0,
            memory_pct: 85.0,
            cpu_pct: 85.0,
            task_count: 2000,
            alert_cooldown: Duration::from_secs(300),
            check_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitoringReport {
    pub overall: Option<ComponentHealth>,
    pub components: Vec<(String, ComponentHealth)>,
    pub health_score: f64,
    pub alerts: Vec<Alert>,
}

pub struct Monitoring {
    thresholds: MonitoringThresholds,
    fleet: Arc<WsFleet>,
    syncers: Vec<Arc<dyn Syncer>>,
    leaderboards: Vec<Arc<RealtimeLeaderboard>>,
    consistency: Arc<ConsistencyChecker>,
    metrics: Metrics,
    task_count: Arc<AtomicUsize>,
    last_alerts: Mutex<HashMap<(AlertKind, String), Instant>>,
    system: Mutex<System>,
    reconnects_at_last_check: AtomicUsize,
    /// Previously observed totals, for counter deltas.
    counter_baseline: Mutex<CounterBaseline>,
}

#[derive(Default)]
struct CounterBaseline {
    ws_messages: HashMap<String, u64>,
    ws_reconnects: HashMap<String, u64>,
    leaderboard_saves: HashMap<String, u64>,
}

impl Monitoring {
    pub fn new(
        thresholds: MonitoringThresholds,
        fleet: Arc<WsFleet>,
        syncers: Vec<Arc<dyn Syncer>>,
        leaderboards: Vec<Arc<RealtimeLeaderboard>>,
        consistency: Arc<ConsistencyChecker>,
        metrics: Metrics,
        task_count: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        Arc::new(Self {
            thresholds,
            fleet,
            syncers,
            leaderboards,
            consistency,
            metrics,
            task_count,
            last_alerts: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
            reconnects_at_last_check: AtomicUsize::new(0),
            counter_baseline: Mutex::new(CounterBaseline::default()),
        })
    }

    /// One monitoring pass: classify, score, alert.
    pub async fn check_once(&self) -> MonitoringReport {
        let mut report = MonitoringReport::default();
        let mut deductions = 0.0f64;

        // --- WS fleet ---
        let fleet_health = self.fleet.get_health_status().await;
        let mut worst_silence = Duration::ZERO;
        let mut missing_connections = false;
        {
            let mut baseline = self.counter_baseline.lock().expect("baseline poisoned");
            for (market, market_health) in &fleet_health.markets {
                let key = market.to_string();
                let previous = baseline.ws_messages.insert(key.clone(), market_health.message_count);
                self.metrics
                    .ws_messages_total
                    .with_label_values(&[&key])
                    .inc_by(
                        market_health
                            .message_count
                            .saturating_sub(previous.unwrap_or(0)) as f64,
                    );
                let previous = baseline
                    .ws_reconnects
                    .insert(key.clone(), market_health.reconnect_count);
                self.metrics
                    .ws_reconnects_total
                    .with_label_values(&[&key])
                    .inc_by(
                        market_health
                            .reconnect_count
                            .saturating_sub(previous.unwrap_or(0)) as f64,
                    );
            }
        }
        for (market, market_health) in &fleet_health.markets {
            if market_health.subscribed_symbols == 0 {
                continue;
            }
            if let Some(age) = market_health.last_message_age {
                worst_silence = worst_silence.max(age);
                if age > self.thresholds.ws_downtime {
                    self.raise(
                        &mut report,
                        AlertKind::WsSilence,
                        &market.to_string(),
                        format!("no WS message on {} for {:?}", market, age),
                    );
                }
            }
            if market_health.healthy_connections == 0 && market_health.connections > 0 {
                missing_connections = true;
            }
        }

        // No recent message: up to 30
        deductions += if worst_silence > Duration::from_secs(300) {
            30.0
        } else if worst_silence > self.thresholds.ws_downtime {
            15.0
        } else {
            0.0
        };
        // Missing connections: up to 15
        if missing_connections {
            deductions += 15.0;
        }

        let reconnects = self.fleet.reconnect_count() as usize;
        let previous = self
            .reconnects_at_last_check
            .swap(reconnects, Ordering::AcqRel);
        if (reconnects.saturating_sub(previous)) as u64 >= self.thresholds.ws_reconnects_per_check
        {
            self.raise(
                &mut report,
                AlertKind::ReconnectStorm,
                "fleet",
                format!("{} reconnects since last check", reconnects - previous),
            );
        }

        let fleet_component = if worst_silence > Duration::from_secs(300) || missing_connections {
            ComponentHealth::Unhealthy
        } else if worst_silence > self.thresholds.ws_downtime {
            ComponentHealth::Warning
        } else {
            ComponentHealth::Healthy
        };
        report
            .components
            .push(("ws_fleet".to_string(), fleet_component));

        // --- syncers: error rate bands, up to 25 ---
        let mut worst_error_rate = 0.0f64;
        let mut invalid_marked_total = 0u64;
        for syncer in &self.syncers {
            let snapshot = syncer.stats().snapshot();
            invalid_marked_total += snapshot.invalid_marked;
            let total = snapshot.success_count + snapshot.error_count;
            let rate = if total > 0 {
                snapshot.error_count as f64 / total as f64
            } else {
                0.0
            };
            worst_error_rate = worst_error_rate.max(rate);

            let health = syncer.stats().health(Duration::from_secs(600));
            if health != ComponentHealth::Healthy && rate > self.thresholds.syncer_error_rate {
                self.raise(
                    &mut report,
                    AlertKind::SyncerFailing,
                    syncer.name(),
                    format!(
                        "syncer {} error rate {:.0}% (last error: {})",
                        syncer.name(),
                        rate * 100.0,
                        snapshot.last_error.as_deref().unwrap_or("none")
                    ),
                );
            }
            report.components.push((syncer.name().to_string(), health));
        }
        deductions += if worst_error_rate > 0.5 {
            25.0
        } else if worst_error_rate > 0.2 {
            15.0
        } else if worst_error_rate > 0.05 {
            5.0
        } else {
            0.0
        };
        self.metrics.invalid_symbols.set(invalid_marked_total as f64);

        // --- leaderboards: slow recompute up to 15, cache hit rate up to 10 ---
        let mut slowest_recompute = Duration::ZERO;
        let mut lowest_hit_rate = 1.0f64;
        for board in &self.leaderboards {
            slowest_recompute = slowest_recompute.max(board.last_recompute_duration());
            lowest_hit_rate = lowest_hit_rate.min(board.price_cache().hit_rate());
            self.metrics
                .price_cache_entries
                .with_label_values(&[board.market().as_str()])
                .set(board.price_cache().len() as f64);

            let key = board.market().to_string();
            let previous = {
                let mut baseline = self.counter_baseline.lock().expect("baseline poisoned");
                baseline
                    .leaderboard_saves
                    .insert(key.clone(), board.save_count())
            };
            self.metrics
                .leaderboard_saves_total
                .with_label_values(&[&key])
                .inc_by(board.save_count().saturating_sub(previous.unwrap_or(0)) as f64);
        }
        deductions += if slowest_recompute > Duration::from_secs(1) {
            15.0
        } else if slowest_recompute > Duration::from_millis(250) {
            5.0
        } else {
            0.0
        };
        deductions += if lowest_hit_rate < 0.5 {
            10.0
        } else if lowest_hit_rate < 0.8 {
            5.0
        } else {
            0.0
        };

        // --- store latency proxy: slow sync cycles, up to 10 ---
        let slowest_avg_ms = self
            .syncers
            .iter()
            .map(|s| s.stats().snapshot().avg_duration_ms)
            .fold(0.0f64, f64::max);
        deductions += if slowest_avg_ms > 60_000.0 {
            10.0
        } else if slowest_avg_ms > 30_000.0 {
            5.0
        } else {
            0.0
        };

        // --- consistency ---
        let consistency_score = self.consistency.score();
        self.metrics.consistency_score.set(consistency_score);
        if consistency_score < self.thresholds.consistency_score_floor {
            self.raise(
                &mut report,
                AlertKind::LowConsistency,
                "consistency",
                format!("consistency score {:.1}", consistency_score),
            );
        }
        report.components.push((
            "consistency".to_string(),
            if consistency_score < 50.0 {
                ComponentHealth::Unhealthy
            } else if consistency_score < self.thresholds.consistency_score_floor {
                ComponentHealth::Warning
            } else {
                ComponentHealth::Healthy
            },
        ));

        // --- OS ---
        let (memory_pct, cpu_pct) = {
            let mut system = self.system.lock().expect("sysinfo poisoned");
            system.refresh_memory();
            system.refresh_cpu_usage();
            let memory_pct = if system.total_memory() > 0 {
                system.used_memory() as f64 / system.total_memory() as f64 * 100.0
            } else {
                0.0
            };
            (memory_pct, system.global_cpu_usage() as f64)
        };
        if memory_pct > self.thresholds.memory_pct {
            self.raise(
                &mut report,
                AlertKind::HighMemory,
                "os",
                format!("memory usage {:.1}%", memory_pct),
            );
        }
        if cpu_pct > self.thresholds.cpu_pct {
            self.raise(
                &mut report,
                AlertKind::HighCpu,
                "os",
                format!("cpu usage {:.1}%", cpu_pct),
            );
        }
        let tasks = self.task_count.load(Ordering::Relaxed);
        if tasks > self.thresholds.task_count {
            self.raise(
                &mut report,
                AlertKind::TaskFlood,
                "runtime",
                format!("{} live tasks", tasks),
            );
        }

        report.health_score = (100.0 - deductions).max(0.0);
        self.metrics.health_score.set(report.health_score);

        report.overall = Some(aggregate(&report.components));
        report
    }

    /// Raise an alert unless an identical one fired within the cooldown.
    fn raise(&self, report: &mut MonitoringReport, kind: AlertKind, component: &str, message: String) {
        let key = (kind, component.to_string());
        let mut last = self.last_alerts.lock().expect("alert map poisoned");
        let now = Instant::now();
        if let Some(previous) = last.get(&key)
            && now.duration_since(*previous) < self.thresholds.alert_cooldown
        {
            return;
        }
        last.insert(key, now);

        warn!("Monitoring: ALERT [{:?}/{}]: {}", kind, component, message);
        report.alerts.push(Alert {
            kind,
            component: component.to_string(),
            message,
        });
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.thresholds.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            let report = self.check_once().await;
            info!(
                "Monitoring: overall {:?}, score {:.1}, {} alerts",
                report.overall,
                report.health_score,
                report.alerts.len()
            );
        }
    }
}

/// Worst component wins.
fn aggregate(components: &[(String, ComponentHealth)]) -> ComponentHealth {
    let mut overall = ComponentHealth::Healthy;
    for (_, health) in components {
        overall = match (overall, health) {
            (_, ComponentHealth::Unhealthy) | (ComponentHealth::Unhealthy, _) => {
                ComponentHealth::Unhealthy
            }
            (_, ComponentHealth::Warning) | (ComponentHealth::Warning, _) => {
                ComponentHealth::Warning
            }
            _ => ComponentHealth::Healthy,
        };
    }
    overall
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_takes_the_worst_component() {
        let components = vec![
            ("a".to_string(), ComponentHealth::Healthy),
            ("b".to_string(), ComponentHealth::Warning),
            ("c".to_string(), ComponentHealth::Healthy),
        ];
        assert_eq!(aggregate(&components), ComponentHealth::Warning);

        let components = vec![
            ("a".to_string(), ComponentHealth::Warning),
            ("b".to_string(), ComponentHealth::Unhealthy),
        ];
        assert_eq!(aggregate(&components), ComponentHealth::Unhealthy);
        assert_eq!(aggregate(&[]), ComponentHealth::Healthy);
    }
}
