//! Prometheus metrics definitions for marketsync
//!
//! All metrics use the `marketsync_` prefix and are read-only.

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGauge, GenericGaugeVec},
};
use std::sync::Arc;

/// Prometheus metrics for the ingestion pipeline
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Successful sync cycles per syncer
    pub sync_success_total: CounterVec,
    /// Failed sync cycles per syncer
    pub sync_errors_total: CounterVec,
    /// Symbols synced per syncer
    pub symbols_synced_total: CounterVec,
    /// Sync cycle duration per syncer
    pub sync_duration_seconds: HistogramVec,
    /// WebSocket messages received per market
    pub ws_messages_total: CounterVec,
    /// WebSocket reconnections per market
    pub ws_reconnects_total: CounterVec,
    /// Leaderboard snapshots written per market
    pub leaderboard_saves_total: CounterVec,
    /// Realtime price cache entries per market
    pub price_cache_entries: GenericGaugeVec<AtomicF64>,
    /// Invalid-symbol marks made by this process
    pub invalid_symbols: GenericGauge<AtomicF64>,
    /// Aggregated pipeline health score (0-100)
    pub health_score: GenericGauge<AtomicF64>,
    /// Data consistency score (0-100)
    pub consistency_score: GenericGauge<AtomicF64>,
    /// Uptime in seconds
    pub uptime_seconds: GenericGauge<AtomicF64>,
}

impl Metrics {
    /// Create a new Metrics instance with all gauges and counters registered
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let sync_success_total = CounterVec::new(
            Opts::new(
                "marketsync_sync_success_total",
                "Successful sync cycles per syncer",
            ),
            &["syncer"],
        )?;
        registry.register(Box::new(sync_success_total.clone()))?;

        let sync_errors_total = CounterVec::new(
            Opts::new(
                "marketsync_sync_errors_total",
                "Failed sync cycles per syncer",
            ),
            &["syncer"],
        )?;
        registry.register(Box::new(sync_errors_total.clone()))?;

        let symbols_synced_total = CounterVec::new(
            Opts::new(
                "marketsync_symbols_synced_total",
                "Symbols synced per syncer",
            ),
            &["syncer"],
        )?;
        registry.register(Box::new(symbols_synced_total.clone()))?;

        let sync_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "marketsync_sync_duration_seconds",
                "Sync cycle duration per syncer",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
            &["syncer"],
        )?;
        registry.register(Box::new(sync_duration_seconds.clone()))?;

        let ws_messages_total = CounterVec::new(
            Opts::new(
                "marketsync_ws_messages_total",
                "WebSocket messages received per market",
            ),
            &["market"],
        )?;
        registry.register(Box::new(ws_messages_total.clone()))?;

        let ws_reconnects_total = CounterVec::new(
            Opts::new(
                "marketsync_ws_reconnects_total",
                "WebSocket reconnections per market",
            ),
            &["market"],
        )?;
        registry.register(Box::new(ws_reconnects_total.clone()))?;

        let leaderboard_saves_total = CounterVec::new(
            Opts::new(
                "marketsync_leaderboard_saves_total",
                "Leaderboard snapshots written per market",
            ),
            &["market"],
        )?;
        registry.register(Box::new(leaderboard_saves_total.clone()))?;

        let price_cache_entries = GaugeVec::new(
            Opts::new(
                "marketsync_price_cache_entries",
                "Realtime price cache entries per market",
            ),
            &["market"],
        )?;
        registry.register(Box::new(price_cache_entries.clone()))?;

        let invalid_symbols = Gauge::with_opts(Opts::new(
            "marketsync_invalid_symbols",
            "Invalid-symbol marks made by this process",
        ))?;
        registry.register(Box::new(invalid_symbols.clone()))?;

        let health_score = Gauge::with_opts(Opts::new(
            "marketsync_health_score",
            "Aggregated pipeline health score (0-100)",
        ))?;
        registry.register(Box::new(health_score.clone()))?;

        let consistency_score = Gauge::with_opts(Opts::new(
            "marketsync_consistency_score",
            "Data consistency score (0-100)",
        ))?;
        registry.register(Box::new(consistency_score.clone()))?;

        let uptime_seconds = Gauge::with_opts(Opts::new(
            "marketsync_uptime_seconds",
            "Service uptime in seconds",
        ))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            sync_success_total,
            sync_errors_total,
            symbols_synced_total,
            sync_duration_seconds,
            ws_messages_total,
            ws_reconnects_total,
            leaderboard_saves_total,
            price_cache_entries,
            invalid_symbols,
            health_score,
            consistency_score,
            uptime_seconds,
        })
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }

    pub fn record_sync(&self, syncer: &str, success: bool, symbols: u64, duration_secs: f64) {
        if success {
            self.sync_success_total.with_label_values(&[syncer]).inc();
        } else {
            self.sync_errors_total.with_label_values(&[syncer]).inc();
        }
        self.symbols_synced_total
            .with_label_values(&[syncer])
            .inc_by(symbols as f64);
        self.sync_duration_seconds
            .with_label_values(&[syncer])
            .observe(duration_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_render() {
        let metrics = Metrics::new().expect("Failed to create metrics");
        metrics.record_sync("price", true, 42, 1.5);
        metrics.health_score.set(97.0);

        let rendered = metrics.render();
        assert!(rendered.contains("marketsync_sync_success_total"));
        assert!(rendered.contains("marketsync_health_score"));
    }
}
