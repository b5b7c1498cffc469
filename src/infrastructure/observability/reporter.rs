//! Push-based metrics reporter for marketsync
//!
//! Periodically outputs the metrics registry to stdout.
//! Can optionally push to Prometheus Pushgateway.
//!
//! **Security**: This system only SENDS data, never accepts requests.

use crate::infrastructure::observability::metrics::Metrics;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::info;

/// Push-based metrics reporter
///
/// Outputs metrics in Prometheus text format on a configurable interval.
/// No HTTP server, no incoming connections - only outbound data.
pub struct MetricsReporter {
    metrics: Metrics,
    start_time: Instant,
    interval: Duration,
}

impl MetricsReporter {
    pub fn new(metrics: Metrics, interval: Duration) -> Self {
        Self {
            metrics,
            start_time: Instant::now(),
            interval,
        }
    }

    /// Run the reporter in a loop, outputting metrics periodically
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "MetricsReporter: Starting push-based metrics (interval: {:?})",
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            let uptime = self.start_time.elapsed().as_secs();
            self.metrics.uptime_seconds.set(uptime as f64);

            // Use a special prefix so logs can be easily filtered
            println!("METRICS_PROM:\n{}", self.metrics.render());
            info!("MetricsReporter: Uptime: {}s", uptime);
        }
    }
}
