pub mod consistency;
pub mod monitor;

pub use consistency::{ConsistencyChecker, ConsistencyConfig};
pub use monitor::{Monitoring, MonitoringThresholds};
