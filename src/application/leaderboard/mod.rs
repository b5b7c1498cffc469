//! Realtime "top gainers" leaderboard, one self-contained pipeline per market.

pub mod base_price;
pub mod change_detector;
pub mod price_cache;
pub mod pipeline;
pub mod snapshot_manager;
pub mod ws_manager;

pub use change_detector::{ChangeDetectionConfig, ChangeDetector, SaveDecision};
pub use pipeline::{LeaderboardConfig, RealtimeLeaderboard};
pub use price_cache::{PriceUpdate, RealtimePriceCache, RealtimePriceCacheConfig};
pub use snapshot_manager::{SnapshotManager, SnapshotRetentionConfig};
