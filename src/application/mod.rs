// Realtime leaderboard pipeline
pub mod leaderboard;

// Health aggregation and data audits
pub mod monitoring;

// WS-vs-REST duty-cycle arbitration
pub mod scheduler;

// Periodic syncers
pub mod syncers;

// System orchestrator
pub mod supervisor;
