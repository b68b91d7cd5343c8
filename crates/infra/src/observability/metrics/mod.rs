//! Metrics collection modules
//!
//! Thread-safe counters for the sync pipeline.

pub mod queue;
pub mod sync;

pub use queue::{QueueMetrics, QueueSnapshot};
pub use sync::{ReconciliationMetrics, SyncMetrics, SyncSnapshot};
