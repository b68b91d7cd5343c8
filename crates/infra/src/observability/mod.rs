//! In-process metrics for the consumer pool and reconciliation.
//!
//! ## Design Principles
//!
//! 1. **Poison Recovery**: mutex locks recover the inner data instead of
//!    panicking.
//! 2. **Fallible Returns**: record methods return `MetricsResult<()>` so
//!    callers log a failed recording and carry on. Recording currently never
//!    fails; aggregate reads over empty windows do.
//! 3. **Ring Buffers**: latency samples live in a bounded `VecDeque`.

pub mod metrics;

/// Metrics error type
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Empty data set - cannot calculate aggregate metric
    #[error("Empty data: cannot calculate {metric}")]
    EmptyData {
        /// Metric name that failed (e.g., "P95", "average")
        metric: &'static str,
    },
}

/// Result type for metrics operations
pub type MetricsResult<T> = Result<T, MetricsError>;
