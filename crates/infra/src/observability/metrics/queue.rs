//! Per-queue consumer metrics.
//!
//! ## Design
//! - **Relaxed ordering** for independent counters
//! - **VecDeque ring buffer** of handler latencies for percentile reads
//! - **Poison-safe locking** with explicit match pattern (no .expect())

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use clinisync_domain::NackOutcome;
use serde::Serialize;

use crate::observability::{MetricsError, MetricsResult};

const MAX_SAMPLES: usize = 1000;

/// Counters for one queue.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    received: AtomicU64,
    acknowledged: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    lease_lost: AtomicU64,
    broker_errors: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    handler_times_ms: Mutex<VecDeque<u64>>,
}

/// Point-in-time copy of [`QueueMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub received: u64,
    pub acknowledged: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub lease_lost: u64,
    pub broker_errors: u64,
    pub published: u64,
    pub publish_failures: u64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A delivery was handed to a handler.
    pub fn record_received(&self) -> MetricsResult<()> {
        self.received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The handler succeeded and the message was acked.
    pub fn record_ack(&self) -> MetricsResult<()> {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The handler rejected the message; it was acked without redelivery.
    pub fn record_drop(&self) -> MetricsResult<()> {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_nack(&self, outcome: NackOutcome) -> MetricsResult<()> {
        let counter = match outcome {
            NackOutcome::Requeued { .. } => &self.requeued,
            NackOutcome::DeadLettered => &self.dead_lettered,
            NackOutcome::LeaseLost => &self.lease_lost,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Receive, ack or nack failed at the broker.
    pub fn record_broker_error(&self) -> MetricsResult<()> {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Outcome of publishing onto this queue.
    pub fn record_publish(&self, succeeded: bool) -> MetricsResult<()> {
        let counter = if succeeded { &self.published } else { &self.publish_failures };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_handler_time(&self, duration: Duration) -> MetricsResult<()> {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let mut times = match self.handler_times_ms.lock() {
            Ok(guard) => guard,
            Err(poison_err) => {
                tracing::warn!(
                    metric = "QueueMetrics::handler_times_ms",
                    "Mutex poisoned during handler time recording, recovering data"
                );
                poison_err.into_inner()
            }
        };
        times.push_back(ms);
        if times.len() > MAX_SAMPLES {
            times.pop_front();
        }
        Ok(())
    }

    /// 95th percentile handler latency over the retained samples.
    pub fn handler_p95_ms(&self) -> MetricsResult<u64> {
        let times = match self.handler_times_ms.lock() {
            Ok(guard) => guard,
            Err(poison_err) => poison_err.into_inner(),
        };
        if times.is_empty() {
            return Err(MetricsError::EmptyData { metric: "P95" });
        }
        let mut sorted: Vec<u64> = times.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (sorted.len() * 95).div_ceil(100).saturating_sub(1);
        Ok(sorted[rank.min(sorted.len() - 1)])
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}
