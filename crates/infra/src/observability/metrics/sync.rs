//! Aggregated metrics for one node.

use std::sync::atomic::{AtomicU64, Ordering};

use clinisync_domain::QueueName;
use serde::Serialize;

use super::queue::{QueueMetrics, QueueSnapshot};
use crate::observability::MetricsResult;

/// Reconciliation sweep counters.
#[derive(Debug, Default)]
pub struct ReconciliationMetrics {
    runs: AtomicU64,
    requeued: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

impl ReconciliationMetrics {
    pub fn record_run(&self, requeued: usize) -> MetricsResult<()> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.requeued.fetch_add(requeued as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_failure(&self) -> MetricsResult<()> {
        self.failures.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_timeout(&self) -> MetricsResult<()> {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Per-queue consumer counters plus reconciliation counters.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    documents: QueueMetrics,
    users: QueueMetrics,
    document_confirmations: QueueMetrics,
    user_confirmations: QueueMetrics,
    pub reconciliation: ReconciliationMetrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationSnapshot {
    pub runs: u64,
    pub requeued: u64,
    pub failures: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSnapshot {
    pub queues: Vec<(QueueName, QueueSnapshot)>,
    pub reconciliation: ReconciliationSnapshot,
}

impl SyncSnapshot {
    /// Snapshot for one queue, zeroed if the queue was never touched.
    pub fn queue(&self, queue: QueueName) -> QueueSnapshot {
        self.queues
            .iter()
            .find(|(name, _)| *name == queue)
            .map(|(_, snapshot)| *snapshot)
            .unwrap_or_default()
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, queue: QueueName) -> &QueueMetrics {
        match queue {
            QueueName::DocumentSync => &self.documents,
            QueueName::UserSync => &self.users,
            QueueName::DocumentConfirmation => &self.document_confirmations,
            QueueName::UserConfirmation => &self.user_confirmations,
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        let queues = QueueName::ALL
            .iter()
            .map(|queue| (*queue, self.queue(*queue).snapshot()))
            .collect();
        let reconciliation = ReconciliationSnapshot {
            runs: self.reconciliation.runs.load(Ordering::Relaxed),
            requeued: self.reconciliation.requeued.load(Ordering::Relaxed),
            failures: self.reconciliation.failures.load(Ordering::Relaxed),
            timeouts: self.reconciliation.timeouts.load(Ordering::Relaxed),
        };
        SyncSnapshot { queues, reconciliation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_are_counted_independently() {
        let metrics = SyncMetrics::new();
        metrics.queue(QueueName::DocumentSync).record_received().expect("record");
        metrics.queue(QueueName::DocumentSync).record_ack().expect("record");
        metrics.queue(QueueName::UserSync).record_drop().expect("record");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue(QueueName::DocumentSync).received, 1);
        assert_eq!(snapshot.queue(QueueName::DocumentSync).acknowledged, 1);
        assert_eq!(snapshot.queue(QueueName::UserSync).dropped, 1);
        assert_eq!(snapshot.queue(QueueName::UserConfirmation), QueueSnapshot::default());
    }

    #[test]
    fn reconciliation_counts_runs_and_requeues() {
        let metrics = SyncMetrics::new();
        metrics.reconciliation.record_run(3).expect("record");
        metrics.reconciliation.record_run(0).expect("record");
        metrics.reconciliation.record_timeout().expect("record");

        let snapshot = metrics.snapshot().reconciliation;
        assert_eq!(snapshot.runs, 2);
        assert_eq!(snapshot.requeued, 3);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.failures, 0);
    }
}
