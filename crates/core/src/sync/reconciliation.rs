//! Resend requests whose ledger rows have gone quiet.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clinisync_domain::constants::DEFAULT_MAX_RESEND_ATTEMPTS;
use clinisync_domain::{ClinisyncError, OutboundMessage, Result, TransitionOutcome};
use tracing::{debug, info, instrument, warn};

use super::ports::{AuditStore, MessageBroker};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub scanned: usize,
    pub requeued: usize,
    /// Rows that closed between the scan and the resend.
    pub skipped: usize,
    pub failed: usize,
}

pub struct ReconciliationService {
    audits: Arc<dyn AuditStore>,
    broker: Arc<dyn MessageBroker>,
    stale_after: Duration,
    batch_size: usize,
    max_attempts: u32,
}

impl ReconciliationService {
    pub fn new(
        audits: Arc<dyn AuditStore>,
        broker: Arc<dyn MessageBroker>,
        stale_after: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            audits,
            broker,
            stale_after,
            batch_size: batch_size.max(1),
            max_attempts: DEFAULT_MAX_RESEND_ATTEMPTS,
        }
    }

    /// Stop resending a row once it has recorded `max_attempts` failures.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Resend every open row not updated within `stale_after`.
    ///
    /// Rows rejected for validation or security reasons and rows at the
    /// attempt cap are skipped. Consumers are idempotent, so a resend racing
    /// a late confirmation is harmless.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ReconciliationReport> {
        let age = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| ClinisyncError::Config(format!("invalid stale_after: {e}")))?;
        let cutoff = Utc::now() - age;
        let rows = self.audits.find_stale(cutoff, self.max_attempts, self.batch_size).await?;

        let mut report = ReconciliationReport { scanned: rows.len(), ..Default::default() };
        for row in rows {
            let message = OutboundMessage::new(row.request.clone());
            if let Err(err) = self.broker.publish(&message).await {
                warn!(audit_id = %row.id, error = %err, "Failed to resend stale request");
                report.failed += 1;
                continue;
            }

            match self.audits.record_requeue(row.id).await {
                Ok(TransitionOutcome::Applied(_)) => {
                    debug!(audit_id = %row.id, status = %row.status, "Stale request resent");
                    report.requeued += 1;
                }
                Ok(_) => report.skipped += 1,
                Err(err) => {
                    warn!(audit_id = %row.id, error = %err, "Resent request but failed to touch audit row");
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                requeued = report.requeued,
                skipped = report.skipped,
                failed = report.failed,
                "Reconciliation pass finished"
            );
        }
        Ok(report)
    }
}
