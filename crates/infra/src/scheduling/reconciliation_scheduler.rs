//! Cron-driven reconciliation of stale ledger rows.
//!
//! A peripheral node resends requests whose audit rows stayed PENDING or
//! ERROR past their staleness window. The scheduler owns the cron runtime;
//! the pass itself is a [`ReconciliationJob`], normally the core
//! [`ReconciliationService`].
//!
//! Join handles are tracked, cancellation is explicit and every
//! asynchronous operation is wrapped in a timeout. The underlying
//! `JobScheduler` is rebuilt on each start so a stopped scheduler can be
//! started again.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use clinisync_infra::observability::metrics::SyncMetrics;
//! use clinisync_infra::scheduling::{
//!     ReconciliationScheduler, ReconciliationSchedulerConfig, SchedulerResult,
//! };
//!
//! # async fn example(service: Arc<clinisync_core::ReconciliationService>) -> SchedulerResult<()> {
//! let mut scheduler = ReconciliationScheduler::with_config(
//!     ReconciliationSchedulerConfig {
//!         cron_expression: "0 */10 * * * *".into(), // every 10 minutes
//!         ..Default::default()
//!     },
//!     service,
//!     Arc::new(SyncMetrics::new()),
//! )
//! .await?;
//!
//! scheduler.start().await?;
//! // ... node runs ...
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clinisync_core::{ReconciliationReport, ReconciliationService};
use clinisync_domain::{ClinisyncError, ReconciliationConfig};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::InfraError;
use crate::observability::metrics::SyncMetrics;
use crate::observability::MetricsResult;
use crate::scheduling::error::{SchedulerError, SchedulerResult};

/// One reconciliation pass.
#[async_trait]
pub trait ReconciliationJob: Send + Sync {
    async fn run(&self) -> Result<ReconciliationReport, InfraError>;
}

#[async_trait]
impl ReconciliationJob for ReconciliationService {
    async fn run(&self) -> Result<ReconciliationReport, InfraError> {
        self.run_once().await.map_err(InfraError::from)
    }
}

/// Configuration for the reconciliation scheduler.
#[derive(Debug, Clone)]
pub struct ReconciliationSchedulerConfig {
    /// Six-field cron expression (seconds first).
    pub cron_expression: String,
    /// Timeout applied to a single pass.
    pub job_timeout: Duration,
    /// Timeout for starting the underlying scheduler.
    pub start_timeout: Duration,
    /// Timeout for stopping the scheduler.
    pub stop_timeout: Duration,
    /// Timeout for awaiting the monitor task join handle.
    pub join_timeout: Duration,
}

impl Default for ReconciliationSchedulerConfig {
    fn default() -> Self {
        Self {
            cron_expression: "0 */10 * * * *".into(), // every 10 minutes
            job_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ReconciliationConfig> for ReconciliationSchedulerConfig {
    fn from(config: &ReconciliationConfig) -> Self {
        Self { cron_expression: config.cron_expression.clone(), ..Self::default() }
    }
}

/// Reconciliation scheduler with explicit lifecycle management.
pub struct ReconciliationScheduler {
    scheduler: Option<JobScheduler>,
    config: ReconciliationSchedulerConfig,
    monitor_handle: Option<JoinHandle<()>>,
    cancellation: CancellationToken,
    metrics: Arc<SyncMetrics>,
    job: Arc<dyn ReconciliationJob>,
}

impl ReconciliationScheduler {
    /// Create a scheduler with the default timeouts.
    pub async fn new(
        cron_expression: String,
        job: Arc<dyn ReconciliationJob>,
        metrics: Arc<SyncMetrics>,
    ) -> SchedulerResult<Self> {
        let config = ReconciliationSchedulerConfig { cron_expression, ..Default::default() };
        Self::with_config(config, job, metrics).await
    }

    /// Create a scheduler with a custom configuration.
    ///
    /// Fails with `JobRegistrationFailed` for an invalid cron expression.
    pub async fn with_config(
        config: ReconciliationSchedulerConfig,
        job: Arc<dyn ReconciliationJob>,
        metrics: Arc<SyncMetrics>,
    ) -> SchedulerResult<Self> {
        let mut scheduler = Self {
            scheduler: None,
            config,
            monitor_handle: None,
            cancellation: CancellationToken::new(),
            metrics,
            job,
        };
        scheduler.scheduler = Some(scheduler.build_scheduler().await?);
        Ok(scheduler)
    }

    /// Start the cron runtime and the monitor task.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.cancellation = CancellationToken::new();

        let scheduler = match self.scheduler.take() {
            Some(scheduler) => scheduler,
            None => self.build_scheduler().await?,
        };

        let start_timeout = self.config.start_timeout;
        tokio::time::timeout(start_timeout, scheduler.start())
            .await
            .map_err(|source| SchedulerError::Timeout { duration: start_timeout, source })?
            .map_err(|source| SchedulerError::StartFailed { source })?;
        self.scheduler = Some(scheduler);

        let cancel = self.cancellation.clone();
        self.monitor_handle = Some(tokio::spawn(Self::monitor_task(cancel)));
        info!(cron = %self.config.cron_expression, "Reconciliation scheduler started");
        Ok(())
    }

    /// Shut the cron runtime down and wait for the monitor task.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }

        self.cancellation.cancel();

        if let Some(mut scheduler) = self.scheduler.take() {
            let stop_timeout = self.config.stop_timeout;
            tokio::time::timeout(stop_timeout, scheduler.shutdown())
                .await
                .map_err(|source| SchedulerError::Timeout { duration: stop_timeout, source })?
                .map_err(|source| SchedulerError::StopFailed { source })?;
        }

        if let Some(handle) = self.monitor_handle.take() {
            let join_timeout = self.config.join_timeout;
            tokio::time::timeout(join_timeout, handle)
                .await
                .map_err(|source| SchedulerError::Timeout { duration: join_timeout, source })??;
        }

        info!("Reconciliation scheduler stopped");
        self.cancellation = CancellationToken::new();
        Ok(())
    }

    /// Returns true when the monitor task is active.
    pub fn is_running(&self) -> bool {
        self.monitor_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Run one pass immediately, outside the cron schedule.
    pub async fn run_now(&self) -> Result<ReconciliationReport, InfraError> {
        run_job(self.job.as_ref(), self.config.job_timeout, &self.metrics).await
    }

    async fn build_scheduler(&self) -> SchedulerResult<JobScheduler> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|source| SchedulerError::CreationFailed { source })?;

        let metrics = Arc::clone(&self.metrics);
        let job = Arc::clone(&self.job);
        let job_timeout = self.config.job_timeout;

        let job_definition =
            Job::new_async(self.config.cron_expression.as_str(), move |_id, _lock| {
                let metrics = Arc::clone(&metrics);
                let job = Arc::clone(&job);
                Box::pin(async move {
                    // Failures are logged and counted inside run_job.
                    let _ = run_job(job.as_ref(), job_timeout, &metrics).await;
                })
            })
            .map_err(|source| SchedulerError::JobRegistrationFailed { source })?;

        let job_id = job_definition.guid();
        scheduler
            .add(job_definition)
            .await
            .map_err(|source| SchedulerError::JobRegistrationFailed { source })?;

        debug!(cron = %self.config.cron_expression, job_id = %job_id, "Registered reconciliation job");
        Ok(scheduler)
    }

    async fn monitor_task(cancel: CancellationToken) {
        cancel.cancelled().await;
        debug!("Reconciliation scheduler monitor cancelled");
    }
}

async fn run_job(
    job: &dyn ReconciliationJob,
    job_timeout: Duration,
    metrics: &SyncMetrics,
) -> Result<ReconciliationReport, InfraError> {
    let started = Instant::now();
    match tokio::time::timeout(job_timeout, job.run()).await {
        Ok(Ok(report)) => {
            log_metric(metrics.reconciliation.record_run(report.requeued), "reconciliation.run");
            debug!(
                elapsed_ms = started.elapsed().as_millis(),
                requeued = report.requeued,
                "Reconciliation pass finished"
            );
            Ok(report)
        }
        Ok(Err(err)) => {
            log_metric(metrics.reconciliation.record_failure(), "reconciliation.error");
            error!(error = %err, "Reconciliation pass failed");
            Err(err)
        }
        Err(_) => {
            log_metric(metrics.reconciliation.record_timeout(), "reconciliation.timeout");
            warn!(timeout_secs = job_timeout.as_secs(), "Reconciliation pass timed out");
            Err(InfraError(ClinisyncError::Internal(format!(
                "reconciliation pass timed out after {job_timeout:?}"
            ))))
        }
    }
}

fn log_metric(result: MetricsResult<()>, metric: &'static str) {
    if let Err(err) = result {
        warn!(metric = metric, error = ?err, "Failed to record scheduler metric");
    }
}

impl Drop for ReconciliationScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("ReconciliationScheduler dropped while running; cancelling tasks");
            self.cancellation.cancel();
        }
    }
}
