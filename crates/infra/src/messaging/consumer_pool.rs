//! Bounded pool of queue consumers.
//!
//! Each registered [`MessageHandler`] gets a fixed number of worker tasks.
//! A worker leases one delivery at a time, hands it to its handler and
//! settles the outcome with the broker: `Ack` and `Drop` remove the
//! message, `Retry` nacks it so the broker redelivers or dead-letters it.
//!
//! Join handles are tracked, cancellation is explicit and stopping waits
//! for in-flight deliveries up to `join_timeout`. A delivery that is never
//! settled (crash, cancelled receive) becomes visible again once its lease
//! expires.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use clinisync_infra::messaging::{ConsumerPool, ConsumerPoolConfig};
//! use clinisync_infra::observability::metrics::SyncMetrics;
//!
//! # async fn example() -> clinisync_domain::Result<()> {
//! # let broker: Arc<dyn clinisync_core::MessageBroker> = todo!();
//! # let handler: Arc<dyn clinisync_core::MessageHandler> = todo!();
//! let mut pool =
//!     ConsumerPool::new(broker, ConsumerPoolConfig::default(), Arc::new(SyncMetrics::new()));
//! pool.register(handler, 10)?;
//! pool.start().await?;
//! // ... node runs ...
//! pool.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clinisync_core::sync::truncate_error;
use clinisync_core::{Disposition, MessageBroker, MessageHandler};
use clinisync_domain::{Config, Delivery, NackOutcome, NodeRole, Route};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::errors::WorkerError;
use crate::observability::metrics::{QueueMetrics, SyncMetrics};
use crate::observability::MetricsResult;

/// Configuration for the consumer pool.
#[derive(Debug, Clone)]
pub struct ConsumerPoolConfig {
    /// Prefix of the consumer id recorded on broker leases.
    pub consumer_prefix: String,
    /// How long a leased delivery stays invisible to other consumers.
    pub lease: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Sleep after the broker itself failed.
    pub error_backoff: Duration,
    /// Join timeout when stopping
    pub join_timeout: Duration,
    /// Messages the workers may lease; a clinic only takes its own replies.
    pub route: Route,
}

impl Default for ConsumerPoolConfig {
    fn default() -> Self {
        Self {
            consumer_prefix: "clinisync-node".into(),
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(5),
            join_timeout: Duration::from_secs(10),
            route: Route::Any,
        }
    }
}

impl ConsumerPoolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            consumer_prefix: config.node.node_id.clone(),
            lease: Duration::from_secs(config.broker.lease_secs.max(1)),
            poll_interval: Duration::from_millis(config.workers.poll_interval_ms.max(1)),
            route: match config.node.role {
                NodeRole::Peripheral => Route::for_tenant(config.node.tenant_id),
                NodeRole::Central => Route::Any,
            },
            ..Self::default()
        }
    }
}

struct Registration {
    handler: Arc<dyn MessageHandler>,
    concurrency: usize,
}

/// Everything one worker task needs.
#[derive(Clone)]
struct Worker {
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<SyncMetrics>,
    consumer_id: String,
    route: Route,
    lease: Duration,
    poll_interval: Duration,
    error_backoff: Duration,
}

/// Consumer pool with explicit lifecycle management.
pub struct ConsumerPool {
    broker: Arc<dyn MessageBroker>,
    registrations: Vec<Registration>,
    config: ConsumerPoolConfig,
    metrics: Arc<SyncMetrics>,
    cancellation: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
}

impl ConsumerPool {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        config: ConsumerPoolConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            broker,
            registrations: Vec::new(),
            config,
            metrics,
            cancellation: CancellationToken::new(),
            task_handles: Vec::new(),
        }
    }

    /// Run `concurrency` workers for `handler` on the next start.
    ///
    /// A concurrency of zero leaves the queue unconsumed.
    pub fn register(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        concurrency: usize,
    ) -> Result<(), WorkerError> {
        if self.is_running() {
            return Err(WorkerError::AlreadyRunning);
        }
        if concurrency == 0 {
            warn!(handler = handler.name(), queue = %handler.queue(), "Consumer disabled");
            return Ok(());
        }
        self.registrations.push(Registration { handler, concurrency });
        Ok(())
    }

    /// Start every registered worker.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        if self.is_running() {
            return Err(WorkerError::AlreadyRunning);
        }
        if self.registrations.is_empty() {
            return Err(WorkerError::NoHandlers);
        }

        self.cancellation = CancellationToken::new();

        for registration in &self.registrations {
            for index in 0..registration.concurrency {
                let worker = Worker {
                    broker: Arc::clone(&self.broker),
                    handler: Arc::clone(&registration.handler),
                    metrics: Arc::clone(&self.metrics),
                    consumer_id: format!(
                        "{}:{}:{index}",
                        self.config.consumer_prefix,
                        registration.handler.name()
                    ),
                    route: self.config.route,
                    lease: self.config.lease,
                    poll_interval: self.config.poll_interval,
                    error_backoff: self.config.error_backoff,
                };
                let cancel = self.cancellation.clone();
                self.task_handles.push(tokio::spawn(worker.run(cancel)));
            }
            info!(
                handler = registration.handler.name(),
                queue = %registration.handler.queue(),
                workers = registration.concurrency,
                route = %self.config.route,
                "Consumers started"
            );
        }

        Ok(())
    }

    /// Stop all workers, letting in-flight deliveries settle.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        if !self.is_running() {
            return Err(WorkerError::NotRunning);
        }

        info!(workers = self.task_handles.len(), "Stopping consumer pool");
        self.cancellation.cancel();

        let handles = std::mem::take(&mut self.task_handles);
        let pending = handles.len();
        let join_timeout = self.config.join_timeout;
        let result = match tokio::time::timeout(join_timeout, futures::future::join_all(handles))
            .await
        {
            Ok(results) => {
                let panicked = results.iter().filter(|r| r.is_err()).count();
                if panicked > 0 {
                    warn!(panicked, "Consumer tasks panicked");
                    Err(WorkerError::Panicked(panicked))
                } else {
                    Ok(())
                }
            }
            Err(_) => {
                warn!(pending, "Consumer tasks did not complete within timeout");
                Err(WorkerError::JoinTimeout { pending, timeout: join_timeout })
            }
        };

        self.cancellation = CancellationToken::new();
        info!("Consumer pool stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        !self.task_handles.is_empty()
    }

    /// Workers spawned by the last start.
    pub fn worker_count(&self) -> usize {
        self.task_handles.len()
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }
}

impl Drop for ConsumerPool {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("ConsumerPool dropped while running; cancelling workers");
            self.cancellation.cancel();
        }
    }
}

impl Worker {
    fn queue_metrics(&self) -> &QueueMetrics {
        self.metrics.queue(self.handler.queue())
    }

    async fn run(self, cancel: CancellationToken) {
        debug!(consumer = %self.consumer_id, "Consumer loop started");
        while !cancel.is_cancelled() {
            let idle = match self
                .broker
                .receive(self.handler.queue(), self.route, &self.consumer_id, self.lease)
                .await
            {
                Ok(Some(delivery)) => {
                    self.dispatch(&delivery).await;
                    continue;
                }
                Ok(None) => self.poll_interval,
                Err(err) => {
                    warn!(consumer = %self.consumer_id, error = %err, "Receive failed");
                    log_metric(self.queue_metrics().record_broker_error(), "consumer.receive.error");
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
        }
        debug!(consumer = %self.consumer_id, "Consumer loop cancelled");
    }

    async fn dispatch(&self, delivery: &Delivery) {
        let metrics = self.queue_metrics();
        log_metric(metrics.record_received(), "consumer.received");
        let started = Instant::now();

        let disposition = match AssertUnwindSafe(self.handler.handle(delivery)).catch_unwind().await
        {
            Ok(disposition) => disposition,
            Err(_) => {
                error!(
                    handler = self.handler.name(),
                    message_id = %delivery.id,
                    "Handler panicked"
                );
                Disposition::retry("handler panicked")
            }
        };
        log_metric(metrics.record_handler_time(started.elapsed()), "consumer.handler.duration");

        match disposition {
            Disposition::Ack => {
                if self.settle_ack(delivery).await {
                    log_metric(metrics.record_ack(), "consumer.ack");
                }
            }
            Disposition::Drop { reason } => {
                warn!(
                    handler = self.handler.name(),
                    message_id = %delivery.id,
                    reason = %reason,
                    "Dropping unprocessable message"
                );
                if self.settle_ack(delivery).await {
                    log_metric(metrics.record_drop(), "consumer.drop");
                }
            }
            Disposition::Retry { reason } => self.settle_retry(delivery, &reason).await,
        }
    }

    async fn settle_ack(&self, delivery: &Delivery) -> bool {
        match self.broker.ack(delivery).await {
            Ok(()) => true,
            Err(err) => {
                warn!(message_id = %delivery.id, error = %err, "Ack failed; message will be redelivered");
                log_metric(self.queue_metrics().record_broker_error(), "consumer.ack.error");
                false
            }
        }
    }

    async fn settle_retry(&self, delivery: &Delivery, reason: &str) {
        let outcome = match self.broker.nack(delivery, &truncate_error(reason)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(message_id = %delivery.id, error = %err, "Nack failed; lease will expire");
                log_metric(self.queue_metrics().record_broker_error(), "consumer.nack.error");
                return;
            }
        };

        match outcome {
            NackOutcome::Requeued { delivery_count } => debug!(
                message_id = %delivery.id,
                delivery_count,
                reason,
                "Message requeued"
            ),
            NackOutcome::DeadLettered => error!(
                queue = %delivery.queue,
                message_id = %delivery.id,
                delivery_count = delivery.delivery_count,
                reason,
                "Message dead-lettered"
            ),
            NackOutcome::LeaseLost => warn!(
                message_id = %delivery.id,
                "Lease expired before nack; another consumer owns the message"
            ),
        }
        log_metric(self.queue_metrics().record_nack(outcome), "consumer.nack");
    }
}

fn log_metric(result: MetricsResult<()>, metric: &'static str) {
    if let Err(err) = result {
        warn!(metric, error = %err, "Failed to record consumer metric");
    }
}
