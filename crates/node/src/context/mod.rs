//! Node context - dependency injection container
//!
//! Wires the repositories, the broker and the background workers for one
//! node role. A peripheral node consumes confirmations and reconciles its
//! ledger; the central node consumes requests and sends confirmations.

use std::sync::Arc;
use std::time::Duration;

use clinisync_core::{
    AggregateRepository, AuditStore, ConfirmationProducer, DocumentConfirmationConsumer,
    DocumentSyncConsumer, MessageBroker, PatientRegistry, PeripheralSyncService,
    ReconciliationService, UserConfirmationConsumer, UserSyncConsumer,
};
use clinisync_domain::{ClinisyncError, Config, NodeRole, Result};
use clinisync_infra::observability::metrics::SyncSnapshot;
use clinisync_infra::{
    ConsumerPool, ConsumerPoolConfig, DbManager, MeteredBroker, ReconciliationScheduler,
    ReconciliationSchedulerConfig, SqlCipherAggregateRepository, SqlCipherAuditRepository,
    SqlCipherBroker, SqlCipherDocumentRepository, SqlCipherPatientRepository, SyncMetrics,
};
use tracing::{error, info, instrument};

/// Role-specific entry points.
pub enum NodeServices {
    Peripheral {
        sync: Arc<PeripheralSyncService>,
        audits: Arc<dyn AuditStore>,
    },
    Central {
        aggregates: Arc<dyn AggregateRepository>,
        patients: Arc<dyn PatientRegistry>,
    },
}

/// Node context - holds all services and background workers
pub struct NodeContext {
    pub config: Config,
    pub db: Arc<DbManager>,
    pub broker: Arc<SqlCipherBroker>,
    pub metrics: Arc<SyncMetrics>,
    pub services: NodeServices,
    consumers: ConsumerPool,
    reconciliation: Option<ReconciliationScheduler>,
}

impl NodeContext {
    /// Open the databases and build every component without starting it.
    ///
    /// # Errors
    /// Fails if a database cannot be opened or migrated, if a peripheral node
    /// has no tenant, or if the reconciliation cron expression is invalid.
    pub async fn new(config: Config) -> Result<Self> {
        let db = Arc::new(DbManager::from_config(&config.database)?);
        db.run_migrations()?;
        let broker = Arc::new(SqlCipherBroker::open(&config.broker)?);
        let metrics = Arc::new(SyncMetrics::new());

        let mut consumers = ConsumerPool::new(
            broker.clone(),
            ConsumerPoolConfig::from_config(&config),
            Arc::clone(&metrics),
        );
        let mut reconciliation = None;

        let services = match config.node.role {
            NodeRole::Peripheral => {
                let tenant_id = config.node.tenant_id.ok_or_else(|| {
                    ClinisyncError::Config("a peripheral node requires node.tenant_id".into())
                })?;
                let documents = Arc::new(SqlCipherDocumentRepository::new(Arc::clone(&db)));
                let audits: Arc<dyn AuditStore> =
                    Arc::new(SqlCipherAuditRepository::new(Arc::clone(&db)));
                let broker_port: Arc<dyn MessageBroker> =
                    Arc::new(MeteredBroker::new(broker.clone(), Arc::clone(&metrics)));

                consumers.register(
                    Arc::new(DocumentConfirmationConsumer::new(
                        documents.clone(),
                        Arc::clone(&audits),
                    )),
                    config.workers.document_confirmation,
                )?;
                consumers.register(
                    Arc::new(UserConfirmationConsumer::new(Arc::clone(&audits))),
                    config.workers.user_confirmation,
                )?;

                if config.reconciliation.enabled {
                    let service = Arc::new(ReconciliationService::new(
                        Arc::clone(&audits),
                        Arc::clone(&broker_port),
                        Duration::from_secs(config.reconciliation.stale_after_secs),
                        config.reconciliation.batch_size,
                    )
                    .with_max_attempts(config.reconciliation.max_attempts));
                    reconciliation = Some(
                        ReconciliationScheduler::with_config(
                            ReconciliationSchedulerConfig::from(&config.reconciliation),
                            service,
                            Arc::clone(&metrics),
                        )
                        .await?,
                    );
                }

                let sync = Arc::new(PeripheralSyncService::new(
                    tenant_id,
                    documents,
                    Arc::clone(&audits),
                    broker_port,
                ));
                NodeServices::Peripheral { sync, audits }
            }
            NodeRole::Central => {
                let aggregates: Arc<dyn AggregateRepository> =
                    Arc::new(SqlCipherAggregateRepository::new(Arc::clone(&db)));
                let patients: Arc<dyn PatientRegistry> =
                    Arc::new(SqlCipherPatientRepository::new(Arc::clone(&db)));
                let confirmations = ConfirmationProducer::new(Arc::new(MeteredBroker::new(
                    broker.clone(),
                    Arc::clone(&metrics),
                )));

                consumers.register(
                    Arc::new(DocumentSyncConsumer::new(
                        Arc::clone(&aggregates),
                        confirmations.clone(),
                    )),
                    config.workers.document_sync,
                )?;
                consumers.register(
                    Arc::new(UserSyncConsumer::new(Arc::clone(&patients), confirmations)),
                    config.workers.user_sync,
                )?;
                NodeServices::Central { aggregates, patients }
            }
        };

        info!(
            role = %config.node.role,
            node_id = %config.node.node_id,
            db_path = %db.path().display(),
            reconciliation = reconciliation.is_some(),
            "Node context initialised"
        );

        Ok(Self { config, db, broker, metrics, services, consumers, reconciliation })
    }

    /// Start consumers, then the reconciliation scheduler.
    #[instrument(skip(self), fields(role = %self.config.node.role))]
    pub async fn start(&mut self) -> Result<()> {
        self.consumers.start().await?;
        if let Some(scheduler) = self.reconciliation.as_mut() {
            if let Err(err) = scheduler.start().await {
                error!(error = %err, "Reconciliation scheduler failed to start");
                self.consumers.stop().await?;
                return Err(err.into());
            }
        }
        info!(workers = self.consumers.worker_count(), "Node started");
        Ok(())
    }

    /// Stop resending first, then let in-flight deliveries settle.
    #[instrument(skip(self), fields(role = %self.config.node.role))]
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut first_error: Option<ClinisyncError> = None;

        if let Some(scheduler) = self.reconciliation.as_mut() {
            if scheduler.is_running() {
                if let Err(err) = scheduler.stop().await {
                    error!(error = %err, "Reconciliation scheduler did not stop cleanly");
                    first_error.get_or_insert(err.into());
                }
            }
        }
        if self.consumers.is_running() {
            if let Err(err) = self.consumers.stop().await {
                error!(error = %err, "Consumer pool did not stop cleanly");
                first_error.get_or_insert(err.into());
            }
        }

        let snapshot = self.metrics_snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(metrics = %json, "Node stopped"),
            Err(_) => info!(metrics = ?snapshot, "Node stopped"),
        }

        first_error.map_or(Ok(()), Err)
    }

    pub fn is_running(&self) -> bool {
        self.consumers.is_running()
    }

    pub fn role(&self) -> NodeRole {
        self.config.node.role
    }

    /// Clinic entry point; `None` on the central node.
    pub fn peripheral(&self) -> Option<&Arc<PeripheralSyncService>> {
        match &self.services {
            NodeServices::Peripheral { sync, .. } => Some(sync),
            NodeServices::Central { .. } => None,
        }
    }

    pub fn reconciliation(&self) -> Option<&ReconciliationScheduler> {
        self.reconciliation.as_ref()
    }

    pub fn metrics_snapshot(&self) -> SyncSnapshot {
        self.metrics.snapshot()
    }
}
