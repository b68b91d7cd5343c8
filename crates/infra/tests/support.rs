use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clinisync_core::{
    ConfirmationProducer, DocumentConfirmationConsumer, DocumentSyncConsumer,
    PeripheralSyncService, UserConfirmationConsumer, UserSyncConsumer,
};
use clinisync_domain::{BrokerConfig, Route};
use clinisync_infra::{
    ConsumerPool, ConsumerPoolConfig, DbManager, SqlCipherAggregateRepository,
    SqlCipherAuditRepository, SqlCipherBroker, SqlCipherDocumentRepository,
    SqlCipherPatientRepository, SyncMetrics,
};
use tempfile::TempDir;
use uuid::Uuid;

pub const TEST_DB_KEY: &str = "test_key_64_chars_long_aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// One clinic node and the central node sharing a broker database.
pub struct SyncHarness {
    pub tenant_id: Uuid,
    pub clinic_db: Arc<DbManager>,
    pub broker: Arc<SqlCipherBroker>,
    pub documents: Arc<SqlCipherDocumentRepository>,
    pub audits: Arc<SqlCipherAuditRepository>,
    pub aggregates: Arc<SqlCipherAggregateRepository>,
    pub patients: Arc<SqlCipherPatientRepository>,
    pub peripheral: PeripheralSyncService,
    temp_dir: TempDir,
}

impl SyncHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir should be created");

        let clinic_db = Arc::new(
            DbManager::new(temp_dir.path().join("clinic.db"), 4, Some(TEST_DB_KEY))
                .expect("clinic db should open"),
        );
        clinic_db.run_migrations().expect("clinic schema");

        let central_db = Arc::new(
            DbManager::new(temp_dir.path().join("central.db"), 4, Some(TEST_DB_KEY))
                .expect("central db should open"),
        );
        central_db.run_migrations().expect("central schema");

        let broker_config = BrokerConfig {
            path: temp_dir.path().join("broker.db").display().to_string(),
            pool_size: 4,
            encryption_key: Some(TEST_DB_KEY.into()),
            max_deliveries: 5,
            redelivery_delay_ms: 0,
            lease_secs: 30,
        };
        let broker = Arc::new(SqlCipherBroker::open(&broker_config).expect("broker should open"));

        let tenant_id = Uuid::now_v7();
        let documents = Arc::new(SqlCipherDocumentRepository::new(Arc::clone(&clinic_db)));
        let audits = Arc::new(SqlCipherAuditRepository::new(Arc::clone(&clinic_db)));
        let aggregates = Arc::new(SqlCipherAggregateRepository::new(Arc::clone(&central_db)));
        let patients = Arc::new(SqlCipherPatientRepository::new(central_db));

        let peripheral = PeripheralSyncService::new(
            tenant_id,
            documents.clone(),
            audits.clone(),
            broker.clone(),
        );

        Self {
            tenant_id,
            clinic_db,
            broker,
            documents,
            audits,
            aggregates,
            patients,
            peripheral,
            temp_dir,
        }
    }

    fn pool_config(prefix: &str, route: Route) -> ConsumerPoolConfig {
        ConsumerPoolConfig {
            consumer_prefix: prefix.into(),
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(50),
            join_timeout: Duration::from_secs(5),
            route,
        }
    }

    /// Consumers the central node runs: document and patient requests.
    pub fn central_pool(&self) -> ConsumerPool {
        let confirmations = ConfirmationProducer::new(self.broker.clone());
        let mut pool = ConsumerPool::new(
            self.broker.clone(),
            Self::pool_config("central", Route::Any),
            Arc::new(SyncMetrics::new()),
        );
        pool.register(
            Arc::new(DocumentSyncConsumer::new(self.aggregates.clone(), confirmations.clone())),
            2,
        )
        .expect("register document consumer");
        pool.register(Arc::new(UserSyncConsumer::new(self.patients.clone(), confirmations)), 2)
            .expect("register user consumer");
        pool
    }

    /// Consumers the clinic node runs: both confirmation queues.
    pub fn clinic_pool(&self) -> ConsumerPool {
        confirmation_pool(
            &self.broker,
            self.tenant_id,
            self.documents.clone(),
            self.audits.clone(),
        )
    }

    /// Another clinic with its own database and tenant, on the same broker.
    pub fn open_clinic(&self, name: &str) -> Clinic {
        let db = Arc::new(
            DbManager::new(self.temp_dir.path().join(format!("{name}.db")), 4, Some(TEST_DB_KEY))
                .expect("clinic db should open"),
        );
        db.run_migrations().expect("clinic schema");

        let tenant_id = Uuid::now_v7();
        let documents = Arc::new(SqlCipherDocumentRepository::new(Arc::clone(&db)));
        let audits = Arc::new(SqlCipherAuditRepository::new(db));
        let peripheral = PeripheralSyncService::new(
            tenant_id,
            documents.clone(),
            audits.clone(),
            self.broker.clone(),
        );
        Clinic { tenant_id, broker: self.broker.clone(), documents, audits, peripheral }
    }

    /// Push every open ledger row of the clinic back by `by`.
    pub fn backdate_audits(&self, by: Duration) {
        let conn = self.clinic_db.get_connection().expect("connection");
        let millis = i64::try_from(by.as_millis()).expect("duration fits");
        conn.execute_batch(&format!(
            "UPDATE pending_sync_audit SET updated_at = updated_at - {millis}"
        ))
        .expect("backdate audits");
    }
}

/// A second clinic node attached to the harness broker.
pub struct Clinic {
    pub tenant_id: Uuid,
    pub broker: Arc<SqlCipherBroker>,
    pub documents: Arc<SqlCipherDocumentRepository>,
    pub audits: Arc<SqlCipherAuditRepository>,
    pub peripheral: PeripheralSyncService,
}

impl Clinic {
    pub fn pool(&self) -> ConsumerPool {
        confirmation_pool(&self.broker, self.tenant_id, self.documents.clone(), self.audits.clone())
    }
}

fn confirmation_pool(
    broker: &Arc<SqlCipherBroker>,
    tenant_id: Uuid,
    documents: Arc<SqlCipherDocumentRepository>,
    audits: Arc<SqlCipherAuditRepository>,
) -> ConsumerPool {
    let mut pool = ConsumerPool::new(
        broker.clone(),
        SyncHarness::pool_config(&format!("clinic-{tenant_id}"), Route::Tenant(tenant_id)),
        Arc::new(SyncMetrics::new()),
    );
    pool.register(Arc::new(DocumentConfirmationConsumer::new(documents, audits.clone())), 2)
        .expect("register document confirmation consumer");
    pool.register(Arc::new(UserConfirmationConsumer::new(audits)), 1)
        .expect("register user confirmation consumer");
    pool
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition should hold within five seconds");
}
