//! SQLCipher-backed message broker.
//!
//! Queues are rows in an encrypted database that every node opens. A
//! delivery leases its row for a bounded time; an ack deletes the row, a
//! nack or an expired lease makes it visible again. Once a message has been
//! delivered `max_deliveries` times it moves to `broker_dead_letters`, where
//! operators can inspect and replay it.
//!
//! Every read-then-write runs in an IMMEDIATE transaction, so two consumers
//! polling the same queue never lease the same row.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clinisync_core::sync::truncate_error;
use clinisync_core::MessageBroker;
use clinisync_domain::{
    BrokerConfig, ClinisyncError, DeadLetter, Delivery, MessageId, NackOutcome, OutboundMessage,
    QueueName, Result as DomainResult, Route,
};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use tokio::task;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::database::DbManager;
use crate::errors::{map_join_error, map_sql_error, map_storage_error};

const BROKER_SCHEMA_VERSION: i32 = 1;
const BROKER_SCHEMA_SQL: &str = include_str!("schema.sql");

/// Redelivery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Deliveries allowed before a message is dead-lettered.
    pub max_deliveries: u32,
    /// How long a nacked message stays invisible.
    pub redelivery_delay: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for BrokerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            max_deliveries: config.max_deliveries.max(1),
            redelivery_delay: Duration::from_millis(config.redelivery_delay_ms),
        }
    }
}

/// [`MessageBroker`] over an encrypted SQLite database.
pub struct SqlCipherBroker {
    db: Arc<DbManager>,
    settings: BrokerSettings,
}

impl SqlCipherBroker {
    pub fn new(db: Arc<DbManager>, settings: BrokerSettings) -> Self {
        Self { db, settings }
    }

    /// Open (and migrate) the broker database described by `config`.
    pub fn open(config: &BrokerConfig) -> DomainResult<Self> {
        let db = Arc::new(DbManager::new(
            &config.path,
            config.pool_size,
            config.encryption_key.as_deref(),
        )?);
        let broker = Self::new(db, BrokerSettings::from(config));
        broker.run_migrations()?;
        Ok(broker)
    }

    /// Create the broker tables if missing.
    pub fn run_migrations(&self) -> DomainResult<()> {
        let conn = self.db.get_connection()?;
        conn.execute_batch(BROKER_SCHEMA_SQL).map_err(map_sql_error)?;
        conn.execute(
            "INSERT OR IGNORE INTO broker_schema_version (version, applied_at) VALUES (?1, ?2)",
            params![BROKER_SCHEMA_VERSION, now_millis()],
        )
        .map_err(map_storage_error)?;
        Ok(())
    }

    pub const fn settings(&self) -> BrokerSettings {
        self.settings
    }

    pub fn db(&self) -> &Arc<DbManager> {
        &self.db
    }

    fn lease_next(
        tx: &Transaction<'_>,
        queue: QueueName,
        route: Route,
        consumer: &str,
        lease: Duration,
        max_deliveries: u32,
    ) -> DomainResult<Option<Delivery>> {
        let now = now_millis();
        loop {
            let candidate = tx
                .query_row(
                    SELECT_READY_SQL,
                    params![queue.as_str(), now, route.tenant_id().map(|t| t.to_string())],
                    map_stored_message,
                )
                .optional()
                .map_err(map_sql_error)?;
            let Some(stored) = candidate else {
                return Ok(None);
            };

            // An expired lease on a message with no budget left: the consumer
            // died on its last attempt.
            if stored.delivery_count >= max_deliveries {
                Self::move_to_dead_letters(tx, &stored.id, "delivery limit reached", now)?;
                continue;
            }

            let lease_token = Uuid::new_v4();
            let expires_at = now.saturating_add(duration_millis(lease));
            tx.execute(
                LEASE_SQL,
                params![lease_token.to_string(), consumer, expires_at, stored.id],
            )
            .map_err(map_sql_error)?;

            return Ok(Some(Delivery {
                id: stored.id.parse()?,
                queue,
                payload: stored.payload,
                priority: stored.priority,
                correlation_id: stored.correlation_id,
                delivery_count: stored.delivery_count.saturating_add(1),
                enqueued_at: from_millis(stored.enqueued_at)?,
                lease_token,
            }));
        }
    }

    fn move_to_dead_letters(
        tx: &Transaction<'_>,
        id: &str,
        reason: &str,
        now: i64,
    ) -> DomainResult<()> {
        let reason = truncate_error(reason);
        tx.execute(DEAD_LETTER_COPY_SQL, params![now, reason, id]).map_err(map_sql_error)?;
        tx.execute("DELETE FROM broker_messages WHERE id = ?1", params![id])
            .map_err(map_sql_error)?;
        warn!(message_id = %id, reason = %reason, "message dead-lettered");
        Ok(())
    }

    fn settle_nack(
        tx: &Transaction<'_>,
        delivery: &Delivery,
        reason: &str,
        settings: BrokerSettings,
    ) -> DomainResult<NackOutcome> {
        let id = delivery.id.to_string();
        let count: Option<i64> = tx
            .query_row(
                "SELECT delivery_count FROM broker_messages WHERE id = ?1 AND lease_token = ?2",
                params![id, delivery.lease_token.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sql_error)?;
        let Some(count) = count else {
            return Ok(NackOutcome::LeaseLost);
        };
        let delivery_count = u32::try_from(count).unwrap_or(u32::MAX);

        if delivery_count >= settings.max_deliveries {
            tx.execute(
                "UPDATE broker_messages SET last_error = ?1 WHERE id = ?2",
                params![truncate_error(reason), id],
            )
            .map_err(map_sql_error)?;
            Self::move_to_dead_letters(tx, &id, reason, now_millis())?;
            return Ok(NackOutcome::DeadLettered);
        }

        let available_at = now_millis().saturating_add(duration_millis(settings.redelivery_delay));
        tx.execute(REQUEUE_SQL, params![available_at, truncate_error(reason), id])
            .map_err(map_sql_error)?;
        Ok(NackOutcome::Requeued { delivery_count })
    }

    fn replay(tx: &Transaction<'_>, id: &str) -> DomainResult<bool> {
        let copied = tx.execute(REPLAY_COPY_SQL, params![now_millis(), id]).map_err(map_sql_error)?;
        if copied == 0 {
            return Ok(false);
        }
        tx.execute("DELETE FROM broker_dead_letters WHERE id = ?1", params![id])
            .map_err(map_sql_error)?;
        Ok(true)
    }
}

#[async_trait]
impl MessageBroker for SqlCipherBroker {
    #[instrument(skip(self, message), fields(queue = %message.queue()))]
    async fn publish(&self, message: &OutboundMessage) -> DomainResult<MessageId> {
        let db = Arc::clone(&self.db);
        let payload = message.message.to_json()?;
        let queue = message.queue();
        let address = message.address().map(|tenant_id| tenant_id.to_string());
        let priority = message.priority.min(9);
        let correlation_id = message.correlation_id.clone();

        task::spawn_blocking(move || -> DomainResult<MessageId> {
            let conn = db.get_connection()?;
            let id = MessageId::new();
            let now = now_millis();
            conn.execute(
                PUBLISH_SQL,
                params![
                    id.to_string(),
                    queue.as_str(),
                    address,
                    payload,
                    priority,
                    correlation_id,
                    now
                ],
            )
            .map_err(|e| {
                ClinisyncError::Transport(format!(
                    "failed to publish to {queue}: {}",
                    map_storage_error(e)
                ))
            })?;
            debug!(message_id = %id, queue = %queue, "message published");
            Ok(id)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn receive(
        &self,
        queue: QueueName,
        route: Route,
        consumer: &str,
        lease: Duration,
    ) -> DomainResult<Option<Delivery>> {
        let db = Arc::clone(&self.db);
        let consumer = consumer.to_string();
        let max_deliveries = self.settings.max_deliveries;

        task::spawn_blocking(move || -> DomainResult<Option<Delivery>> {
            let mut conn = db.get_connection()?;
            let tx = conn.immediate_transaction().map_err(map_storage_error)?;
            let delivery = Self::lease_next(&tx, queue, route, &consumer, lease, max_deliveries)?;
            tx.commit().map_err(map_sql_error)?;
            Ok(delivery)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn ack(&self, delivery: &Delivery) -> DomainResult<()> {
        let db = Arc::clone(&self.db);
        let id = delivery.id.to_string();
        let lease_token = delivery.lease_token.to_string();

        task::spawn_blocking(move || -> DomainResult<()> {
            let conn = db.get_connection()?;
            let removed = conn
                .execute(
                    "DELETE FROM broker_messages WHERE id = ?1 AND lease_token = ?2",
                    &[&id, &lease_token],
                )
                .map_err(map_storage_error)?;
            if removed == 0 {
                debug!(message_id = %id, "ack ignored, lease no longer held");
            }
            Ok(())
        })
        .await
        .map_err(map_join_error)?
    }

    async fn nack(&self, delivery: &Delivery, reason: &str) -> DomainResult<NackOutcome> {
        let db = Arc::clone(&self.db);
        let delivery = delivery.clone();
        let reason = reason.to_string();
        let settings = self.settings;

        task::spawn_blocking(move || -> DomainResult<NackOutcome> {
            let mut conn = db.get_connection()?;
            let tx = conn.immediate_transaction().map_err(map_storage_error)?;
            let outcome = Self::settle_nack(&tx, &delivery, &reason, settings)?;
            tx.commit().map_err(map_sql_error)?;
            Ok(outcome)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn dead_letters(&self, queue: QueueName, limit: usize) -> DomainResult<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<Vec<DeadLetter>> {
            let conn = db.get_connection()?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let mut stmt = conn.prepare(SELECT_DEAD_LETTERS_SQL).map_err(map_storage_error)?;
            let rows = stmt
                .query_map(&[&queue.as_str(), &limit], map_dead_letter_row)
                .map_err(map_storage_error)?;
            rows.into_iter().map(StoredDeadLetter::into_dead_letter).collect()
        })
        .await
        .map_err(map_join_error)?
    }

    async fn replay_dead_letter(&self, id: MessageId) -> DomainResult<bool> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<bool> {
            let mut conn = db.get_connection()?;
            let tx = conn.immediate_transaction().map_err(map_storage_error)?;
            let replayed = Self::replay(&tx, &id.to_string())?;
            tx.commit().map_err(map_sql_error)?;
            if replayed {
                info!(message_id = %id, "dead letter replayed");
            }
            Ok(replayed)
        })
        .await
        .map_err(map_join_error)?
    }

    async fn depth(&self, queue: QueueName) -> DomainResult<u64> {
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || -> DomainResult<u64> {
            let conn = db.get_connection()?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM broker_messages WHERE queue = ?1",
                    &[&queue.as_str()],
                    |row| row.get(0),
                )
                .map_err(map_storage_error)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
        .map_err(map_join_error)?
    }
}

const PUBLISH_SQL: &str = "INSERT INTO broker_messages (
        id, queue, address, payload, priority, correlation_id, delivery_count, enqueued_at,
        available_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)";

const SELECT_READY_SQL: &str = "SELECT id, payload, priority, correlation_id, delivery_count,
        enqueued_at
    FROM broker_messages
    WHERE queue = ?1
      AND available_at <= ?2
      AND (lease_expires_at IS NULL OR lease_expires_at <= ?2)
      AND (?3 IS NULL OR address IS NULL OR address = ?3)
    ORDER BY priority DESC, enqueued_at ASC, id ASC
    LIMIT 1";

const LEASE_SQL: &str = "UPDATE broker_messages
    SET lease_token = ?1, lease_owner = ?2, lease_expires_at = ?3,
        delivery_count = delivery_count + 1
    WHERE id = ?4";

const REQUEUE_SQL: &str = "UPDATE broker_messages
    SET lease_token = NULL, lease_owner = NULL, lease_expires_at = NULL,
        available_at = ?1, last_error = ?2
    WHERE id = ?3";

const DEAD_LETTER_COPY_SQL: &str = "INSERT OR REPLACE INTO broker_dead_letters (
        id, queue, address, payload, priority, correlation_id, delivery_count, enqueued_at,
        dead_lettered_at, last_error
    )
    SELECT id, queue, address, payload, priority, correlation_id, delivery_count, enqueued_at,
        ?1, COALESCE(last_error, ?2)
    FROM broker_messages
    WHERE id = ?3";

const REPLAY_COPY_SQL: &str = "INSERT INTO broker_messages (
        id, queue, address, payload, priority, correlation_id, delivery_count, enqueued_at,
        available_at
    )
    SELECT id, queue, address, payload, priority, correlation_id, 0, enqueued_at, ?1
    FROM broker_dead_letters
    WHERE id = ?2";

const SELECT_DEAD_LETTERS_SQL: &str = "SELECT id, queue, payload, priority, correlation_id,
        delivery_count, enqueued_at, dead_lettered_at, last_error, address
    FROM broker_dead_letters
    WHERE queue = ?1
    ORDER BY dead_lettered_at DESC, id DESC
    LIMIT ?2";

struct StoredMessage {
    id: String,
    payload: String,
    priority: u8,
    correlation_id: Option<String>,
    delivery_count: u32,
    enqueued_at: i64,
}

fn map_stored_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        payload: row.get(1)?,
        priority: clamp_priority(row.get(2)?),
        correlation_id: row.get(3)?,
        delivery_count: row.get(4)?,
        enqueued_at: row.get(5)?,
    })
}

struct StoredDeadLetter {
    id: String,
    queue: String,
    payload: String,
    priority: u8,
    correlation_id: Option<String>,
    delivery_count: u32,
    enqueued_at: i64,
    dead_lettered_at: i64,
    last_error: Option<String>,
    address: Option<String>,
}

impl StoredDeadLetter {
    fn into_dead_letter(self) -> DomainResult<DeadLetter> {
        Ok(DeadLetter {
            id: self.id.parse()?,
            queue: self.queue.parse()?,
            address: self
                .address
                .map(|raw| {
                    Uuid::parse_str(&raw).map_err(|e| {
                        ClinisyncError::Database(format!("invalid dead letter address '{raw}': {e}"))
                    })
                })
                .transpose()?,
            payload: self.payload,
            priority: self.priority,
            correlation_id: self.correlation_id,
            delivery_count: self.delivery_count,
            enqueued_at: from_millis(self.enqueued_at)?,
            dead_lettered_at: from_millis(self.dead_lettered_at)?,
            last_error: self.last_error,
        })
    }
}

fn map_dead_letter_row(row: &Row<'_>) -> rusqlite::Result<StoredDeadLetter> {
    Ok(StoredDeadLetter {
        id: row.get(0)?,
        queue: row.get(1)?,
        payload: row.get(2)?,
        priority: clamp_priority(row.get(3)?),
        correlation_id: row.get(4)?,
        delivery_count: row.get(5)?,
        enqueued_at: row.get(6)?,
        dead_lettered_at: row.get(7)?,
        last_error: row.get(8)?,
        address: row.get(9)?,
    })
}

fn clamp_priority(raw: i64) -> u8 {
    u8::try_from(raw.clamp(0, 9)).unwrap_or(0)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> DomainResult<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| ClinisyncError::Database(format!("timestamp {millis} out of range")))
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
