//! PostgreSQL implementation of OutboxStore
//!
//! - Dual writes run the domain INSERT and the outbox INSERT in one transaction
//! - Pending records are keyed by `(partition_key, id)` so scans stay on one
//!   index range and come back in id order

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::record::{EventRecord, PartitionKey};

/// PostgreSQL implementation of OutboxStore
///
/// # Example
///
/// ```ignore
/// use relay_outbox::PostgresOutboxStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/products").await?;
/// let store = PostgresOutboxStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn write_error(e: sqlx::Error) -> WriteError {
    match &e {
        sqlx::Error::Database(db) if db.kind() != ErrorKind::Other => {
            WriteError::Rejected(db.message().to_string())
        }
        _ => WriteError::Unavailable(e.to_string()),
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, domain, event), fields(collection = domain.collection(), key = domain.key(), event_id = %event.id))]
    async fn atomic_dual_write(
        &self,
        domain: &dyn DomainRecord,
        event: &EventRecord,
    ) -> Result<(), WriteError> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin dual write: {}", e);
            WriteError::Unavailable(e.to_string())
        })?;

        domain
            .insert_query()
            .execute(&mut *tx)
            .await
            .map_err(write_error)?;

        sqlx::query(
            r#"
            INSERT INTO outbox_events (partition_key, id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.partition_key.as_str())
        .bind(event.id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await
        .map_err(write_error)?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit dual write: {}", e);
            WriteError::Unavailable(e.to_string())
        })?;

        debug!(partition = %event.partition_key, event_type = %event.event_type, "dual write committed");
        Ok(())
    }

    #[instrument(skip(self, domain), fields(collection = domain.collection(), key = domain.key()))]
    async fn write_domain(&self, domain: &dyn DomainRecord) -> Result<(), WriteError> {
        domain
            .insert_query()
            .execute(&self.pool)
            .await
            .map_err(write_error)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_domain(
        &self,
        collection: &'static str,
        key: i64,
    ) -> Result<Option<serde_json::Value>, ScanError> {
        let sql = format!("SELECT to_jsonb(t) AS row FROM {collection} t WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ScanError::Unavailable(e.to_string()))?;

        row.map(|r| r.try_get::<serde_json::Value, _>("row"))
            .transpose()
            .map_err(|e| ScanError::Corrupt(e.to_string()))
    }

    #[instrument(skip(self), fields(partition = %partition))]
    async fn scan_pending(&self, partition: &PartitionKey) -> Result<Vec<EventRecord>, ScanError> {
        let rows = sqlx::query(
            r#"
            SELECT id, partition_key, event_type, payload, created_at
            FROM outbox_events
            WHERE partition_key = $1
            ORDER BY id ASC
            "#,
        )
        .bind(partition.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to scan outbox: {}", e);
            ScanError::Unavailable(e.to_string())
        })?;

        rows.iter().map(row_to_record).collect()
    }

    #[instrument(skip(self), fields(partition = %partition))]
    async fn delete(&self, partition: &PartitionKey, id: Uuid) -> Result<(), DeleteError> {
        sqlx::query("DELETE FROM outbox_events WHERE partition_key = $1 AND id = $2")
            .bind(partition.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| DeleteError::Unavailable(e.to_string()))?;

        Ok(())
    }
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<EventRecord, ScanError> {
    let corrupt = |e: sqlx::Error| ScanError::Corrupt(e.to_string());

    let id: Uuid = row.try_get("id").map_err(corrupt)?;
    let partition_key: String = row.try_get("partition_key").map_err(corrupt)?;
    let event_type: String = row.try_get("event_type").map_err(corrupt)?;
    let payload: Vec<u8> = row.try_get("payload").map_err(corrupt)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(corrupt)?;

    Ok(EventRecord::from_parts(
        id,
        PartitionKey::new(partition_key),
        event_type,
        payload,
        created_at,
    ))
}
