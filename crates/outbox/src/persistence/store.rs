//! OutboxStore trait definition

use async_trait::async_trait;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;
use uuid::Uuid;

use crate::record::{EventRecord, PartitionKey};

/// Error returned when a write transaction fails
///
/// A failed write is all-or-nothing: neither the domain row nor the outbox
/// event is visible afterwards.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// Store could not be reached or the transaction could not commit
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Store rejected the batch (constraint violation, duplicate key, ...)
    #[error("write rejected: {0}")]
    Rejected(String),

    /// Domain snapshot could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Error returned when pending records cannot be read
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be mapped back into a record
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Error returned when a delivered record cannot be removed
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A domain row written by the write path
///
/// The store persists it next to (or without) an outbox event. The in-memory
/// store keeps [`snapshot`](DomainRecord::snapshot); the PostgreSQL store runs
/// [`insert_query`](DomainRecord::insert_query) inside its transaction.
pub trait DomainRecord: Send + Sync {
    /// Table the row belongs to
    fn collection(&self) -> &'static str;

    /// Primary key of the row
    fn key(&self) -> i64;

    /// JSON view of the row
    fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// INSERT statement for the row
    fn insert_query(&self) -> Query<'static, Postgres, PgArguments>;
}

/// Store for domain rows and their outbox events
///
/// Implementations must be thread-safe; a single handle is shared by the
/// request path and the dispatcher.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    // =========================================================================
    // Write path
    // =========================================================================

    /// Persist a domain row and its outbox event as one atomic unit
    async fn atomic_dual_write(
        &self,
        domain: &dyn DomainRecord,
        event: &EventRecord,
    ) -> Result<(), WriteError>;

    /// Persist a domain row that produces no event
    async fn write_domain(&self, domain: &dyn DomainRecord) -> Result<(), WriteError>;

    /// Read back a domain row as JSON
    async fn fetch_domain(
        &self,
        collection: &'static str,
        key: i64,
    ) -> Result<Option<serde_json::Value>, ScanError>;

    // =========================================================================
    // Relay path
    // =========================================================================

    /// All records of `partition`, ordered by id ascending
    async fn scan_pending(&self, partition: &PartitionKey) -> Result<Vec<EventRecord>, ScanError>;

    /// Remove a delivered record; absent records are not an error
    async fn delete(&self, partition: &PartitionKey, id: Uuid) -> Result<(), DeleteError>;
}
