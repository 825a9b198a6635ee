//! Persistence layer for the outbox
//!
//! This module provides:
//! - [`OutboxStore`] trait for dual writes, partitioned scans and deletes
//! - [`InMemoryOutboxStore`] for testing
//! - [`PostgresOutboxStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use store::{DeleteError, DomainRecord, OutboxStore, ScanError, WriteError};
