//! In-memory implementation of OutboxStore for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::record::{EventRecord, PartitionKey};

/// Remaining injected failures for one operation kind
#[derive(Default)]
struct FaultBudget(AtomicU32);

impl FaultBudget {
    fn arm(&self, count: u32) {
        self.0.store(count, Ordering::SeqCst);
    }

    /// Consume one failure if any are armed
    fn trip(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory implementation of OutboxStore
///
/// Keeps domain rows and outbox records in maps behind one lock, so a dual
/// write is atomic with respect to readers. Failures can be injected per
/// operation kind to exercise the relay's error paths.
///
/// # Example
///
/// ```
/// use relay_outbox::InMemoryOutboxStore;
///
/// let store = InMemoryOutboxStore::new();
/// store.fail_next_deletes(1);
/// ```
#[derive(Default)]
pub struct InMemoryOutboxStore {
    inner: RwLock<Tables>,
    write_faults: FaultBudget,
    scan_faults: FaultBudget,
    delete_faults: FaultBudget,
    deletes: AtomicU32,
}

#[derive(Default)]
struct Tables {
    domain: HashMap<(&'static str, i64), serde_json::Value>,
    outbox: HashMap<PartitionKey, BTreeMap<Uuid, EventRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes (dual or domain-only)
    pub fn fail_next_writes(&self, count: u32) {
        self.write_faults.arm(count);
    }

    /// Fail the next `count` scans
    pub fn fail_next_scans(&self, count: u32) {
        self.scan_faults.arm(count);
    }

    /// Fail the next `count` deletes
    pub fn fail_next_deletes(&self, count: u32) {
        self.delete_faults.arm(count);
    }

    /// Insert an outbox record directly, bypassing the write path
    pub fn insert_record(&self, record: EventRecord) {
        let mut tables = self.inner.write();
        tables
            .outbox
            .entry(record.partition_key.clone())
            .or_default()
            .insert(record.id, record);
    }

    /// Number of pending records across all partitions
    pub fn pending_count(&self) -> usize {
        self.inner.read().outbox.values().map(BTreeMap::len).sum()
    }

    /// Number of domain rows across all collections
    pub fn domain_count(&self) -> usize {
        self.inner.read().domain.len()
    }

    /// Number of successful delete calls that removed a record
    pub fn delete_count(&self) -> u32 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut tables = self.inner.write();
        tables.domain.clear();
        tables.outbox.clear();
    }
}

fn snapshot_of(domain: &dyn DomainRecord) -> Result<serde_json::Value, WriteError> {
    domain
        .snapshot()
        .map_err(|e| WriteError::Serialization(e.to_string()))
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn atomic_dual_write(
        &self,
        domain: &dyn DomainRecord,
        event: &EventRecord,
    ) -> Result<(), WriteError> {
        if self.write_faults.trip() {
            return Err(WriteError::Unavailable("injected write failure".into()));
        }
        let snapshot = snapshot_of(domain)?;
        let row_key = (domain.collection(), domain.key());

        let mut tables = self.inner.write();
        if tables.domain.contains_key(&row_key) {
            return Err(WriteError::Rejected(format!(
                "duplicate key {} in {}",
                row_key.1, row_key.0
            )));
        }
        let partition = tables
            .outbox
            .entry(event.partition_key.clone())
            .or_default();
        if partition.contains_key(&event.id) {
            return Err(WriteError::Rejected(format!(
                "duplicate outbox id {}",
                event.id
            )));
        }

        partition.insert(event.id, event.clone());
        tables.domain.insert(row_key, snapshot);
        Ok(())
    }

    async fn write_domain(&self, domain: &dyn DomainRecord) -> Result<(), WriteError> {
        if self.write_faults.trip() {
            return Err(WriteError::Unavailable("injected write failure".into()));
        }
        let snapshot = snapshot_of(domain)?;
        let row_key = (domain.collection(), domain.key());

        let mut tables = self.inner.write();
        if tables.domain.contains_key(&row_key) {
            return Err(WriteError::Rejected(format!(
                "duplicate key {} in {}",
                row_key.1, row_key.0
            )));
        }
        tables.domain.insert(row_key, snapshot);
        Ok(())
    }

    async fn fetch_domain(
        &self,
        collection: &'static str,
        key: i64,
    ) -> Result<Option<serde_json::Value>, ScanError> {
        Ok(self.inner.read().domain.get(&(collection, key)).cloned())
    }

    async fn scan_pending(&self, partition: &PartitionKey) -> Result<Vec<EventRecord>, ScanError> {
        if self.scan_faults.trip() {
            return Err(ScanError::Unavailable("injected scan failure".into()));
        }
        let tables = self.inner.read();
        Ok(tables
            .outbox
            .get(partition)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, partition: &PartitionKey, id: Uuid) -> Result<(), DeleteError> {
        if self.delete_faults.trip() {
            return Err(DeleteError::Unavailable("injected delete failure".into()));
        }
        let mut tables = self.inner.write();
        let removed = tables
            .outbox
            .get_mut(partition)
            .and_then(|records| records.remove(&id))
            .is_some();
        if removed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
