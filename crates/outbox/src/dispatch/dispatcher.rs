//! One polling cycle of the outbox relay
//!
//! A cycle scans every partition in the lookback window, oldest first, and
//! for each pending record in id order:
//!
//! 1. routes it through the [`EventRegistry`] (decode, re-encode, derive key)
//! 2. publishes it and waits for the broker's acknowledgment
//! 3. deletes it from its own partition
//!
//! A failure at any step leaves the record in place and moves on to the next
//! one. Only a scan failure aborts the cycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::registry::{EventRegistry, RouteError};
use crate::persistence::{OutboxStore, ScanError};
use crate::publisher::Publisher;
use crate::record::{Clock, EventRecord, Granularity, PartitionKey, Partitioner, SystemClock};

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Partition width and lookback window
    #[serde(flatten)]
    pub partitioner: Partitioner,

    /// How long one publish may wait for the broker
    #[serde(with = "crate::duration_millis")]
    pub publish_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            partitioner: Partitioner::default(),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many partitions before the current one are scanned
    pub fn with_lookback(mut self, lookback: u32) -> Self {
        self.partitioner.lookback = lookback;
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.partitioner.granularity = granularity;
        self
    }

    /// Set the per-publish deadline
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }
}

/// Outcome counts of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Partitions scanned
    pub partitions: usize,
    /// Records returned by the scans
    pub scanned: usize,
    /// Records the broker acknowledged
    pub published: usize,
    /// Records removed after acknowledgment
    pub deleted: usize,
    /// Records that cannot be routed (unknown tag, undecodable payload)
    pub permanent_failures: usize,
    pub publish_failures: usize,
    pub delete_failures: usize,
    /// Records left untouched because the cycle was cancelled
    pub skipped: usize,
}

impl CycleReport {
    /// Whether every scanned record was published and deleted
    pub fn is_clean(&self) -> bool {
        self.scanned == self.deleted
    }
}

/// Dispatcher errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A partition could not be scanned; the cycle was aborted
    #[error("scan of partition {partition} failed: {source}")]
    Scan {
        partition: PartitionKey,
        #[source]
        source: ScanError,
    },

    /// Pending records carry tags the registry cannot route
    #[error("pending records with unregistered event types: {0:?}")]
    UnknownEventTypes(Vec<String>),

    /// No event types registered
    #[error("event registry is empty")]
    EmptyRegistry,

    #[error("lookback {lookback} exceeds the maximum of {max} partitions")]
    LookbackTooLarge { lookback: u32, max: u32 },
}

/// Runs relay cycles against a store and a publisher
///
/// The dispatcher keeps no state between cycles; everything it needs to know
/// about pending work is in the store.
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Publisher,
    registry: EventRegistry,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    cancel: Mutex<CancellationToken>,
}

impl Dispatcher {
    /// Create a new dispatcher
    ///
    /// Fails if `registry` has no event types or the lookback exceeds
    /// [`Partitioner::MAX_LOOKBACK`].
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Publisher,
        registry: EventRegistry,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        if registry.is_empty() {
            return Err(DispatchError::EmptyRegistry);
        }
        let lookback = config.partitioner.lookback;
        if lookback > Partitioner::MAX_LOOKBACK {
            return Err(DispatchError::LookbackTooLarge {
                lookback,
                max: Partitioner::MAX_LOOKBACK,
            });
        }

        Ok(Self {
            store,
            publisher,
            registry,
            clock: Arc::new(SystemClock),
            config,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Use `clock` instead of the system clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Token passed to every publish
    ///
    /// Cancelling it makes in-flight publishes return immediately and ends
    /// the current cycle early.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Replace a cancelled token with a fresh one so later cycles run again
    ///
    /// Cycles already running keep the token they started with.
    pub fn reset_cancellation(&self) {
        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() {
            debug!("Replacing cancelled dispatch token");
            *cancel = CancellationToken::new();
        }
    }

    /// Partitions the next cycle covers, oldest first
    pub fn window(&self) -> Vec<PartitionKey> {
        self.config.partitioner.window(self.clock.now())
    }

    /// Check that every pending record in the window can be routed
    #[instrument(skip(self))]
    pub async fn preflight(&self) -> Result<(), DispatchError> {
        let mut unknown = BTreeSet::new();
        let mut pending = 0;

        for partition in self.window() {
            let records = self.scan(&partition).await?;
            pending += records.len();
            unknown.extend(
                records
                    .into_iter()
                    .filter(|r| !self.registry.knows(&r.event_type))
                    .map(|r| r.event_type),
            );
        }

        if !unknown.is_empty() {
            error!(event_types = ?unknown, "Pending records with unregistered event types");
            return Err(DispatchError::UnknownEventTypes(unknown.into_iter().collect()));
        }

        info!(
            pending,
            event_types = ?self.registry.event_types(),
            "Dispatcher preflight passed"
        );
        Ok(())
    }

    /// Run one cycle over the partition window
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleReport, DispatchError> {
        let mut report = CycleReport::default();
        let cancel = self.cancellation();

        for partition in self.window() {
            let records = self.scan(&partition).await?;
            report.partitions += 1;
            report.scanned += records.len();

            if records.is_empty() {
                continue;
            }
            debug!(%partition, count = records.len(), "Dispatching pending records");

            for (index, record) in records.iter().enumerate() {
                if cancel.is_cancelled() {
                    report.skipped = records.len() - index;
                    warn!(
                        %partition,
                        skipped = report.skipped,
                        "Dispatch cancelled, ending cycle early"
                    );
                    return Ok(report);
                }
                self.dispatch_record(record, &cancel, &mut report).await;
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                published = report.published,
                deleted = report.deleted,
                permanent_failures = report.permanent_failures,
                publish_failures = report.publish_failures,
                delete_failures = report.delete_failures,
                "Dispatch cycle complete"
            );
        }
        Ok(report)
    }

    async fn scan(&self, partition: &PartitionKey) -> Result<Vec<EventRecord>, DispatchError> {
        self.store
            .scan_pending(partition)
            .await
            .map_err(|source| {
                warn!(%partition, error = %source, "Scan failed, aborting cycle");
                DispatchError::Scan {
                    partition: partition.clone(),
                    source,
                }
            })
    }

    async fn dispatch_record(
        &self,
        record: &EventRecord,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) {
        let routed = match self.registry.route(record) {
            Ok(routed) => routed,
            Err(e) => {
                report.permanent_failures += 1;
                log_route_error(record, &e);
                return;
            }
        };

        let message_id = match self
            .publisher
            .publish_and_await(
                &routed.key,
                &routed.event_type,
                routed.payload,
                self.config.publish_timeout,
                cancel,
            )
            .await
        {
            Ok(message_id) => message_id,
            Err(e) => {
                report.publish_failures += 1;
                warn!(
                    event_id = %record.id,
                    key = %routed.key,
                    error = %e,
                    "Publish failed, record kept for next cycle"
                );
                return;
            }
        };
        report.published += 1;

        match self.store.delete(&record.partition_key, record.id).await {
            Ok(()) => {
                report.deleted += 1;
                debug!(event_id = %record.id, %message_id, "Record delivered");
            }
            Err(e) => {
                report.delete_failures += 1;
                error!(
                    event_id = %record.id,
                    %message_id,
                    error = %e,
                    "Delete after publish failed, record will be published again"
                );
            }
        }
    }
}

fn log_route_error(record: &EventRecord, e: &RouteError) {
    error!(
        event_id = %record.id,
        partition = %record.partition_key,
        event_type = %record.event_type,
        error = %e,
        "Cannot route outbox record, leaving it in place"
    );
}
