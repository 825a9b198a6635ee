//! Outbox event records and time partitioning
//!
//! An [`EventRecord`] is one pending outbox entry. Its presence in the store is
//! the "pending" signal: there is no status column, and a record is removed
//! only after the broker acknowledged its publication.
//!
//! Records are bucketed by a coarse [`PartitionKey`] (a calendar day by
//! default) so that scans stay bounded. The [`Partitioner`] maps wall-clock
//! time to partition keys and yields the window of partitions a dispatch cycle
//! must cover.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Label of a time bucket, e.g. `2024-05-01` for daily partitions
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One pending outbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Time-ordered identifier (UUID v7), assigned once by the writer
    pub id: Uuid,
    /// Time bucket the record was written into
    pub partition_key: PartitionKey,
    /// Event variant tag, e.g. `CREATE_PRODUCT`
    pub event_type: String,
    /// Serialized entity snapshot taken at write time
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Build a record for `event`, serializing it as the payload.
    ///
    /// The id is a fresh UUID v7 so that records created later sort after
    /// records created earlier within the same partition.
    pub fn for_event<E: OutboxEvent>(
        partition_key: PartitionKey,
        event: &E,
        created_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::now_v7(),
            partition_key,
            event_type: E::EVENT_TYPE.to_string(),
            payload: serde_json::to_vec(event)?,
            created_at,
        })
    }

    /// Build a record from already-serialized parts
    pub fn from_parts(
        id: Uuid,
        partition_key: PartitionKey,
        event_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            partition_key,
            event_type: event_type.into(),
            payload: payload.into(),
            created_at,
        }
    }
}

/// A domain event that can travel through the outbox
///
/// Implementors are serialized into [`EventRecord::payload`] on the write path
/// and decoded again by the dispatcher through the
/// [`EventRegistry`](crate::dispatch::EventRegistry).
pub trait OutboxEvent: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    /// Tag stored in [`EventRecord::event_type`]
    const EVENT_TYPE: &'static str;

    /// Identifier of the entity the event is about.
    ///
    /// Combined with the tag into the broker ordering key so that events of
    /// the same entity land on the same broker partition.
    fn entity_id(&self) -> String;
}

/// Width of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Daily,
    Hourly,
}

impl Granularity {
    fn format(&self) -> &'static str {
        match self {
            Self::Daily => "%Y-%m-%d",
            Self::Hourly => "%Y-%m-%dT%H",
        }
    }

    fn step(&self) -> ChronoDuration {
        match self {
            Self::Daily => ChronoDuration::days(1),
            Self::Hourly => ChronoDuration::hours(1),
        }
    }
}

/// Maps wall-clock time to partition keys
///
/// `lookback` is the number of partitions before the current one that a
/// dispatch cycle also scans. With `lookback = 0` only the live partition is
/// covered and anything left behind at a partition boundary is never scanned
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Partitioner {
    pub granularity: Granularity,
    pub lookback: u32,
}

impl Default for Partitioner {
    fn default() -> Self {
        Self {
            granularity: Granularity::Daily,
            lookback: 1,
        }
    }
}

impl Partitioner {
    /// Largest lookback a dispatcher accepts
    pub const MAX_LOOKBACK: u32 = 1000;

    pub fn new(granularity: Granularity, lookback: u32) -> Self {
        Self {
            granularity,
            lookback,
        }
    }

    /// Partition key in effect at `at`
    pub fn key_for(&self, at: DateTime<Utc>) -> PartitionKey {
        PartitionKey(at.format(self.granularity.format()).to_string())
    }

    /// Partitions to scan at `now`, oldest first, current partition last
    ///
    /// Partitions that would fall before the earliest representable time are
    /// left out.
    pub fn window(&self, now: DateTime<Utc>) -> Vec<PartitionKey> {
        let step = self.granularity.step();
        (0..=self.lookback)
            .rev()
            .filter_map(|back| {
                let offset = step.checked_mul(i32::try_from(back).ok()?)?;
                now.checked_sub_signed(offset)
            })
            .map(|at| self.key_for(at))
            .collect()
    }
}

/// Source of wall-clock time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.write() = at;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.write();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Serialize, Deserialize)]
    struct Renamed {
        id: i64,
    }

    impl OutboxEvent for Renamed {
        const EVENT_TYPE: &'static str = "RENAMED";

        fn entity_id(&self) -> String {
            self.id.to_string()
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 30, 0).unwrap()
    }

    #[test]
    fn test_daily_key() {
        let partitioner = Partitioner::default();
        assert_eq!(partitioner.key_for(at(2024, 3, 9, 23)).as_str(), "2024-03-09");
    }

    #[test]
    fn test_hourly_key() {
        let partitioner = Partitioner::new(Granularity::Hourly, 0);
        assert_eq!(partitioner.key_for(at(2024, 3, 9, 7)).as_str(), "2024-03-09T07");
    }

    #[test]
    fn test_window_crosses_month_boundary() {
        let partitioner = Partitioner::new(Granularity::Daily, 2);
        let window = partitioner.window(at(2024, 3, 1, 0));
        let keys: Vec<&str> = window.iter().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["2024-02-28", "2024-02-29", "2024-03-01"]);
    }

    #[test]
    fn test_window_without_lookback_is_current_only() {
        let partitioner = Partitioner::new(Granularity::Daily, 0);
        assert_eq!(
            partitioner.window(at(2024, 3, 1, 12)),
            vec![PartitionKey::from("2024-03-01")]
        );
    }

    #[test]
    fn test_window_stops_at_earliest_time() {
        let now = DateTime::<Utc>::MIN_UTC + ChronoDuration::days(1);
        let partitioner = Partitioner::new(Granularity::Daily, 3);

        let window = partitioner.window(now);

        assert_eq!(window.len(), 2);
        assert_eq!(window[0], partitioner.key_for(DateTime::<Utc>::MIN_UTC));
        assert_eq!(window[1], partitioner.key_for(now));
    }

    #[test]
    fn test_for_event_serializes_payload() {
        let record =
            EventRecord::for_event("2024-03-01".into(), &Renamed { id: 7 }, at(2024, 3, 1, 1))
                .unwrap();
        assert_eq!(record.event_type, "RENAMED");
        assert_eq!(record.payload, br#"{"id":7}"#.to_vec());
        assert_eq!(record.id.get_version_num(), 7);
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let first = EventRecord::for_event("p".into(), &Renamed { id: 1 }, Utc::now()).unwrap();
        let second = EventRecord::for_event("p".into(), &Renamed { id: 2 }, Utc::now()).unwrap();
        assert!(first.id < second.id);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(at(2024, 1, 1, 0));
        let other = clock.clone();
        clock.advance(ChronoDuration::days(1));
        assert_eq!(other.now(), at(2024, 1, 2, 0));
    }
}
