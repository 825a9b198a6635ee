//! # Transactional Outbox Relay
//!
//! Storage-backed event relay: a write path commits a domain row and its
//! outbox event in one transaction, and a background dispatcher publishes
//! pending events to a message broker and deletes them once acknowledged.
//!
//! ## Features
//!
//! - **Atomic dual writes**: domain row and event are visible together or not at all
//! - **Time-partitioned scans**: bounded reads over the current partition plus a lookback window
//! - **Publish-then-delete**: a record leaves the outbox only after the broker acknowledged it
//! - **Failure isolation**: an undecodable or unpublishable record never blocks its neighbours
//! - **Graceful shutdown**: in-flight cycles finish, stragglers are cancelled after a timeout
//!
//! Delivery is at-least-once. Consumers deduplicate on the message key.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                            │
//! │  (fixed interval, watch-based stop, shutdown timeout)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │  (scan window → route → publish_and_await → delete)         │
//! └─────────────────────────────────────────────────────────────┘
//!               │                                │
//!               ▼                                ▼
//! ┌──────────────────────────┐    ┌──────────────────────────────┐
//! │       OutboxStore        │    │     Publisher / Producer      │
//! │ (PostgreSQL: outbox_     │    │ (oneshot receipt raced with   │
//! │  events by partition)    │    │  deadline and cancellation)   │
//! └──────────────────────────┘    └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use relay_outbox::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     id: i64,
//! }
//!
//! impl OutboxEvent for OrderPlaced {
//!     const EVENT_TYPE: &'static str = "ORDER_PLACED";
//!
//!     fn entity_id(&self) -> String {
//!         self.id.to_string()
//!     }
//! }
//!
//! let store = Arc::new(InMemoryOutboxStore::new());
//! let broker = InMemoryBroker::new("orders");
//! let dispatcher = Dispatcher::new(
//!     store,
//!     Publisher::new(Arc::new(broker)),
//!     EventRegistry::new().register::<OrderPlaced>(),
//!     DispatcherConfig::default(),
//! )
//! .unwrap();
//! let scheduler = Scheduler::new(Arc::new(dispatcher), SchedulerConfig::default());
//! assert!(!scheduler.is_running());
//! ```

pub mod dispatch;
pub mod duration_millis;
pub mod ids;
pub mod persistence;
pub mod publisher;
pub mod record;

/// Prelude for common imports
pub mod prelude {
    pub use crate::dispatch::{
        CycleReport, DispatchError, Dispatcher, DispatcherConfig, EventRegistry, RouteError,
        Scheduler, SchedulerConfig, SchedulerError,
    };
    pub use crate::ids::{IdError, IdGenerator, Snowflake};
    pub use crate::persistence::{
        DeleteError, DomainRecord, InMemoryOutboxStore, OutboxStore, PostgresOutboxStore,
        ScanError, WriteError,
    };
    pub use crate::publisher::{
        BrokerError, BrokerProducer, InMemoryBroker, MessageId, Publisher, PublishError,
        RestProducer,
    };
    pub use crate::record::{
        Clock, EventRecord, Granularity, ManualClock, OutboxEvent, PartitionKey, Partitioner,
        SystemClock,
    };
}

// Re-export key types at crate root
pub use dispatch::{
    CycleReport, DispatchError, Dispatcher, DispatcherConfig, EventRegistry, RouteError,
    Scheduler, SchedulerConfig, SchedulerError,
};
pub use ids::{IdError, IdGenerator, Snowflake};
pub use persistence::{
    DeleteError, DomainRecord, InMemoryOutboxStore, OutboxStore, PostgresOutboxStore, ScanError,
    WriteError,
};
pub use publisher::{
    BrokerError, BrokerProducer, InMemoryBroker, MessageId, Publisher, PublishError, RestProducer,
};
pub use record::{
    Clock, EventRecord, Granularity, ManualClock, OutboxEvent, PartitionKey, Partitioner,
    SystemClock,
};
