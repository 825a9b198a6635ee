//! End-to-end relay tests over the in-memory store and broker
//!
//! Run with: cargo test -p relay-outbox --test relay_test

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;
use uuid::Uuid;

use relay_outbox::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Widget {
    id: i64,
    name: String,
    price: f64,
}

impl DomainRecord for Widget {
    fn collection(&self) -> &'static str {
        "widgets"
    }

    fn key(&self) -> i64 {
        self.id
    }

    fn snapshot(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn insert_query(&self) -> Query<'static, Postgres, PgArguments> {
        sqlx::query("INSERT INTO widgets (id, name, price) VALUES ($1, $2, $3)")
            .bind(self.id)
            .bind(self.name.clone())
            .bind(self.price)
    }
}

impl OutboxEvent for Widget {
    const EVENT_TYPE: &'static str = "CREATE_WIDGET";

    fn entity_id(&self) -> String {
        self.id.to_string()
    }
}

struct Harness {
    store: Arc<InMemoryOutboxStore>,
    broker: InMemoryBroker,
    clock: ManualClock,
    dispatcher: Dispatcher,
}

impl Harness {
    fn new(config: DispatcherConfig) -> Self {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = InMemoryBroker::new("widgets");
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 2, 9, 15, 0).unwrap());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Publisher::new(Arc::new(broker.clone())),
            EventRegistry::new().register::<Widget>(),
            config,
        )
        .unwrap()
        .with_clock(Arc::new(clock.clone()));

        Self {
            store,
            broker,
            clock,
            dispatcher,
        }
    }

    /// Create a widget through the dual-write path
    async fn create(&self, id: i64) -> (Widget, EventRecord) {
        let widget = Widget {
            id,
            name: format!("widget-{id}"),
            price: 9.99,
        };
        let now = self.clock.now();
        let event = EventRecord::for_event(
            self.dispatcher.config().partitioner.key_for(now),
            &widget,
            now,
        )
        .unwrap();
        self.store.atomic_dual_write(&widget, &event).await.unwrap();
        (widget, event)
    }
}

#[test_log::test(tokio::test)]
async fn test_created_entity_is_published_and_removed() {
    let h = Harness::new(DispatcherConfig::default());
    let (widget, event) = h.create(42).await;
    assert_eq!(h.store.pending_count(), 1);

    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(report.deleted, 1);

    let delivered = h.broker.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message.key, "CREATE_WIDGET:42");
    assert_eq!(
        delivered[0].message.properties.get("event_type").map(String::as_str),
        Some("CREATE_WIDGET")
    );
    let published: Widget = serde_json::from_slice(&delivered[0].message.payload).unwrap();
    assert_eq!(published, widget);

    let rescanned = h.store.scan_pending(&event.partition_key).await.unwrap();
    assert!(rescanned.iter().all(|r| r.id != event.id));
    assert!(h.store.fetch_domain("widgets", 42).await.unwrap().is_some());
}

#[test_log::test(tokio::test)]
async fn test_failed_dual_write_leaves_no_trace() {
    let h = Harness::new(DispatcherConfig::default());
    h.store.fail_next_writes(1);

    let widget = Widget {
        id: 1,
        name: "w".into(),
        price: 1.0,
    };
    let now = h.clock.now();
    let event = EventRecord::for_event(PartitionKey::from("2024-05-02"), &widget, now).unwrap();
    assert!(h.store.atomic_dual_write(&widget, &event).await.is_err());

    assert_eq!(h.store.domain_count(), 0);
    assert_eq!(h.store.pending_count(), 0);
    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.scanned, 0);
}

#[test_log::test(tokio::test)]
async fn test_publish_failure_retried_next_cycle() {
    let h = Harness::new(DispatcherConfig::default());
    h.create(1).await;
    h.broker.reject_next(1);

    let first = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(first.publish_failures, 1);
    assert_eq!(h.store.pending_count(), 1);

    let second = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(second.published, 1);
    assert_eq!(second.delete_failures, 0);

    assert_eq!(h.broker.delivered().len(), 1);
    assert_eq!(h.store.pending_count(), 0);
    assert_eq!(h.store.delete_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_delete_failure_causes_duplicate_publish() {
    let h = Harness::new(DispatcherConfig::default());
    h.create(7).await;
    h.store.fail_next_deletes(1);

    let first = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(first.published, 1);
    assert_eq!(first.delete_failures, 1);
    assert_eq!(h.store.pending_count(), 1);

    let second = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(second.deleted, 1);

    // At-least-once: the consumer sees the same key twice.
    assert_eq!(h.broker.delivered_with_key("CREATE_WIDGET:7").len(), 2);
    assert_eq!(h.store.pending_count(), 0);
    assert_eq!(h.store.delete_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_malformed_record_does_not_block_others() {
    let h = Harness::new(DispatcherConfig::default());
    h.create(1).await;
    let now = h.clock.now();
    h.store.insert_record(EventRecord::from_parts(
        Uuid::now_v7(),
        h.dispatcher.config().partitioner.key_for(now),
        "CREATE_WIDGET",
        b"{ truncated".to_vec(),
        now,
    ));
    h.create(2).await;

    let report = h.dispatcher.run_cycle().await.unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.permanent_failures, 1);
    assert_eq!(report.deleted, 2);
    assert_eq!(h.store.pending_count(), 1);
    let keys: Vec<_> = h
        .broker
        .delivered()
        .into_iter()
        .map(|d| d.message.key)
        .collect();
    assert_eq!(keys, vec!["CREATE_WIDGET:1", "CREATE_WIDGET:2"]);
}

#[test_log::test(tokio::test)]
async fn test_lookback_delivers_yesterdays_leftovers() {
    let h = Harness::new(DispatcherConfig::new().with_lookback(1));
    h.create(1).await;
    h.clock.advance(ChronoDuration::days(1));

    let report = h.dispatcher.run_cycle().await.unwrap();

    assert_eq!(report.partitions, 2);
    assert_eq!(report.deleted, 1);
    assert_eq!(h.store.pending_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_without_lookback_leftovers_are_stranded() {
    let h = Harness::new(DispatcherConfig::new().with_lookback(0));
    h.create(1).await;
    h.clock.advance(ChronoDuration::days(1));

    let report = h.dispatcher.run_cycle().await.unwrap();

    assert_eq!(report.partitions, 1);
    assert_eq!(report.scanned, 0);
    assert_eq!(h.store.pending_count(), 1);
    assert!(h.broker.delivered().is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_publish_deadline_keeps_record() {
    let h = Harness::new(DispatcherConfig::new().with_publish_timeout(Duration::from_secs(1)));
    h.broker.set_ack_delay(Some(Duration::from_secs(10)));
    h.create(3).await;

    let report = h.dispatcher.run_cycle().await.unwrap();

    assert_eq!(report.publish_failures, 1);
    assert_eq!(report.deleted, 0);
    assert_eq!(h.store.pending_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_scan_failure_is_retried_next_cycle() {
    let h = Harness::new(DispatcherConfig::default());
    h.create(5).await;
    h.store.fail_next_scans(1);

    assert!(h.dispatcher.run_cycle().await.is_err());
    let report = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.deleted, 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_scheduler_drains_and_stops() {
    let h = Harness::new(DispatcherConfig::default());
    h.create(1).await;
    h.create(2).await;
    let store = h.store.clone();
    let broker = h.broker.clone();

    let scheduler = Scheduler::new(
        Arc::new(h.dispatcher),
        SchedulerConfig::new().with_interval(Duration::from_millis(100)),
    );
    scheduler.start().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler.stop().await;

    assert_eq!(broker.delivered().len(), 2);
    assert_eq!(store.pending_count(), 0);
}
