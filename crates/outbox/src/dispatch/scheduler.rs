//! Fixed-interval driver for the dispatcher
//!
//! Runs [`Dispatcher::run_cycle`] on a dedicated task until stopped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};

use super::dispatcher::{CycleReport, DispatchError, Dispatcher};

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Time between cycle starts
    #[serde(with = "crate::duration_millis")]
    pub interval: Duration,

    /// How long `stop` waits for an in-flight cycle before cancelling it
    #[serde(with = "crate::duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("scheduler interval must be greater than zero")]
    ZeroInterval,
}

/// Drives a [`Dispatcher`] on a fixed interval
///
/// # Example
///
/// ```ignore
/// let scheduler = Scheduler::new(Arc::new(dispatcher), SchedulerConfig::default());
/// scheduler.start()?;
///
/// // ... later, graceful shutdown
/// scheduler.stop().await;
/// ```
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            dispatcher,
            config,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Spawn the dispatch loop
    ///
    /// The first cycle starts immediately. A dispatcher cancelled by an
    /// earlier `stop` gets a fresh token.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.config.interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }

        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.dispatcher.reset_cancellation();
        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let dispatcher = self.dispatcher.clone();
        let interval = self.config.interval;

        info!(
            interval_ms = interval.as_millis() as u64,
            "Starting outbox scheduler"
        );
        *handle = Some(tokio::spawn(dispatch_loop(dispatcher, interval, shutdown_rx)));
        Ok(())
    }

    /// Stop the dispatch loop
    ///
    /// No new cycle starts after this is called. A cycle already running is
    /// given `shutdown_timeout` to finish; after that its publishes are
    /// cancelled. Stopping a scheduler that is not running does nothing.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(mut handle) = self.handle.lock().take() else {
            return;
        };

        info!("Stopping outbox scheduler");
        self.shutdown_tx.send_replace(true);

        if tokio::time::timeout(self.config.shutdown_timeout, &mut handle)
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                "In-flight cycle did not finish in time, cancelling publishes"
            );
            self.dispatcher.cancellation().cancel();
            if let Err(e) = handle.await {
                error!("Dispatch loop ended abnormally: {}", e);
            }
        }

        info!("Outbox scheduler stopped");
    }

    /// Run one cycle on the caller's task
    pub async fn run_once(&self) -> Result<CycleReport, DispatchError> {
        self.dispatcher.reset_cancellation();
        self.dispatcher.run_cycle().await
    }
}

async fn dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => {
                debug!("Dispatch loop: shutdown requested");
                break;
            }
        }
        if *shutdown_rx.borrow() {
            break;
        }

        match dispatcher.run_cycle().await {
            Ok(report) => trace!(?report, "Cycle finished"),
            Err(e) => warn!(error = %e, "Dispatch cycle failed, retrying next tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatcherConfig, EventRegistry};
    use crate::persistence::InMemoryOutboxStore;
    use crate::publisher::{InMemoryBroker, Publisher};
    use crate::record::{EventRecord, OutboxEvent, Partitioner};
    use chrono::Utc;

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick {
        id: i64,
    }

    impl OutboxEvent for Tick {
        const EVENT_TYPE: &'static str = "TICK";

        fn entity_id(&self) -> String {
            self.id.to_string()
        }
    }

    fn setup(
        dispatcher_config: DispatcherConfig,
        config: SchedulerConfig,
    ) -> (Scheduler, Arc<InMemoryOutboxStore>, InMemoryBroker) {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = InMemoryBroker::new("ticks");
        let dispatcher = Dispatcher::new(
            store.clone(),
            Publisher::new(Arc::new(broker.clone())),
            EventRegistry::new().register::<Tick>(),
            dispatcher_config,
        )
        .unwrap();
        (Scheduler::new(Arc::new(dispatcher), config), store, broker)
    }

    fn enqueue(store: &InMemoryOutboxStore, id: i64) {
        let now = Utc::now();
        let record =
            EventRecord::for_event(Partitioner::default().key_for(now), &Tick { id }, now).unwrap();
        store.insert_record(record);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_drain_outbox() {
        let (scheduler, store, broker) =
            setup(DispatcherConfig::default(), SchedulerConfig::default());
        enqueue(&store, 1);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.delivered().len(), 1);

        enqueue(&store, 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.delivered().len(), 2);
        assert_eq!(store.pending_count(), 0);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails() {
        let (scheduler, _, _) = setup(DispatcherConfig::default(), SchedulerConfig::default());
        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::AlreadyRunning)
        ));
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let (scheduler, _, _) = setup(
            DispatcherConfig::default(),
            SchedulerConfig::new().with_interval(Duration::ZERO),
        );
        assert!(matches!(scheduler.start(), Err(SchedulerError::ZeroInterval)));
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let (scheduler, _, _) = setup(DispatcherConfig::default(), SchedulerConfig::default());
        scheduler.stop().await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_cycle_finish() {
        let (scheduler, store, broker) = setup(
            DispatcherConfig::new().with_publish_timeout(Duration::from_secs(10)),
            SchedulerConfig::default(),
        );
        broker.set_ack_delay(Some(Duration::from_secs(2)));
        enqueue(&store, 1);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broker.delivered().is_empty());

        scheduler.stop().await;
        assert_eq!(broker.delivered().len(), 1);
        assert_eq!(store.pending_count(), 0);

        enqueue(&store, 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.delivered().len(), 1);
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_cancels_publish() {
        let (scheduler, store, broker) = setup(
            DispatcherConfig::new().with_publish_timeout(Duration::from_secs(120)),
            SchedulerConfig::new().with_shutdown_timeout(Duration::from_secs(1)),
        );
        broker.set_ack_delay(Some(Duration::from_secs(60)));
        enqueue(&store, 1);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        scheduler.stop().await;
        assert!(scheduler.dispatcher().cancellation().is_cancelled());
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_cancelled_stop_publishes_again() {
        let (scheduler, store, broker) = setup(
            DispatcherConfig::new().with_publish_timeout(Duration::from_secs(120)),
            SchedulerConfig::new().with_shutdown_timeout(Duration::from_secs(1)),
        );
        broker.set_ack_delay(Some(Duration::from_secs(60)));
        enqueue(&store, 1);

        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;
        assert!(scheduler.dispatcher().cancellation().is_cancelled());

        broker.set_ack_delay(None);
        enqueue(&store, 2);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(!broker.delivered_with_key("TICK:2").is_empty());
        assert_eq!(store.pending_count(), 0);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_after_cancelled_stop() {
        let (scheduler, store, broker) = setup(
            DispatcherConfig::new().with_publish_timeout(Duration::from_secs(120)),
            SchedulerConfig::new().with_shutdown_timeout(Duration::from_secs(1)),
        );
        broker.set_ack_delay(Some(Duration::from_secs(60)));
        enqueue(&store, 1);
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;

        broker.set_ack_delay(None);
        let report = scheduler.run_once().await.unwrap();

        assert_eq!(report.published, 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_run_once() {
        let (scheduler, store, broker) =
            setup(DispatcherConfig::default(), SchedulerConfig::default());
        enqueue(&store, 1);

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(broker.delivered().len(), 1);
    }
}
