//! In-process broker for tests and local development

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::info;

use super::producer::{
    BrokerError, BrokerProducer, MessageId, OutboundMessage, ReceiptSender, SendReceipt,
};

/// A message the in-memory broker accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub message_id: MessageId,
    pub message: OutboundMessage,
}

struct BrokerState {
    topic: String,
    delivered: Mutex<Vec<DeliveredMessage>>,
    next_sequence: AtomicU64,
    reject_budget: AtomicU32,
    ack_delay: RwLock<Option<Duration>>,
    closed: AtomicBool,
    log_messages: bool,
}

impl BrokerState {
    fn accept(&self, message: OutboundMessage) -> MessageId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let message_id = MessageId(format!("{}:{}", self.topic, sequence));
        if self.log_messages {
            info!(
                topic = %self.topic,
                key = %message.key,
                %message_id,
                bytes = message.payload.len(),
                "message delivered"
            );
        }
        self.delivered.lock().push(DeliveredMessage {
            message_id: message_id.clone(),
            message,
        });
        message_id
    }
}

/// Broker that keeps every accepted message in memory
///
/// Clones share the same message log. Rejections and acknowledgment latency
/// can be injected to exercise the relay's retry paths.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self::build(topic.into(), false)
    }

    /// Broker that also logs every delivered message
    pub fn logging(topic: impl Into<String>) -> Self {
        Self::build(topic.into(), true)
    }

    fn build(topic: String, log_messages: bool) -> Self {
        Self {
            state: Arc::new(BrokerState {
                topic,
                delivered: Mutex::new(Vec::new()),
                next_sequence: AtomicU64::new(0),
                reject_budget: AtomicU32::new(0),
                ack_delay: RwLock::new(None),
                closed: AtomicBool::new(false),
                log_messages,
            }),
        }
    }

    /// Reject the next `count` sends
    pub fn reject_next(&self, count: u32) {
        self.state.reject_budget.store(count, Ordering::SeqCst);
    }

    /// Delay every acknowledgment by `delay` (the message is still accepted)
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        *self.state.ack_delay.write() = delay;
    }

    /// Messages accepted so far, in acceptance order
    pub fn delivered(&self) -> Vec<DeliveredMessage> {
        self.state.delivered.lock().clone()
    }

    /// Messages accepted under `key`
    pub fn delivered_with_key(&self, key: &str) -> Vec<DeliveredMessage> {
        self.state
            .delivered
            .lock()
            .iter()
            .filter(|d| d.message.key == key)
            .cloned()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn take_rejection(&self) -> bool {
        self.state
            .reject_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn deliver_later(&self, sender: ReceiptSender, message: OutboundMessage, delay: Duration) {
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let message_id = state.accept(message);
            sender.complete(Ok(message_id));
        });
    }
}

#[async_trait]
impl BrokerProducer for InMemoryBroker {
    fn topic(&self) -> &str {
        &self.state.topic
    }

    fn send_async(&self, message: OutboundMessage) -> SendReceipt {
        if self.is_closed() {
            return SendReceipt::ready(Err(BrokerError::Closed));
        }
        if self.take_rejection() {
            return SendReceipt::ready(Err(BrokerError::Rejected(
                "injected rejection".to_string(),
            )));
        }

        let delay = *self.state.ack_delay.read();
        match delay {
            Some(delay) => {
                let (sender, receipt) = SendReceipt::channel();
                self.deliver_later(sender, message, delay);
                receipt
            }
            None => SendReceipt::ready(Ok(self.state.accept(message))),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
