//! Broker producer boundary
//!
//! A [`BrokerProducer`] accepts a message and immediately returns a
//! [`SendReceipt`]. The receipt resolves exactly once, when the broker client
//! acknowledges or fails the send. The producer side holds the matching
//! [`ReceiptSender`], which is consumed when completed.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Broker-assigned identifier of an acknowledged message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Ordering/partitioning key
    pub key: String,
    pub payload: Vec<u8>,
    pub properties: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Failure reported by the broker client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Broker refused the message
    #[error("broker rejected message: {0}")]
    Rejected(String),

    /// Broker could not be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Producer was closed before the send
    #[error("producer is closed")]
    Closed,
}

/// Outcome carried by a receipt
pub type SendOutcome = Result<MessageId, BrokerError>;

/// Producer half of a send receipt
#[derive(Debug)]
pub struct ReceiptSender {
    tx: oneshot::Sender<SendOutcome>,
}

impl ReceiptSender {
    /// Resolve the receipt.
    ///
    /// If the waiting side already gave up the outcome is discarded.
    pub fn complete(self, outcome: SendOutcome) {
        let _ = self.tx.send(outcome);
    }

    /// Whether the waiting side has dropped its receipt
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Single-shot handle to the outcome of one send
#[derive(Debug)]
pub struct SendReceipt {
    rx: oneshot::Receiver<SendOutcome>,
}

/// The receipt resolved without an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("producer dropped the receipt without completing it")]
pub struct ReceiptDropped;

impl SendReceipt {
    /// Create a connected sender/receipt pair
    pub fn channel() -> (ReceiptSender, SendReceipt) {
        let (tx, rx) = oneshot::channel();
        (ReceiptSender { tx }, SendReceipt { rx })
    }

    /// A receipt that is already resolved
    pub fn ready(outcome: SendOutcome) -> Self {
        let (sender, receipt) = Self::channel();
        sender.complete(outcome);
        receipt
    }

    /// Wait for the outcome
    pub async fn wait(self) -> Result<SendOutcome, ReceiptDropped> {
        self.rx.await.map_err(|_| ReceiptDropped)
    }
}

/// External broker producer
///
/// Implementations must be safe to share between tasks.
#[async_trait]
pub trait BrokerProducer: Send + Sync + 'static {
    /// Topic messages are published to
    fn topic(&self) -> &str;

    /// Submit a message for asynchronous transmission
    fn send_async(&self, message: OutboundMessage) -> SendReceipt;

    /// Flush outstanding sends and release the producer
    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
