//! Publish-and-await over a broker producer

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::producer::{BrokerError, BrokerProducer, MessageId, OutboundMessage};

/// Property carrying the outbox event tag on every published message
pub const EVENT_TYPE_PROPERTY: &str = "event_type";

/// Why a publish stopped waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The per-publish deadline elapsed
    Deadline(Duration),
    /// The caller's cancellation token fired
    Cancelled,
}

/// Publish errors
///
/// Every variant means the message may or may not have reached the broker;
/// the outbox record must be kept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Broker reported a send failure
    #[error("publish failed: {0}")]
    Rejected(#[from] BrokerError),

    /// Gave up waiting before the broker answered
    #[error("publish canceled: {0:?}")]
    Canceled(CancelCause),

    /// Producer dropped the send without an outcome
    #[error("producer closed before acknowledging")]
    ProducerClosed,
}

/// Wraps a [`BrokerProducer`] with a blocking publish-and-await
///
/// # Example
///
/// ```ignore
/// let publisher = Publisher::new(producer);
/// let id = publisher
///     .publish_and_await("CREATE_PRODUCT:42", "CREATE_PRODUCT", payload, Duration::from_secs(5), &cancel)
///     .await?;
/// ```
#[derive(Clone)]
pub struct Publisher {
    producer: Arc<dyn BrokerProducer>,
}

impl Publisher {
    pub fn new(producer: Arc<dyn BrokerProducer>) -> Self {
        Self { producer }
    }

    pub fn producer(&self) -> &Arc<dyn BrokerProducer> {
        &self.producer
    }

    /// Submit `payload` under `key` and wait for the broker's answer.
    ///
    /// Returns as soon as one of these happens: the broker acknowledges, the
    /// broker fails the send, `deadline` elapses, or `cancel` fires. After a
    /// deadline or cancellation the send may still complete in the
    /// background; its outcome is dropped.
    #[instrument(skip(self, payload, cancel), fields(topic = %self.producer.topic()))]
    pub async fn publish_and_await(
        &self,
        key: &str,
        event_type: &str,
        payload: Vec<u8>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<MessageId, PublishError> {
        if cancel.is_cancelled() {
            return Err(PublishError::Canceled(CancelCause::Cancelled));
        }

        let message =
            OutboundMessage::new(key, payload).with_property(EVENT_TYPE_PROPERTY, event_type);
        let receipt = self.producer.send_async(message);

        tokio::select! {
            outcome = receipt.wait() => match outcome {
                Ok(Ok(message_id)) => {
                    debug!(%message_id, "broker acknowledged message");
                    Ok(message_id)
                }
                Ok(Err(e)) => Err(PublishError::Rejected(e)),
                Err(_) => Err(PublishError::ProducerClosed),
            },
            _ = tokio::time::sleep(deadline) => {
                warn!(deadline_ms = deadline.as_millis() as u64, "publish deadline elapsed");
                Err(PublishError::Canceled(CancelCause::Deadline(deadline)))
            }
            _ = cancel.cancelled() => {
                warn!("publish cancelled");
                Err(PublishError::Canceled(CancelCause::Cancelled))
            }
        }
    }
}
