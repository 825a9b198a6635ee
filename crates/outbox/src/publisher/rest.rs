//! Broker producer over an HTTP ingestion endpoint
//!
//! Each message is posted as JSON to `{endpoint}/topics/{topic}/messages`:
//!
//! ```json
//! { "key": "CREATE_PRODUCT:42", "payload": "<base64>", "properties": { "event_type": "CREATE_PRODUCT" } }
//! ```
//!
//! The broker answers `{ "message_id": "..." }` once the message is durable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::producer::{
    BrokerError, BrokerProducer, MessageId, OutboundMessage, SendOutcome, SendReceipt,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    key: &'a str,
    payload: String,
    properties: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct WireAck {
    message_id: String,
}

/// Producer that publishes through a broker's REST ingestion API
pub struct RestProducer {
    client: reqwest::Client,
    url: String,
    topic: String,
    token: Option<String>,
    request_timeout: Duration,
    close_timeout: Duration,
    in_flight: TaskTracker,
    closed: AtomicBool,
}

impl RestProducer {
    /// Create a producer for `topic` on the broker at `endpoint`
    pub fn new(
        endpoint: &str,
        topic: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, BrokerError> {
        let topic = topic.into();
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: format!("{}/topics/{}/messages", endpoint.trim_end_matches('/'), topic),
            topic,
            token,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            in_flight: TaskTracker::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Upper bound for one ingestion request, response included
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How long `close` waits for in-flight sends before abandoning them
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Ingestion URL messages are posted to
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, message: &OutboundMessage) -> reqwest::RequestBuilder {
        let body = WireMessage {
            key: &message.key,
            payload: base64::engine::general_purpose::STANDARD.encode(&message.payload),
            properties: &message.properties,
        };
        let request = self
            .client
            .post(&self.url)
            .timeout(self.request_timeout)
            .json(&body);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn deliver(request: reqwest::RequestBuilder) -> SendOutcome {
    let response = request.send().await.map_err(|e| {
        warn!("broker request failed: {}", e);
        BrokerError::Unavailable(e.to_string())
    })?;

    let status = response.status();
    if status.is_client_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(BrokerError::Rejected(format!("{status}: {body}")));
    }
    if !status.is_success() {
        return Err(BrokerError::Unavailable(format!("broker returned {status}")));
    }

    let ack: WireAck = response
        .json()
        .await
        .map_err(|e| BrokerError::Unavailable(format!("unreadable acknowledgment: {e}")))?;
    Ok(MessageId(ack.message_id))
}

#[async_trait]
impl BrokerProducer for RestProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn send_async(&self, message: OutboundMessage) -> SendReceipt {
        if self.closed.load(Ordering::SeqCst) {
            return SendReceipt::ready(Err(BrokerError::Closed));
        }

        let (sender, receipt) = SendReceipt::channel();
        let request = self.request(&message);
        let key = message.key;
        self.in_flight.spawn(async move {
            let outcome = deliver(request).await;
            if let Ok(message_id) = &outcome {
                debug!(%key, %message_id, "broker acknowledged");
            }
            sender.complete(outcome);
        });
        receipt
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.in_flight.close();
        info!(
            topic = %self.topic,
            in_flight = self.in_flight.len(),
            "Closing producer, waiting for in-flight sends"
        );
        if tokio::time::timeout(self.close_timeout, self.in_flight.wait())
            .await
            .is_err()
        {
            let abandoned = self.in_flight.len();
            warn!(
                topic = %self.topic,
                abandoned,
                "In-flight sends did not finish in time, abandoning them"
            );
            return Err(BrokerError::Unavailable(format!(
                "{abandoned} sends still in flight after {}ms",
                self.close_timeout.as_millis()
            )));
        }
        Ok(())
    }
}
