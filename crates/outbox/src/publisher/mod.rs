//! Publishing outbox events to the message broker

mod memory;
mod producer;
#[allow(clippy::module_inception)]
mod publisher;
mod rest;

pub use memory::{DeliveredMessage, InMemoryBroker};
pub use producer::{
    BrokerError, BrokerProducer, MessageId, OutboundMessage, ReceiptDropped, ReceiptSender,
    SendOutcome, SendReceipt,
};
pub use publisher::{CancelCause, PublishError, Publisher, EVENT_TYPE_PROPERTY};
pub use rest::RestProducer;
