//! Event registry for type-erased routing
//!
//! The registry maps an event-type tag to a function that decodes the stored
//! payload into its concrete [`OutboxEvent`] type, re-serializes it into the
//! wire representation and derives the broker ordering key.

use std::collections::HashMap;
use std::fmt;

use crate::record::{EventRecord, OutboxEvent};

/// Routing errors
///
/// All of these are permanent for the record: retrying the same bytes gives
/// the same answer.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No event type registered under this tag
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// Stored payload does not decode as the registered type
    #[error("cannot decode {event_type} payload: {source}")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// Decoded event could not be re-serialized
    #[error("cannot encode {event_type} payload: {source}")]
    Encode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// An event ready to hand to the publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedEvent {
    /// Broker ordering key, `"<eventType>:<entityId>"`
    pub key: String,
    pub event_type: String,
    /// Wire representation of the event
    pub payload: Vec<u8>,
}

/// Decode+route function registered for one tag
pub type EventRouter = Box<dyn Fn(&[u8]) -> Result<RoutedEvent, RouteError> + Send + Sync>;

/// Build the broker ordering key for an event
pub fn ordering_key<E: OutboxEvent>(event: &E) -> String {
    format!("{}:{}", E::EVENT_TYPE, event.entity_id())
}

/// Registry of routable event types
pub struct EventRegistry {
    routers: HashMap<&'static str, EventRouter>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            routers: HashMap::new(),
        }
    }

    /// Register an event type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let registry = EventRegistry::new().register::<ProductCreated>();
    /// ```
    pub fn register<E: OutboxEvent>(mut self) -> Self {
        let router: EventRouter = Box::new(|payload: &[u8]| {
            let event: E = serde_json::from_slice(payload).map_err(|source| RouteError::Decode {
                event_type: E::EVENT_TYPE.to_string(),
                source,
            })?;
            let payload = serde_json::to_vec(&event).map_err(|source| RouteError::Encode {
                event_type: E::EVENT_TYPE.to_string(),
                source,
            })?;

            Ok(RoutedEvent {
                key: ordering_key(&event),
                event_type: E::EVENT_TYPE.to_string(),
                payload,
            })
        });

        self.routers.insert(E::EVENT_TYPE, router);
        self
    }

    /// Decode and route one record
    pub fn route(&self, record: &EventRecord) -> Result<RoutedEvent, RouteError> {
        let router = self
            .routers
            .get(record.event_type.as_str())
            .ok_or_else(|| RouteError::UnknownEventType(record.event_type.clone()))?;
        router(&record.payload)
    }

    /// Check if a tag is registered
    pub fn knows(&self, event_type: &str) -> bool {
        self.routers.contains_key(event_type)
    }

    /// Registered tags, sorted
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.routers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
