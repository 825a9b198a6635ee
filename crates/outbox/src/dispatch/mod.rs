//! Relay side of the outbox
//!
//! This module provides:
//! - [`EventRegistry`] mapping event tags to decode+route functions
//! - [`Dispatcher`] running one scan/publish/delete cycle
//! - [`Scheduler`] driving the dispatcher on a fixed interval

mod dispatcher;
mod registry;
mod scheduler;

pub use dispatcher::{CycleReport, DispatchError, Dispatcher, DispatcherConfig};
pub use registry::{ordering_key, EventRegistry, EventRouter, RouteError, RoutedEvent};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError};
