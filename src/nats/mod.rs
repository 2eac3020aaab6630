//! Pub/sub transport
//!
//! Live status and notification events. NATS in production, a local
//! broadcast channel in development and tests.

pub mod bus;
pub mod client;
pub mod subjects;

pub use bus::{BusMessage, EventBus, LocalBus, Publisher};
pub use client::NatsClient;
pub use subjects::{StatusEntity, StatusEvent, Subjects, TaskAvailable, DEFAULT_SUBJECT_PREFIX};
