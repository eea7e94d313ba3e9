//! Routes Nostr events from a RabbitMQ fan-out to Expo push notifications.
//!
//! Subscribers register filters and push tokens by sending NIP-04 encrypted
//! control events addressed to the service key. Every other event on the
//! queue is matched against the registered filters and pushed to the
//! matching subscribers' devices.

pub mod bootstrap;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod observer;
pub mod push;
pub mod registry;
pub mod router;
pub mod service;
pub mod tools;

pub use config::Config;
pub use consumer::{AmqpConsumer, ConsumerState, QueueSettings};
pub use dispatch::NotificationDispatcher;
pub use observer::{Observation, Observer, TracingObserver};
pub use push::{ExpoClient, PushSender};
pub use registry::SubscriptionRegistry;
pub use service::{Handled, NotificationService, ProcessingError};
