//! Messaging module
//!
//! Event publishing and consumption on top of the broker abstraction:
//! connection management, the publisher, the consumer with its retry and
//! dead-letter state machine, and the [`EventManager`] facade tying them
//! together.

mod connection;
mod consumer;
mod handler;
pub mod headers;
mod manager;
mod options;
mod publisher;

pub use connection::{ChannelPurpose, ConnectionManager, LinkState};
pub use consumer::{Consumer, ConsumerTags, RegistrationInfo};
pub use handler::EventHandler;
pub use manager::EventManager;
pub use options::{
    ConsumerDefaults, ConsumerOptions, RetryBackoff, SubscribeOptions, DEFAULT_PREFETCH,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_DELAY,
};
pub use publisher::Publisher;
