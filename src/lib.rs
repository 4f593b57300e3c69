//! ledger_events Library
//!
//! Event messaging layer for the ledger backend: domain events are published
//! to a topic exchange and consumed with broker-native retry and dead-letter
//! handling.

pub mod broker;
pub mod config;
pub mod domain;
pub mod handlers;
pub mod messaging;

mod error;

pub use config::{Config, ConfigError, ConnectionConfig};
pub use error::{MessagingError, MessagingResult};
pub use domain::{Event, EVENT_SCHEMA_VERSION};
pub use messaging::{EventHandler, EventManager, RetryBackoff, SubscribeOptions};
