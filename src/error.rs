//! Error handling module
//!
//! Centralized error types for the messaging layer.

use crate::broker::BrokerError;

/// Messaging Result type
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Errors surfaced by the messaging layer
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Transport failure (connect, channel, declare, ack)
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The broker refused the message because its outbound buffer is full
    #[error("Publish rejected for event {event_id} ({event_type}): broker buffer full")]
    PublishRejected { event_id: String, event_type: String },

    /// An element of a batch failed; elements before `index` may already be delivered
    #[error("Batch publish failed at index {index} (event {event_id}): {source}")]
    BatchPublishFailed {
        index: usize,
        event_id: String,
        #[source]
        source: Box<MessagingError>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message body could not be parsed as an event
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid event type {event_type:?}: {reason}")]
    InvalidEventType { event_type: String, reason: String },

    /// No subscription exists for the event type
    #[error("No subscription registered for event type: {0}")]
    NotSubscribed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl MessagingError {
    /// Check if retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            MessagingError::Broker(e) => e.is_transient(),
            MessagingError::PublishRejected { .. } => true,
            MessagingError::BatchPublishFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
