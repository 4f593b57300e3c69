//! Broker Errors
//!
//! Transport-level failures reported by a broker implementation.

/// Errors that can occur while talking to the broker
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Could not establish or lost the connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation attempted on a closed channel
    #[error("Channel closed")]
    ChannelClosed,

    /// Outbound buffer is full; the message was not accepted
    #[error("Broker outbound buffer full")]
    BufferFull,

    /// Exchange or queue does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Declared entity conflicts with an existing one
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Any other protocol failure
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Check if the operation may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::ChannelClosed | BrokerError::BufferFull
        )
    }

    /// Check if the whole connection is gone, not just one channel or operation
    pub fn is_connection_level(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}
