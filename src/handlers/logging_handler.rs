//! Logging Handler
//!
//! Logs every event it receives. Used by the worker binary for event types
//! that have no application handler yet, and handy when tracing traffic.

use async_trait::async_trait;

use crate::domain::Event;
use crate::messaging::EventHandler;

/// Logs received events and always succeeds
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    name: String,
}

impl LoggingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for LoggingHandler {
    fn default() -> Self {
        Self::new("logging")
    }
}

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        tracing::info!(
            handler = %self.name,
            event_id = %event.id(),
            event_type = %event.event_type(),
            correlation_id = ?event.correlation_id(),
            timestamp = %event.timestamp(),
            "Event received"
        );
        tracing::debug!(handler = %self.name, event_id = %event.id(), data = %event.data(), "Event payload");
        Ok(())
    }
}
