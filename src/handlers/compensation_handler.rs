//! Movement Compensation Handler
//!
//! Dead-letter handler for `movement.created`: a movement whose downstream
//! processing failed for good is announced as cancelled, so that consumers
//! of `movement.cancelled` can roll back whatever they already applied.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;

use crate::domain::{Event, LedgerPayload, MovementCancelled, MovementCreated};
use crate::messaging::{EventHandler, Publisher};

const DEFAULT_REASON: &str = "movement processing failed after all retries";

/// Publishes `movement.cancelled` for dead-lettered `movement.created` events
pub struct MovementCompensationHandler {
    publisher: Arc<Publisher>,
    reason: String,
}

impl MovementCompensationHandler {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self {
            publisher,
            reason: DEFAULT_REASON.to_string(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

#[async_trait]
impl EventHandler for MovementCompensationHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let movement: MovementCreated = event
            .payload()
            .with_context(|| format!("event {} is not a movement.created payload", event.id()))?;

        let cancelled = MovementCancelled {
            movement_id: movement.movement_id,
            account_id: movement.account_id,
            reason: self.reason.clone(),
            cancelled_at: Utc::now(),
        }
        .into_event()?
        .with_correlation_id(event.correlation_id().unwrap_or(event.id()));

        self.publisher
            .publish(&cancelled)
            .await
            .context("failed to publish movement.cancelled")?;

        tracing::warn!(
            movement_id = %movement.movement_id,
            account_id = %movement.account_id,
            source_event_id = %event.id(),
            cancel_event_id = %cancelled.id(),
            "Movement cancelled after dead-lettering"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ExchangeKind, MemoryBroker, QueueArguments};
    use crate::config::ConnectionConfig;
    use crate::domain::events::MOVEMENT_CANCELLED;
    use crate::domain::MovementKind;
    use crate::messaging::{ChannelPurpose, ConnectionManager};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn setup() -> (MemoryBroker, MovementCompensationHandler) {
        let broker = MemoryBroker::new();
        let connection = ConnectionManager::new(Arc::new(broker.clone()), ConnectionConfig::default());

        let channel = connection.create_channel(ChannelPurpose::Consumer).await.unwrap();
        channel.declare_exchange("ledger.events", ExchangeKind::Topic, true).await.unwrap();
        channel.declare_queue("cancellations", true, &QueueArguments::default()).await.unwrap();
        channel.bind_queue("cancellations", "ledger.events", MOVEMENT_CANCELLED).await.unwrap();

        let publisher = Arc::new(Publisher::new(connection, "ledger.events"));
        (broker, MovementCompensationHandler::new(publisher))
    }

    #[tokio::test]
    async fn test_publishes_cancellation() {
        let (broker, handler) = setup().await;
        let movement = MovementCreated {
            movement_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            kind: MovementKind::Credit,
            amount: dec!(40.00),
            description: Some("top-up".to_string()),
            created_at: Utc::now(),
        };
        let event = movement.into_event().unwrap();

        handler.handle(&event).await.unwrap();

        let history = broker.history("cancellations");
        assert_eq!(history.len(), 1);
        let cancelled = Event::from_wire(&history[0].body).unwrap();
        assert_eq!(cancelled.correlation_id(), Some(event.id()));

        let payload: MovementCancelled = cancelled.payload().unwrap();
        assert_eq!(payload.movement_id, movement.movement_id);
        assert_eq!(payload.reason, DEFAULT_REASON);
    }

    #[tokio::test]
    async fn test_rejects_foreign_payload() {
        let (broker, handler) = setup().await;
        let event = Event::new("movement.created", serde_json::json!({"unexpected": true}));

        assert!(handler.handle(&event).await.is_err());
        assert!(broker.history("cancellations").is_empty());
    }
}
