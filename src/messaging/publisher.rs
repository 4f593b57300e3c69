//! Event Publisher
//!
//! Serializes events and hands them to the topic exchange, routed by event
//! type. Publishing is a best-effort notification: callers decide whether to
//! retry a rejected publish.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::connection::{ChannelPurpose, ConnectionManager};
use super::headers::event_properties;
use crate::broker::{BrokerChannel, BrokerError, ExchangeKind};
use crate::domain::Event;
use crate::error::{MessagingError, MessagingResult};

/// Publishes events on the connection's publisher channel
pub struct Publisher {
    connection: ConnectionManager,
    exchange: String,
    /// Channel on which the exchange was last declared
    declared: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl Publisher {
    pub fn new(connection: ConnectionManager, exchange: impl Into<String>) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
            declared: Mutex::new(None),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish one event with its type as routing key
    pub async fn publish(&self, event: &Event) -> MessagingResult<()> {
        event.validate()?;
        let channel = self.ensure_channel().await?;
        self.send(channel.as_ref(), event).await
    }

    /// Publish events in order on one channel, stopping at the first failure.
    ///
    /// Not transactional: events before the failing index may already have
    /// reached consumers.
    pub async fn publish_batch(&self, events: &[Event]) -> MessagingResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let channel = self.ensure_channel().await?;
        for (index, event) in events.iter().enumerate() {
            let result = match event.validate() {
                Ok(()) => self.send(channel.as_ref(), event).await,
                Err(e) => Err(e),
            };

            if let Err(source) = result {
                tracing::warn!(
                    index,
                    batch_size = events.len(),
                    event_id = %event.id(),
                    "Batch publish stopped"
                );
                return Err(MessagingError::BatchPublishFailed {
                    index,
                    event_id: event.id().to_string(),
                    source: Box::new(source),
                });
            }
        }

        tracing::debug!(count = events.len(), exchange = %self.exchange, "Published event batch");
        Ok(())
    }

    /// Close the publisher channel. Failures are logged.
    pub async fn close(&self) {
        let channel = self.declared.lock().await.take();
        if let Some(channel) = channel {
            match channel.close().await {
                Ok(()) => tracing::debug!("Publisher channel closed"),
                Err(e) => tracing::warn!(error = %e, "Failed to close publisher channel"),
            }
        }
    }

    /// Publisher channel, declaring the exchange whenever the channel is new
    async fn ensure_channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel(ChannelPurpose::Publisher).await?;

        let mut declared = self.declared.lock().await;
        if !declared.as_ref().is_some_and(|c| Arc::ptr_eq(c, &channel)) {
            channel
                .declare_exchange(&self.exchange, ExchangeKind::Topic, true)
                .await?;
            tracing::info!(exchange = %self.exchange, "Declared event exchange");
            *declared = Some(channel.clone());
        }

        Ok(channel)
    }

    async fn send(&self, channel: &dyn BrokerChannel, event: &Event) -> MessagingResult<()> {
        let body = event.to_wire()?;
        let properties = event_properties(event);

        match channel
            .publish(&self.exchange, event.event_type(), &body, &properties)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    exchange = %self.exchange,
                    "Published event"
                );
                Ok(())
            }
            Err(BrokerError::BufferFull) => {
                tracing::warn!(
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    "Broker rejected publish: outbound buffer full"
                );
                Err(MessagingError::PublishRejected {
                    event_id: event.id().to_string(),
                    event_type: event.event_type().to_string(),
                })
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    error = %e,
                    "Failed to publish event"
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, QueueArguments};
    use crate::config::ConnectionConfig;
    use crate::messaging::headers::HEADER_VERSION;
    use serde_json::json;

    const EXCHANGE: &str = "test.events";

    fn setup() -> (MemoryBroker, ConnectionManager, Publisher) {
        let broker = MemoryBroker::new();
        let connection = ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionConfig {
                reconnect_attempts: 0,
                ..ConnectionConfig::default()
            },
        );
        let publisher = Publisher::new(connection.clone(), EXCHANGE);
        (broker, connection, publisher)
    }

    /// Bind a plain queue to the exchange so published messages can be inspected
    async fn tap(connection: &ConnectionManager, queue: &str, pattern: &str) {
        let channel = connection.create_channel(ChannelPurpose::Consumer).await.unwrap();
        channel.declare_exchange(EXCHANGE, ExchangeKind::Topic, true).await.unwrap();
        channel.declare_queue(queue, true, &QueueArguments::default()).await.unwrap();
        channel.bind_queue(queue, EXCHANGE, pattern).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_declares_exchange_and_routes_by_type() {
        let (broker, connection, publisher) = setup();
        tap(&connection, "movements", "movement.*").await;

        let event = Event::new("movement.created", json!({"amount": "10.00"})).with_correlation_id("req-9");
        publisher.publish(&event).await.unwrap();

        assert_eq!(broker.exchange_kind(EXCHANGE), Some(ExchangeKind::Topic));
        let history = broker.history("movements");
        assert_eq!(history.len(), 1);

        let message = &history[0];
        assert_eq!(message.routing_key, "movement.created");
        assert!(message.properties.persistent);
        assert_eq!(message.properties.message_id.as_deref(), Some(event.id()));
        assert_eq!(message.properties.kind.as_deref(), Some("movement.created"));
        assert_eq!(message.properties.correlation_id.as_deref(), Some("req-9"));
        assert!(message.header(HEADER_VERSION).is_some());

        let decoded = Event::from_wire(&message.body).unwrap();
        assert_eq!(decoded.id(), event.id());
        assert_eq!(decoded.timestamp(), event.timestamp());
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcard_type() {
        let (broker, _connection, publisher) = setup();

        let err = publisher
            .publish(&Event::new("movement.*", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, MessagingError::InvalidEventType { .. }));
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_buffer_full_is_publish_rejected() {
        let (broker, _connection, publisher) = setup();
        publisher.publish(&Event::new("account.created", json!({}))).await.unwrap();

        broker.reject_next_publishes(1);
        let event = Event::new("account.created", json!({}));
        let err = publisher.publish(&event).await.unwrap_err();

        assert!(matches!(&err, MessagingError::PublishRejected { event_id, .. } if event_id == event.id()));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (broker, _connection, publisher) = setup();
        publisher.publish_batch(&[]).await.unwrap();
        assert_eq!(broker.open_connection_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_in_order() {
        let (broker, connection, publisher) = setup();
        tap(&connection, "all", "#").await;

        let events: Vec<Event> = (0..3)
            .map(|i| Event::new("ledger_entry.created", json!({"seq": i})))
            .collect();
        publisher.publish_batch(&events).await.unwrap();

        let ids: Vec<String> = broker
            .history("all")
            .iter()
            .filter_map(|m| m.properties.message_id.clone())
            .collect();
        let expected: Vec<String> = events.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_exchange_redeclared_on_new_channel() {
        let (broker, connection, publisher) = setup();
        publisher.publish(&Event::new("account.created", json!({}))).await.unwrap();

        let channel = connection.create_channel(ChannelPurpose::Publisher).await.unwrap();
        channel.close().await.unwrap();

        publisher.publish(&Event::new("account.created", json!({}))).await.unwrap();
        assert!(broker.exchange_exists(EXCHANGE));
    }

    #[tokio::test]
    async fn test_close_is_quiet() {
        let (broker, _connection, publisher) = setup();
        publisher.close().await;

        publisher.publish(&Event::new("account.created", json!({}))).await.unwrap();
        publisher.close().await;
        publisher.close().await;
        assert_eq!(broker.open_channel_count(), 0);
    }
}
