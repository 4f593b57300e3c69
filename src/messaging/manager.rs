//! Event Manager
//!
//! Facade composing the connection manager, publisher and consumer with the
//! manager-wide policy from [`Config`]. Construct one per process, call
//! [`EventManager::initialize`] at startup (or let the first operation do it)
//! and [`EventManager::shutdown`] on exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::connection::ConnectionManager;
use super::consumer::{Consumer, RegistrationInfo};
use super::handler::EventHandler;
use super::options::{ConsumerDefaults, SubscribeOptions};
use super::publisher::Publisher;
use crate::broker::{AmqpBroker, Broker};
use crate::config::Config;
use crate::domain::Event;
use crate::error::MessagingResult;

pub struct EventManager {
    config: Config,
    connection: ConnectionManager,
    publisher: Arc<Publisher>,
    consumer: Consumer,
    initialized: AtomicBool,
}

impl EventManager {
    pub fn new(broker: Arc<dyn Broker>, config: Config) -> Self {
        let connection = ConnectionManager::new(broker, config.connection.clone());
        let publisher = Arc::new(Publisher::new(connection.clone(), config.exchange.clone()));

        let defaults = ConsumerDefaults {
            exchange: config.exchange.clone(),
            prefetch: config.prefetch,
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay,
            backoff: config.retry_backoff,
        };
        let consumer = Consumer::new(connection.clone(), defaults);

        Self {
            config,
            connection,
            publisher,
            consumer,
            initialized: AtomicBool::new(false),
        }
    }

    /// Manager backed by RabbitMQ
    pub fn amqp(config: Config) -> Self {
        Self::new(Arc::new(AmqpBroker::new()), config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared publisher, e.g. for compensating handlers
    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Open the broker connection. Idempotent.
    pub async fn initialize(&self) -> MessagingResult<()> {
        self.connection.connect().await?;
        if !self.initialized.swap(true, Ordering::AcqRel) {
            tracing::info!(
                exchange = %self.config.exchange,
                retry_enabled = self.config.retry_enabled,
                environment = %self.config.environment,
                "Event manager initialized"
            );
        }
        Ok(())
    }

    pub async fn publish(&self, event: &Event) -> MessagingResult<()> {
        self.initialize().await?;
        self.publisher.publish(event).await
    }

    pub async fn publish_batch(&self, events: &[Event]) -> MessagingResult<()> {
        self.initialize().await?;
        self.publisher.publish_batch(events).await
    }

    /// Subscribe `handler` to `event_type`.
    ///
    /// Options left unset take the manager defaults. With retry disabled the
    /// retry budget is forced to zero, so a single failure dead-letters.
    pub async fn subscribe<H>(&self, event_type: &str, handler: H, options: SubscribeOptions) -> MessagingResult<()>
    where
        H: EventHandler + 'static,
    {
        self.initialize().await?;

        let options = if self.config.retry_enabled {
            options
        } else {
            options.retry_attempts(0)
        };
        self.consumer.subscribe(event_type, handler, options).await
    }

    pub async fn set_dead_letter_handler<H>(&self, event_type: &str, handler: H) -> MessagingResult<()>
    where
        H: EventHandler + 'static,
    {
        self.consumer.set_dead_letter_handler(event_type, handler).await
    }

    pub async fn start_consumer(&self) -> MessagingResult<()> {
        self.initialize().await?;
        self.consumer.start().await
    }

    pub async fn stop_consumer(&self) -> MessagingResult<()> {
        self.consumer.stop().await
    }

    pub async fn registrations(&self) -> Vec<RegistrationInfo> {
        self.consumer.registrations().await
    }

    /// Stop consuming, close the publisher, then the connection. Every step
    /// runs even if an earlier one failed.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down event manager");

        if let Err(e) = self.consumer.stop().await {
            tracing::error!(error = %e, "Failed to stop consumer");
        }

        self.publisher.close().await;

        if let Err(e) = self.connection.close().await {
            tracing::error!(error = %e, "Failed to close broker connection");
        }

        self.initialized.store(false, Ordering::Release);
        tracing::info!("Event manager shut down");
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}
