//! Event Consumer
//!
//! Declares per-subscription topology and runs the retry / dead-letter state
//! machine. Every subscription owns three queues:
//!
//! - `<queue>`: bound to the topic exchange on the subscription's routing
//!   key; rejected messages dead-letter to `<queue>.dlq`;
//! - `<queue>.retry`: parking queue for failed messages, bound to the
//!   dead-letter exchange; expired messages go straight back to `<queue>`
//!   through the default exchange, so overlapping subscriptions never see
//!   another subscription's retries;
//! - `<queue>.dlq`: terminal queue, bound to the dead-letter exchange.
//!
//! Each queue gets its own worker; at most `prefetch` deliveries of a queue
//! are handled concurrently.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::connection::{ChannelPurpose, ConnectionManager};
use super::handler::EventHandler;
use super::headers::{
    dead_letter_properties, original_routing_key, redelivery_properties, remaining_retry_delay, retry_count,
    retry_properties,
};
use super::options::{ConsumerDefaults, ConsumerOptions, SubscribeOptions};
use crate::broker::{
    BrokerChannel, BrokerError, Delivery, DeliveryStream, ExchangeKind, QueueArguments, DEFAULT_EXCHANGE,
};
use crate::domain::{validate_event_type, Event};
use crate::error::{MessagingError, MessagingResult};

/// Broker-assigned consumer tags of an active subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerTags {
    pub main: String,
    pub retry: String,
    pub dead_letter: String,
}

impl ConsumerTags {
    fn iter(&self) -> impl Iterator<Item = &str> {
        [self.main.as_str(), self.retry.as_str(), self.dead_letter.as_str()].into_iter()
    }
}

/// Snapshot of one subscription
#[derive(Debug, Clone)]
pub struct RegistrationInfo {
    pub event_type: String,
    pub options: ConsumerOptions,
    pub tags: Option<ConsumerTags>,
    pub has_dead_letter_handler: bool,
}

/// Consumes events for every registered subscription
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

struct Inner {
    connection: ConnectionManager,
    defaults: ConsumerDefaults,
    state: Mutex<ConsumerState>,
}

#[derive(Default)]
struct ConsumerState {
    registrations: BTreeMap<String, Registration>,
    channel: Option<Arc<dyn BrokerChannel>>,
    started: bool,
    recovery: Option<JoinHandle<()>>,
}

struct Registration {
    options: ConsumerOptions,
    handlers: Arc<RwLock<Handlers>>,
    tags: Option<ConsumerTags>,
}

struct Handlers {
    handler: Arc<dyn EventHandler>,
    dead_letter: Option<Arc<dyn EventHandler>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueRole {
    Main,
    Retry,
    DeadLetter,
}

impl Consumer {
    pub fn new(connection: ConnectionManager, defaults: ConsumerDefaults) -> Self {
        Self {
            inner: Arc::new(Inner {
                connection,
                defaults,
                state: Mutex::new(ConsumerState::default()),
            }),
        }
    }

    /// Register `handler` for `event_type`.
    ///
    /// `event_type` may be a topic pattern (`movement.*`). Subscribing again
    /// to the same event type replaces the handler and does not create a
    /// second set of queues. Once the consumer is started, a new subscription
    /// is activated right away.
    pub async fn subscribe<H>(&self, event_type: &str, handler: H, options: SubscribeOptions) -> MessagingResult<()>
    where
        H: EventHandler + 'static,
    {
        validate_event_type(event_type, true)?;
        let options = ConsumerOptions::resolve(event_type, options, &self.inner.defaults);
        let handler: Arc<dyn EventHandler> = Arc::new(handler);

        let mut state = self.inner.state.lock().await;

        if let Some(existing) = state.registrations.get_mut(event_type) {
            existing.handlers.write().await.handler = handler;
            if existing.tags.is_none() {
                existing.options = options;
            }
            tracing::info!(event_type, "Replaced handler of existing subscription");
            return Ok(());
        }

        let mut registration = Registration {
            options,
            handlers: Arc::new(RwLock::new(Handlers {
                handler,
                dead_letter: None,
            })),
            tags: None,
        };

        if let Some(channel) = state.channel.clone().filter(|_| state.started) {
            self.inner.activate(channel, event_type, &mut registration).await?;
        }

        tracing::info!(
            event_type,
            queue = %registration.options.queue,
            retry_attempts = registration.options.retry_attempts,
            "Subscribed to event type"
        );
        state.registrations.insert(event_type.to_string(), registration);
        Ok(())
    }

    /// Attach a handler for messages that reach the dead-letter queue of an
    /// existing subscription
    pub async fn set_dead_letter_handler<H>(&self, event_type: &str, handler: H) -> MessagingResult<()>
    where
        H: EventHandler + 'static,
    {
        let state = self.inner.state.lock().await;
        let registration = state
            .registrations
            .get(event_type)
            .ok_or_else(|| MessagingError::NotSubscribed(event_type.to_string()))?;

        registration.handlers.write().await.dead_letter = Some(Arc::new(handler));
        tracing::info!(event_type, "Dead-letter handler registered");
        Ok(())
    }

    /// Declare topology and start consuming every subscription. Idempotent.
    pub async fn start(&self) -> MessagingResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.started {
            return Ok(());
        }

        let channel = self.inner.open_channel().await?;
        if let Err(e) = self.inner.activate_all(&channel, &mut state).await {
            self.inner.deactivate_all(&channel, &mut state).await;
            return Err(e);
        }

        state.channel = Some(channel);
        state.started = true;
        state.recovery = Some(Inner::watch_connection(&self.inner));

        tracing::info!(subscriptions = state.registrations.len(), "Consumer started");
        Ok(())
    }

    /// Cancel all consumers and close the consumer channel. No-op when not
    /// started; handlers already running finish on their own.
    pub async fn stop(&self) -> MessagingResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.started {
            return Ok(());
        }

        state.started = false;
        if let Some(task) = state.recovery.take() {
            task.abort();
        }

        if let Some(channel) = state.channel.take() {
            self.inner.deactivate_all(&channel, &mut state).await;
            if let Err(e) = channel.close().await {
                tracing::warn!(error = %e, "Failed to close consumer channel");
            }
        }

        tracing::info!("Consumer stopped");
        Ok(())
    }

    pub async fn is_started(&self) -> bool {
        self.inner.state.lock().await.started
    }

    /// Registered subscriptions with their resolved options and active tags
    pub async fn registrations(&self) -> Vec<RegistrationInfo> {
        let state = self.inner.state.lock().await;
        let mut infos = Vec::with_capacity(state.registrations.len());
        for (event_type, registration) in &state.registrations {
            infos.push(RegistrationInfo {
                event_type: event_type.clone(),
                options: registration.options.clone(),
                tags: registration.tags.clone(),
                has_dead_letter_handler: registration.handlers.read().await.dead_letter.is_some(),
            });
        }
        infos
    }
}

impl Inner {
    /// Consumer channel with baseline prefetch and the main exchange declared
    async fn open_channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel(ChannelPurpose::Consumer).await?;
        channel.set_prefetch(self.defaults.prefetch).await?;
        channel
            .declare_exchange(&self.defaults.exchange, ExchangeKind::Topic, true)
            .await?;
        Ok(channel)
    }

    async fn activate_all(&self, channel: &Arc<dyn BrokerChannel>, state: &mut ConsumerState) -> MessagingResult<()> {
        for (event_type, registration) in state.registrations.iter_mut() {
            self.activate(channel.clone(), event_type, registration).await?;
        }
        Ok(())
    }

    /// Cancel consumer tags, best effort
    async fn deactivate_all(&self, channel: &Arc<dyn BrokerChannel>, state: &mut ConsumerState) {
        for (event_type, registration) in state.registrations.iter_mut() {
            let Some(tags) = registration.tags.take() else {
                continue;
            };
            for tag in tags.iter() {
                if let Err(e) = channel.cancel(tag).await {
                    tracing::warn!(event_type = %event_type, consumer_tag = tag, error = %e, "Failed to cancel consumer");
                }
            }
        }
    }

    /// Declare the three queues of a subscription and start consuming them
    async fn activate(
        &self,
        channel: Arc<dyn BrokerChannel>,
        event_type: &str,
        registration: &mut Registration,
    ) -> MessagingResult<()> {
        let options = &registration.options;
        let retry_queue = options.retry_queue();
        let dead_letter_queue = options.dead_letter_queue();

        channel
            .declare_exchange(&options.exchange, ExchangeKind::Topic, true)
            .await?;
        channel
            .declare_exchange(&options.dead_letter_exchange, ExchangeKind::Direct, true)
            .await?;

        channel
            .declare_queue(
                &options.queue,
                true,
                &QueueArguments {
                    message_ttl: None,
                    dead_letter_exchange: Some(options.dead_letter_exchange.clone()),
                    dead_letter_routing_key: Some(dead_letter_queue.clone()),
                },
            )
            .await?;
        channel
            .declare_queue(
                &retry_queue,
                true,
                &QueueArguments {
                    message_ttl: Some(u32::try_from(options.retry_delay.as_millis()).unwrap_or(u32::MAX)),
                    dead_letter_exchange: Some(DEFAULT_EXCHANGE.to_string()),
                    dead_letter_routing_key: Some(options.queue.clone()),
                },
            )
            .await?;
        channel
            .declare_queue(&dead_letter_queue, true, &QueueArguments::default())
            .await?;

        channel
            .bind_queue(&options.queue, &options.exchange, &options.routing_key)
            .await?;
        channel
            .bind_queue(&retry_queue, &options.dead_letter_exchange, &retry_queue)
            .await?;
        channel
            .bind_queue(&dead_letter_queue, &options.dead_letter_exchange, &dead_letter_queue)
            .await?;

        channel.set_prefetch(options.prefetch).await?;

        let worker = Arc::new(Worker {
            channel: channel.clone(),
            event_type: event_type.to_string(),
            options: options.clone(),
            handlers: registration.handlers.clone(),
        });

        let main = channel.consume(&options.queue).await?;
        let retry = channel.consume(&retry_queue).await?;
        let dead_letter = channel.consume(&dead_letter_queue).await?;

        registration.tags = Some(ConsumerTags {
            main: main.consumer_tag,
            retry: retry.consumer_tag,
            dead_letter: dead_letter.consumer_tag,
        });

        Worker::spawn(worker.clone(), QueueRole::Main, main.deliveries);
        Worker::spawn(worker.clone(), QueueRole::Retry, retry.deliveries);
        Worker::spawn(worker, QueueRole::DeadLetter, dead_letter.deliveries);

        tracing::info!(
            event_type,
            queue = %options.queue,
            routing_key = %options.routing_key,
            prefetch = options.prefetch,
            "Subscription active"
        );
        Ok(())
    }

    /// Restore consumers whenever the connection manager installs a new
    /// connection or the consumer channel alone fails
    fn watch_connection(inner: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(inner);
        let mut link = inner.connection.subscribe();
        let mut losses = inner.connection.channel_losses();
        let mut seen = link.borrow_and_update().generation;

        tokio::spawn(async move {
            loop {
                let cause = tokio::select! {
                    changed = link.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let current = *link.borrow_and_update();
                        if !current.connected || current.generation == seen {
                            continue;
                        }
                        seen = current.generation;
                        "reconnect"
                    }
                    lost = losses.recv() => match lost {
                        Ok(ChannelPurpose::Consumer) | Err(RecvError::Lagged(_)) => "channel lost",
                        Ok(ChannelPurpose::Publisher) => continue,
                        Err(RecvError::Closed) => return,
                    },
                };

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.recover(cause).await {
                    return;
                }
            }
        })
    }

    /// Reopen the consumer channel and resume every subscription. Returns
    /// false once the consumer is stopped and there is nothing left to watch.
    async fn recover(&self, cause: &'static str) -> bool {
        let mut state = self.state.lock().await;
        if !state.started {
            return false;
        }
        if state.channel.as_ref().is_some_and(|c| c.is_open()) {
            return true;
        }

        tracing::info!(cause, "Restoring consumer");
        state.channel = None;
        for registration in state.registrations.values_mut() {
            registration.tags = None;
        }

        let result = match self.open_channel().await {
            Ok(channel) => match self.activate_all(&channel, &mut state).await {
                Ok(()) => {
                    state.channel = Some(channel);
                    Ok(())
                }
                Err(e) => {
                    self.deactivate_all(&channel, &mut state).await;
                    if let Err(close_error) = channel.close().await {
                        tracing::debug!(error = %close_error, "Failed to close consumer channel");
                    }
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!(cause, subscriptions = state.registrations.len(), "Consumer restored");
                true
            }
            Err(e) if self.connection.is_connected() => {
                tracing::error!(cause, error = %e, "Failed to restore consumer, consumer stopped");
                state.started = false;
                state.recovery = None;
                false
            }
            Err(e) => {
                tracing::error!(cause, error = %e, "Failed to restore consumer, waiting for reconnect");
                true
            }
        }
    }
}

/// Per-subscription processing context shared by its three queue workers
struct Worker {
    channel: Arc<dyn BrokerChannel>,
    event_type: String,
    options: ConsumerOptions,
    handlers: Arc<RwLock<Handlers>>,
}

impl Worker {
    fn spawn(worker: Arc<Self>, role: QueueRole, deliveries: DeliveryStream) {
        let limit = usize::from(worker.options.prefetch.max(1));

        tokio::spawn(async move {
            deliveries
                .for_each_concurrent(limit, |delivery| {
                    let worker = worker.clone();
                    async move {
                        match delivery {
                            Ok(delivery) => worker.process(role, delivery).await,
                            Err(e) => tracing::error!(
                                queue = %worker.queue_name(role),
                                error = %e,
                                "Delivery stream error"
                            ),
                        }
                    }
                })
                .await;

            tracing::debug!(queue = %worker.queue_name(role), "Consumer stream ended");
        });
    }

    fn queue_name(&self, role: QueueRole) -> String {
        match role {
            QueueRole::Main => self.options.queue.clone(),
            QueueRole::Retry => self.options.retry_queue(),
            QueueRole::DeadLetter => self.options.dead_letter_queue(),
        }
    }

    async fn process(&self, role: QueueRole, delivery: Delivery) {
        match role {
            QueueRole::Main => self.process_main(delivery).await,
            QueueRole::Retry => self.process_retry(delivery).await,
            QueueRole::DeadLetter => self.process_dead_letter(delivery).await,
        }
    }

    async fn process_main(&self, delivery: Delivery) {
        let queue = &self.options.queue;

        let event = match Event::from_wire(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    queue = %queue,
                    message_id = ?delivery.properties.message_id,
                    error = %e,
                    "Discarding malformed message"
                );
                self.nack(delivery.delivery_tag, false).await;
                return;
            }
        };

        let retries = retry_count(&delivery.properties);
        let routing_key = original_routing_key(&delivery.properties)
            .unwrap_or(&delivery.routing_key)
            .to_string();

        let handler = self.handlers.read().await.handler.clone();
        let error = match handler.handle(&event).await {
            Ok(()) => {
                self.ack(delivery.delivery_tag).await;
                tracing::debug!(
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    queue = %queue,
                    retry_count = retries,
                    "Event handled"
                );
                return;
            }
            Err(e) => format!("{:#}", e),
        };

        if retries < self.options.retry_attempts {
            let next = retries + 1;
            let delay = self.options.retry_delay_for(retries);
            let retry_queue = self.options.retry_queue();
            tracing::warn!(
                event_id = %event.id(),
                event_type = %event.event_type(),
                queue = %queue,
                retry_count = next,
                max_retries = self.options.retry_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Handler failed, scheduling retry"
            );

            let properties = retry_properties(&event, next, &routing_key, Some(delay));
            self.forward(
                &delivery,
                &self.options.dead_letter_exchange,
                &retry_queue,
                &properties,
            )
            .await;
        } else {
            let dead_letter_queue = self.options.dead_letter_queue();
            tracing::error!(
                event_id = %event.id(),
                event_type = %event.event_type(),
                queue = %queue,
                routing_key = %routing_key,
                retry_count = retries,
                error = %error,
                "Handler failed after all retries, moving to dead-letter queue"
            );

            let properties = dead_letter_properties(&event, retries, &routing_key);
            self.forward(
                &delivery,
                &self.options.dead_letter_exchange,
                &dead_letter_queue,
                &properties,
            )
            .await;
        }
    }

    /// Wait out the hop delay, then send the message back to this
    /// subscription's main queue. The routing key recorded at the first
    /// failure travels along in the headers.
    async fn process_retry(&self, delivery: Delivery) {
        let retries = retry_count(&delivery.properties);
        let routing_key = match original_routing_key(&delivery.properties) {
            Some(key) => key.to_string(),
            None => {
                tracing::warn!(
                    queue = %self.options.retry_queue(),
                    message_id = ?delivery.properties.message_id,
                    "Retry message without original routing key, using subscription routing key"
                );
                self.options.routing_key.clone()
            }
        };

        let delay = delivery
            .properties
            .expiration
            .as_deref()
            .and_then(|e| e.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.options.retry_delay_for(retries.saturating_sub(1)));
        // Time spent waiting for a free prefetch slot counts toward the delay
        tokio::time::sleep(remaining_retry_delay(&delivery.properties, delay)).await;

        let properties = redelivery_properties(&delivery.properties, retries, &routing_key);
        tracing::debug!(
            message_id = ?delivery.properties.message_id,
            event_type = %self.event_type,
            queue = %self.options.queue,
            routing_key = %routing_key,
            retry_count = retries,
            "Redelivering retried message"
        );
        self.forward(&delivery, DEFAULT_EXCHANGE, &self.options.queue, &properties)
            .await;
    }

    async fn process_dead_letter(&self, delivery: Delivery) {
        let queue = self.options.dead_letter_queue();
        let dead_letter = self.handlers.read().await.dead_letter.clone();

        let Some(handler) = dead_letter else {
            tracing::error!(
                queue = %queue,
                message_id = ?delivery.properties.message_id,
                event_type = %self.event_type,
                routing_key = ?original_routing_key(&delivery.properties),
                retry_count = retry_count(&delivery.properties),
                "Event dead-lettered"
            );
            self.ack(delivery.delivery_tag).await;
            return;
        };

        let event = match Event::from_wire(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "Dropping malformed dead-lettered message");
                self.nack(delivery.delivery_tag, false).await;
                return;
            }
        };

        match handler.handle(&event).await {
            Ok(()) => {
                tracing::info!(
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    queue = %queue,
                    "Dead-letter handler completed"
                );
                self.ack(delivery.delivery_tag).await;
            }
            Err(e) => {
                let error = format!("{:#}", e);
                tracing::error!(
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    queue = %queue,
                    error = %error,
                    "Dead-letter handler failed, dropping message"
                );
                self.nack(delivery.delivery_tag, false).await;
            }
        }
    }

    /// Publish a copy and settle the original: ack on success, requeue on
    /// failure so the message is never lost
    async fn forward(
        &self,
        delivery: &Delivery,
        exchange: &str,
        routing_key: &str,
        properties: &crate::broker::MessageProperties,
    ) {
        match self
            .channel
            .publish(exchange, routing_key, &delivery.body, properties)
            .await
        {
            Ok(()) => self.ack(delivery.delivery_tag).await,
            Err(e) => {
                tracing::error!(
                    message_id = ?delivery.properties.message_id,
                    exchange,
                    routing_key,
                    error = %e,
                    "Failed to forward message, requeueing original"
                );
                self.nack(delivery.delivery_tag, true).await;
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) {
        if let Err(e) = self.channel.ack(delivery_tag).await {
            self.settle_failed("ack", delivery_tag, &e);
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) {
        if let Err(e) = self.channel.nack(delivery_tag, requeue).await {
            self.settle_failed("nack", delivery_tag, &e);
        }
    }

    fn settle_failed(&self, operation: &str, delivery_tag: u64, error: &BrokerError) {
        if error.is_connection_level() || matches!(error, BrokerError::ChannelClosed) {
            tracing::warn!(
                event_type = %self.event_type,
                delivery_tag,
                operation,
                error = %error,
                "Could not settle delivery, broker will redeliver it"
            );
        } else {
            tracing::error!(
                event_type = %self.event_type,
                delivery_tag,
                operation,
                error = %error,
                "Failed to settle delivery"
            );
        }
    }
}
