//! In-memory broker
//!
//! An in-process stand-in for RabbitMQ implementing the subset of AMQP 0-9-1
//! the messaging layer relies on:
//! - topic, direct and fanout exchanges plus the default exchange (`""`),
//!   which routes straight to the queue named by the routing key;
//! - queue arguments `x-message-ttl`, `x-dead-letter-exchange` and
//!   `x-dead-letter-routing-key`, with `x-death` bookkeeping;
//! - per-consumer prefetch, manual ack/nack, consumer cancellation;
//! - unacknowledged messages are requeued when their channel closes.
//!
//! It also records every message enqueued per queue and can inject faults:
//! refused or slow connects, a full publish buffer, severed connections and
//! channel exceptions that leave the connection up.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, Delivery, ErrorCallback,
    ExchangeKind, HeaderValue, Headers, MessageProperties, QueueArguments, Subscription,
    DEFAULT_EXCHANGE,
};
use crate::domain::topic_matches;

/// A message as it was enqueued on a queue
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl StoredMessage {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.properties.header(name)
    }
}

/// In-process broker. Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    history: HashMap<String, Vec<StoredMessage>>,
    next_id: u64,
    accept_publishes: usize,
    reject_publishes: usize,
    fail_connects: usize,
    connect_delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct QueueState {
    durable: bool,
    arguments: QueueArguments,
    ready: VecDeque<Message>,
    consumers: Vec<ConsumerState>,
    next_consumer: usize,
}

#[derive(Clone)]
struct Message {
    id: u64,
    stored: StoredMessage,
    redelivered: bool,
}

struct ConsumerState {
    tag: String,
    channel_id: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<BrokerResult<Delivery>>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct ConnectionState {
    open: bool,
    callbacks: Vec<ErrorCallback>,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
    callbacks: Vec<ErrorCallback>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: Message,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes with [`BrokerError::BufferFull`]
    pub fn reject_next_publishes(&self, count: usize) {
        self.reject_publishes_after(0, count);
    }

    /// Accept `accepted` more publishes, then fail the following `count`
    /// with [`BrokerError::BufferFull`]
    pub fn reject_publishes_after(&self, accepted: usize, count: usize) {
        let mut state = self.inner.lock();
        state.accept_publishes = accepted;
        state.reject_publishes = count;
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.lock().fail_connects = count;
    }

    /// Make every following connection attempt take `delay`
    pub fn delay_connects(&self, delay: Duration) {
        self.inner.lock().connect_delay = Some(delay);
    }

    /// Close the channel consuming `queue` as if the broker raised a channel
    /// exception. The connection stays open. Returns the number of channels
    /// closed.
    pub fn fail_consumer_channel(&self, queue: &str) -> usize {
        let channel_ids: Vec<u64> = {
            let state = self.inner.lock();
            let mut ids: Vec<u64> = state
                .queues
                .get(queue)
                .map(|q| q.consumers.iter().map(|c| c.channel_id).collect())
                .unwrap_or_default();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        self.fail_channels(channel_ids)
    }

    /// Close every open channel that has no consumer, which is how publisher
    /// channels look, as if the broker raised a channel exception
    pub fn fail_idle_channels(&self) -> usize {
        let channel_ids: Vec<u64> = {
            let state = self.inner.lock();
            state
                .channels
                .keys()
                .copied()
                .filter(|id| {
                    !state
                        .queues
                        .values()
                        .any(|q| q.consumers.iter().any(|c| c.channel_id == *id))
                })
                .collect()
        };
        self.fail_channels(channel_ids)
    }

    fn fail_channels(&self, channel_ids: Vec<u64>) -> usize {
        let mut closed = 0;
        let mut callbacks = Vec::new();
        {
            let mut state = self.inner.lock();
            for channel_id in channel_ids {
                if state.channels.contains_key(&channel_id) {
                    closed += 1;
                    callbacks.extend(self.inner.close_channel(&mut state, channel_id));
                }
            }
        }

        for mut callback in callbacks {
            callback(BrokerError::Protocol("channel closed by broker: PRECONDITION_FAILED".to_string()));
        }
        closed
    }

    /// Drop every open connection as if the network failed.
    ///
    /// Unacknowledged messages are requeued and the registered error
    /// callbacks of connections and channels fire.
    pub fn sever_connections(&self) {
        let mut callbacks = Vec::new();
        {
            let mut state = self.inner.lock();
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();

            for connection_id in open {
                callbacks.extend(self.inner.close_connection(&mut state, connection_id));
            }
        }

        for mut callback in callbacks {
            callback(BrokerError::Connection("connection reset by peer".to_string()));
        }
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.inner.lock().exchanges.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.inner.lock().exchanges.get(name).copied()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.inner.lock().queues.get(name).map(|q| q.arguments.clone())
    }

    pub fn queue_count(&self) -> usize {
        self.inner.lock().queues.len()
    }

    /// Messages ready for delivery (not yet handed to a consumer)
    pub fn queue_depth(&self, name: &str) -> usize {
        self.inner.lock().queues.get(name).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet acked or nacked
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Number of bindings that target `queue`
    pub fn binding_count(&self, queue: &str) -> usize {
        self.inner.lock().bindings.iter().filter(|b| b.queue == queue).count()
    }

    pub fn open_connection_count(&self) -> usize {
        self.inner.lock().connections.values().filter(|c| c.open).count()
    }

    pub fn open_channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Every message ever enqueued on `queue`, in order
    pub fn history(&self, queue: &str) -> Vec<StoredMessage> {
        self.inner.lock().history.get(queue).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, url: &str, _heartbeat_secs: u16) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let delay = self.inner.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.inner.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(BrokerError::Connection(format!("connection refused: {}", url)));
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                callbacks: Vec::new(),
            },
        );

        Ok(Arc::new(MemoryConnection {
            inner: self.inner.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.inner
            .lock()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn on_error(&self, callback: ErrorCallback) {
        if let Some(connection) = self.inner.lock().connections.get_mut(&self.id) {
            connection.callbacks.push(callback);
        }
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let mut state = self.inner.lock();
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(BrokerError::Connection("connection is closed".to_string()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::new(),
                callbacks: Vec::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            inner: self.inner.clone(),
            id,
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.inner.lock();
        // Explicit close: callbacks are dropped, not fired
        drop(self.inner.close_connection(&mut state, self.id));
        Ok(())
    }
}

struct MemoryChannel {
    inner: Arc<Inner>,
    id: u64,
}

impl MemoryChannel {
    fn open_state(&self) -> BrokerResult<MutexGuard<'_, State>> {
        let state = self.inner.lock();
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.inner.lock().channels.contains_key(&self.id)
    }

    fn on_error(&self, callback: ErrorCallback) {
        if let Some(channel) = self.inner.lock().channels.get_mut(&self.id) {
            channel.callbacks.push(callback);
        }
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, _durable: bool) -> BrokerResult<()> {
        let mut state = self.open_state()?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::PreconditionFailed(format!(
                "exchange {} already declared as {:?}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool, arguments: &QueueArguments) -> BrokerResult<()> {
        let mut state = self.open_state()?;
        if let Some(existing) = state.queues.get(name) {
            if existing.durable != durable || existing.arguments != *arguments {
                return Err(BrokerError::PreconditionFailed(format!(
                    "queue {} already declared with different arguments",
                    name
                )));
            }
            return Ok(());
        }

        state.queues.insert(
            name.to_string(),
            QueueState {
                durable,
                arguments: arguments.clone(),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue {}", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange {}", exchange)));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        let mut state = self.open_state()?;
        if state.reject_publishes > 0 {
            if state.accept_publishes > 0 {
                state.accept_publishes -= 1;
            } else {
                state.reject_publishes -= 1;
                return Err(BrokerError::BufferFull);
            }
        }
        if exchange != DEFAULT_EXCHANGE && !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange {}", exchange)));
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        };
        self.inner.route(&mut state, message);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Subscription> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue {}", queue)));
        }

        let prefetch = state.channels.get(&self.id).map_or(0, |c| c.prefetch);
        let tag = format!("amq.ctag-{}", state.next_id());
        let (sender, receiver) = mpsc::unbounded();

        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(ConsumerState {
                tag: tag.clone(),
                channel_id: self.id,
                prefetch,
                in_flight: 0,
                sender,
            });
        }
        self.inner.dispatch(&mut state, queue);

        Ok(Subscription {
            consumer_tag: tag,
            deliveries: receiver.boxed(),
        })
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = self.open_state()?;
        let unacked = self.inner.settle(&mut state, self.id, delivery_tag)?;
        self.inner.dispatch(&mut state, &unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let mut state = self.open_state()?;
        let Unacked { queue, mut message, .. } = self.inner.settle(&mut state, self.id, delivery_tag)?;

        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
        } else {
            self.inner.dead_letter(&mut state, &queue, message.stored, "rejected");
        }
        self.inner.dispatch(&mut state, &queue);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        let mut state = self.open_state()?;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel_id == self.id));
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.inner.lock();
        drop(self.inner.close_channel(&mut state, self.id));
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove an unacked delivery and release its consumer's prefetch slot
    fn settle(&self, state: &mut State, channel_id: u64, delivery_tag: u64) -> BrokerResult<Unacked> {
        let unacked = state
            .channels
            .get_mut(&channel_id)
            .and_then(|c| c.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                BrokerError::PreconditionFailed(format!("unknown delivery tag {}", delivery_tag))
            })?;

        if let Some(queue) = state.queues.get_mut(&unacked.queue) {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.tag == unacked.consumer_tag) {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }
        Ok(unacked)
    }

    fn route(self: &Arc<Self>, state: &mut State, message: StoredMessage) {
        if message.exchange == DEFAULT_EXCHANGE {
            let queue = message.routing_key.clone();
            if state.queues.contains_key(&queue) {
                self.enqueue(state, &queue, message);
            }
            return;
        }

        let Some(kind) = state.exchanges.get(&message.exchange).copied() else {
            return;
        };

        let mut targets: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == message.exchange) {
            let matched = match kind {
                ExchangeKind::Topic => topic_matches(&binding.routing_key, &message.routing_key),
                ExchangeKind::Direct => binding.routing_key == message.routing_key,
                ExchangeKind::Fanout => true,
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }

        for queue in targets {
            self.enqueue(state, &queue, message.clone());
        }
    }

    fn enqueue(self: &Arc<Self>, state: &mut State, queue_name: &str, stored: StoredMessage) {
        let id = state.next_id();
        state
            .history
            .entry(queue_name.to_string())
            .or_default()
            .push(stored.clone());

        let per_message_ttl = stored
            .properties
            .expiration
            .as_deref()
            .and_then(|e| e.parse::<u64>().ok());

        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let queue_ttl = queue.arguments.message_ttl.map(u64::from);
        queue.ready.push_back(Message {
            id,
            stored,
            redelivered: false,
        });

        let ttl = match (queue_ttl, per_message_ttl) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let Some(ttl) = ttl {
            Self::schedule_expiry(Arc::downgrade(self), queue_name.to_string(), id, ttl);
        }

        self.dispatch(state, queue_name);
    }

    fn schedule_expiry(inner: Weak<Self>, queue: String, message_id: u64, ttl_ms: u64) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(&queue, message_id);
            }
        });
    }

    fn expire(self: &Arc<Self>, queue_name: &str, message_id: u64) {
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        // Already delivered messages do not expire
        let Some(position) = queue.ready.iter().position(|m| m.id == message_id) else {
            return;
        };
        if let Some(message) = queue.ready.remove(position) {
            self.dead_letter(&mut state, queue_name, message.stored, "expired");
        }
    }

    fn dead_letter(self: &Arc<Self>, state: &mut State, queue_name: &str, mut stored: StoredMessage, reason: &str) {
        let Some(arguments) = state.queues.get(queue_name).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(exchange) = arguments.dead_letter_exchange else {
            return;
        };

        record_death(&mut stored, queue_name, reason);
        stored.properties.expiration = None;
        stored.routing_key = arguments
            .dead_letter_routing_key
            .unwrap_or_else(|| stored.routing_key.clone());
        stored.exchange = exchange;

        self.route(state, stored);
    }

    /// Hand ready messages to consumers with spare prefetch capacity
    fn dispatch(&self, state: &mut State, queue_name: &str) {
        let State { queues, channels, .. } = state;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let count = queue.consumers.len();
            let Some(index) = (0..count)
                .map(|i| (queue.next_consumer + i) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                break;
            };
            queue.next_consumer = (index + 1) % count.max(1);

            let Some(message) = queue.ready.pop_front() else {
                break;
            };
            let consumer = &mut queue.consumers[index];
            let Some(channel) = channels.get_mut(&consumer.channel_id) else {
                queue.ready.push_front(message);
                break;
            };

            channel.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: channel.next_tag,
                exchange: message.stored.exchange.clone(),
                routing_key: message.stored.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.stored.body.clone(),
                properties: message.stored.properties.clone(),
            };

            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                // Receiver dropped: consumer is gone
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }

            consumer.in_flight += 1;
            channel.unacked.insert(
                channel.next_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    consumer_tag: consumer.tag.clone(),
                    message,
                },
            );
        }
    }

    /// Close a channel: drop its consumers and requeue what it still holds
    fn close_channel(&self, state: &mut State, channel_id: u64) -> Vec<ErrorCallback> {
        let Some(channel) = state.channels.remove(&channel_id) else {
            return Vec::new();
        };

        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        let mut unacked: Vec<(u64, Unacked)> = channel.unacked.into_iter().collect();
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        let mut touched: Vec<String> = Vec::new();
        for (_, Unacked { queue, mut message, .. }) in unacked {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(message);
            }
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }
        for queue in touched {
            self.dispatch(state, &queue);
        }

        channel.callbacks
    }

    fn close_connection(&self, state: &mut State, connection_id: u64) -> Vec<ErrorCallback> {
        let channel_ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();

        let mut callbacks = Vec::new();
        for channel_id in channel_ids {
            callbacks.extend(self.close_channel(state, channel_id));
        }

        if let Some(connection) = state.connections.get_mut(&connection_id) {
            connection.open = false;
            callbacks.append(&mut connection.callbacks);
        }
        callbacks
    }
}

/// Maintain the `x-death` header the way RabbitMQ does: one entry per
/// (queue, reason), most recent first, with a running count.
fn record_death(stored: &mut StoredMessage, queue_name: &str, reason: &str) {
    let mut deaths: Vec<HeaderValue> = stored
        .properties
        .headers
        .remove("x-death")
        .and_then(|v| v.as_array().map(<[HeaderValue]>::to_vec))
        .unwrap_or_default();

    let same = |entry: &HeaderValue| {
        entry.as_table().is_some_and(|t| {
            t.get("queue").and_then(HeaderValue::as_str) == Some(queue_name)
                && t.get("reason").and_then(HeaderValue::as_str) == Some(reason)
        })
    };

    let previous = deaths
        .iter()
        .position(same)
        .map(|i| deaths.remove(i))
        .and_then(|entry| entry.as_table().and_then(|t| t.get("count")).and_then(HeaderValue::as_i64))
        .unwrap_or(0);

    let mut entry = Headers::new();
    entry.insert("count".to_string(), HeaderValue::Int(previous + 1));
    entry.insert("reason".to_string(), HeaderValue::from(reason));
    entry.insert("queue".to_string(), HeaderValue::from(queue_name));
    entry.insert("exchange".to_string(), HeaderValue::from(stored.exchange.as_str()));
    entry.insert(
        "routing-keys".to_string(),
        HeaderValue::Array(vec![HeaderValue::from(stored.routing_key.as_str())]),
    );
    entry.insert("time".to_string(), HeaderValue::Int(Utc::now().timestamp()));
    deaths.insert(0, HeaderValue::Table(entry));

    stored
        .properties
        .headers
        .insert("x-death".to_string(), HeaderValue::Array(deaths));
}
