//! Broker module
//!
//! Transport abstraction between the messaging core and the message broker.
//! The core only ever talks to these traits; `amqp` adapts them to RabbitMQ
//! and `memory` provides an in-process broker with the same routing,
//! dead-lettering and acknowledgement semantics for tests and local runs.

pub mod amqp;
mod error;
pub mod memory;
mod message;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use amqp::AmqpBroker;
pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use message::{Delivery, HeaderValue, Headers, MessageProperties};

/// Broker Result type
pub type BrokerResult<T> = Result<T, BrokerError>;

/// The nameless exchange every queue is bound to under its own name
pub const DEFAULT_EXCHANGE: &str = "";

/// Callback invoked when a connection or channel fails or closes unexpectedly
pub type ErrorCallback = Box<dyn FnMut(BrokerError) + Send + 'static>;

/// Stream of deliveries for one consumer; ends when the consumer is cancelled
/// or its channel closes
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Exchange routing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

/// Optional queue arguments understood by the broker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-message-ttl` in milliseconds
    pub message_ttl: Option<u32>,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
}

/// An active consumer: its broker-assigned tag and its delivery stream
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

/// Entry point: opens connections
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, url: &str, heartbeat_secs: u16) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// One physical broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Register a callback fired once the connection errors or closes
    /// without being asked to
    fn on_error(&self, callback: ErrorCallback);

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> BrokerResult<()>;
}

/// A multiplexed channel on a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    fn on_error(&self, callback: ErrorCallback);

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> BrokerResult<()>;

    async fn declare_queue(&self, name: &str, durable: bool, arguments: &QueueArguments) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    /// Maximum unacknowledged deliveries for consumers started afterwards
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()>;

    /// Start a manual-ack consumer on `queue`
    async fn consume(&self, queue: &str) -> BrokerResult<Subscription>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}
