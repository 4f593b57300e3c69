//! AMQP broker (RabbitMQ via lapin)
//!
//! Adapts lapin connections and channels to the broker traits. Channels run
//! in publisher-confirm mode so a broker `nack` surfaces as
//! [`BrokerError::BufferFull`], the signal the publisher turns into a
//! "publish rejected" error.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use executor_trait::{BlockingExecutor, Executor, FullExecutor, Task};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, Delivery, ErrorCallback,
    ExchangeKind, HeaderValue, Headers, MessageProperties, QueueArguments, Subscription,
};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const CONTENT_TYPE_JSON: &str = "application/json";

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(e) => BrokerError::Connection(e.to_string()),
            lapin::Error::InvalidConnectionState(state) => {
                BrokerError::Connection(format!("invalid connection state: {:?}", state))
            }
            lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
            other => BrokerError::Protocol(other.to_string()),
        }
    }
}

/// RabbitMQ broker
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str, heartbeat_secs: u16) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let uri = with_heartbeat(url, heartbeat_secs);
        let connection = Connection::connect(&uri, connection_properties())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

/// Run lapin's background tasks and callbacks on the current tokio runtime.
/// Socket readiness stays with lapin's bundled reactor.
fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default().with_executor(TokioExecutor::current())
}

/// [`FullExecutor`] over a tokio runtime handle
#[derive(Debug, Clone)]
struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }
}

impl Executor for TokioExecutor {
    fn block_on(&self, f: Pin<Box<dyn Future<Output = ()>>>) {
        self.handle.block_on(f)
    }

    fn spawn(&self, f: Pin<Box<dyn Future<Output = ()> + Send>>) -> Box<dyn Task> {
        Box::new(TokioTask(self.handle.spawn(f)))
    }
}

#[async_trait]
impl BlockingExecutor for TokioExecutor {
    async fn spawn_blocking(&self, f: Box<dyn FnOnce() + Send + 'static>) {
        if let Err(e) = self.handle.spawn_blocking(f).await {
            tracing::error!(error = %e, "Blocking broker task failed");
        }
    }
}

impl FullExecutor for TokioExecutor {}

struct TokioTask(JoinHandle<()>);

impl Future for TokioTask {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}

#[async_trait(?Send)]
impl Task for TokioTask {
    async fn cancel(self: Box<Self>) -> Option<()> {
        let handle = self.0;
        handle.abort();
        handle.await.ok()
    }
}

/// Add `heartbeat=<secs>` to the URI query unless it already sets one
fn with_heartbeat(url: &str, heartbeat_secs: u16) -> String {
    if url.contains("heartbeat=") {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}heartbeat={}", url, separator, heartbeat_secs)
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_error(&self, mut callback: ErrorCallback) {
        self.inner.on_error(move |err| callback(BrokerError::from(err)));
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close(200, "OK").await?;
        Ok(())
    }
}

struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_error(&self, mut callback: ErrorCallback) {
        self.inner.on_error(move |err| callback(BrokerError::from(err)));
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> BrokerResult<()> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable,
            ..Default::default()
        };
        self.inner
            .exchange_declare(name, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool, arguments: &QueueArguments) -> BrokerResult<()> {
        let options = QueueDeclareOptions {
            durable,
            ..Default::default()
        };
        self.inner
            .queue_declare(name, options, queue_arguments(arguments))
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.inner.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        let confirmation = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::BufferFull);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> BrokerResult<Subscription> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let consumer_tag = consumer.tag().as_str().to_string();
        let deliveries = consumer
            .map(|item| item.map(from_lapin_delivery).map_err(BrokerError::from))
            .boxed();

        Ok(Subscription {
            consumer_tag,
            deliveries,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close(200, "OK").await?;
        Ok(())
    }
}

fn queue_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(ttl) = arguments.message_ttl {
        table.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
    }
    if let Some(exchange) = &arguments.dead_letter_exchange {
        table.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }
    if let Some(routing_key) = &arguments.dead_letter_routing_key {
        table.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(LongString::from(routing_key.clone())),
        );
    }
    table
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_content_type(ShortString::from(
            properties
                .content_type
                .clone()
                .unwrap_or_else(|| CONTENT_TYPE_JSON.to_string()),
        ))
        .with_headers(to_field_table(&properties.headers));

    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(kind) = &properties.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let short = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    MessageProperties {
        persistent: *basic.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        message_id: short(basic.message_id()),
        timestamp: *basic.timestamp(),
        kind: short(basic.kind()),
        correlation_id: short(basic.correlation_id()),
        content_type: short(basic.content_type()),
        expiration: short(basic.expiration()),
        headers: basic
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
    }
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        table.insert(ShortString::from(name.clone()), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
        HeaderValue::Str(s) => AMQPValue::LongString(LongString::from(s.clone())),
        HeaderValue::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp_value).collect::<Vec<_>>()))
        }
        HeaderValue::Table(table) => AMQPValue::FieldTable(to_field_table(table)),
    }
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            from_amqp_value(value).map(|v| (name.as_str().to_string(), v))
        })
        .collect()
}

/// Numeric widths collapse to `Int`; floats, decimals and byte arrays have
/// no use in this layer and are dropped
fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    let value = match value {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortShortUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongUInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
        AMQPValue::Timestamp(t) => HeaderValue::Int(i64::try_from(*t).ok()?),
        AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_string()),
        AMQPValue::LongString(s) => HeaderValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            HeaderValue::Array(items.as_slice().iter().filter_map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => HeaderValue::Table(from_field_table(table)),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_properties_use_tokio() {
        assert!(connection_properties().executor.is_some());

        let executor = TokioExecutor::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.spawn(Box::pin(async move {
            let _ = tx.send(Handle::try_current().is_ok());
        }));
        assert!(rx.await.unwrap(), "spawned task runs outside tokio");

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        executor
            .spawn_blocking(Box::new(move || flag.store(true, std::sync::atomic::Ordering::SeqCst)))
            .await;
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_task_stops() {
        let task = TokioExecutor::current().spawn(Box::pin(std::future::pending::<()>()));
        assert_eq!(task.cancel().await, None);
    }

    #[test]
    fn test_with_heartbeat() {
        assert_eq!(
            with_heartbeat("amqp://localhost:5672/%2f", 30),
            "amqp://localhost:5672/%2f?heartbeat=30"
        );
        assert_eq!(
            with_heartbeat("amqp://localhost/%2f?frame_max=8192", 30),
            "amqp://localhost/%2f?frame_max=8192&heartbeat=30"
        );
        assert_eq!(
            with_heartbeat("amqp://localhost/%2f?heartbeat=5", 30),
            "amqp://localhost/%2f?heartbeat=5"
        );
    }

    #[test]
    fn test_queue_arguments() {
        let table = queue_arguments(&QueueArguments {
            message_ttl: Some(100),
            dead_letter_exchange: Some("events.dlx".into()),
            dead_letter_routing_key: None,
        });

        let inner = table.inner();
        assert_eq!(inner.len(), 2);
        assert!(matches!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(AMQPValue::LongUInt(100))
        ));
    }

    #[test]
    fn test_properties_round_trip() {
        let mut nested = Headers::new();
        nested.insert("count".into(), HeaderValue::Int(2));

        let props = MessageProperties {
            persistent: true,
            message_id: Some("e1".into()),
            timestamp: Some(1_768_469_400_123),
            kind: Some("movement.created".into()),
            correlation_id: Some("req-1".into()),
            content_type: Some(CONTENT_TYPE_JSON.into()),
            expiration: Some("200".into()),
            headers: Headers::from([
                ("version".to_string(), HeaderValue::from("1.0")),
                ("x-retry-count".to_string(), HeaderValue::Int(1)),
                ("x-death".to_string(), HeaderValue::Array(vec![HeaderValue::Table(nested)])),
            ]),
        };

        let back = from_basic_properties(&to_basic_properties(&props));
        assert_eq!(back, props);
    }

    #[test]
    fn test_narrow_integers_widen() {
        assert_eq!(from_amqp_value(&AMQPValue::LongInt(-3)), Some(HeaderValue::Int(-3)));
        assert_eq!(from_amqp_value(&AMQPValue::ShortUInt(7)), Some(HeaderValue::Int(7)));
        assert_eq!(from_amqp_value(&AMQPValue::Double(1.5)), None);
    }
}
