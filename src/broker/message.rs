//! Broker message types
//!
//! Transport-neutral representation of AMQP message properties, header
//! tables and deliveries.

use std::collections::BTreeMap;

/// Header table (AMQP field table)
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single header value
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Array(Vec<HeaderValue>),
    Table(Headers),
}

impl HeaderValue {
    /// Integer view; numeric strings are accepted since some publishers
    /// stringify counters
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(n) => Some(*n),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[HeaderValue]> {
        match self {
            HeaderValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Headers> {
        match self {
            HeaderValue::Table(table) => Some(table),
            _ => None,
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

/// Message properties attached to a published message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    /// Delivery mode 2 (survives broker restart on durable queues)
    pub persistent: bool,
    pub message_id: Option<String>,
    /// Epoch milliseconds
    pub timestamp: Option<u64>,
    /// AMQP `type` property
    pub kind: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    /// Per-message TTL in milliseconds, as a decimal string
    pub expiration: Option<String>,
    pub headers: Headers,
}

impl MessageProperties {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }
}

/// A message handed to a consumer, awaiting ack or nack
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}
