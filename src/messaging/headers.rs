//! Message headers
//!
//! Property and header conventions shared by the publisher and the consumer.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};

use crate::broker::{HeaderValue, MessageProperties};
use crate::domain::Event;

pub const HEADER_VERSION: &str = "version";
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
pub const HEADER_FAILED_AT: &str = "x-failed-at";
pub const HEADER_FINAL_RETRY_COUNT: &str = "x-final-retry-count";
/// Epoch milliseconds at which a retry copy was parked
pub const HEADER_RETRY_SCHEDULED_AT: &str = "x-retry-scheduled-at";

/// Broker-maintained dead-letter history
pub const HEADER_DEATH: &str = "x-death";

const CONTENT_TYPE_JSON: &str = "application/json";

/// Properties of a freshly published event
pub fn event_properties(event: &Event) -> MessageProperties {
    MessageProperties {
        persistent: true,
        message_id: Some(event.id().to_string()),
        timestamp: u64::try_from(event.timestamp().timestamp_millis()).ok(),
        kind: Some(event.event_type().to_string()),
        correlation_id: event.correlation_id().map(str::to_string),
        content_type: Some(CONTENT_TYPE_JSON.to_string()),
        expiration: None,
        headers: Default::default(),
    }
    .with_header(HEADER_VERSION, event.version())
}

/// Number of retries a message has been through.
///
/// `x-retry-count` is authoritative since it is rewritten on every hop;
/// the broker's `x-death` counts are only a fallback for messages that never
/// carried it.
pub fn retry_count(properties: &MessageProperties) -> u32 {
    if let Some(count) = properties.header(HEADER_RETRY_COUNT).and_then(HeaderValue::as_i64) {
        return clamp(count);
    }

    let deaths: i64 = properties
        .header(HEADER_DEATH)
        .and_then(HeaderValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(HeaderValue::as_table)
                .filter_map(|entry| entry.get("count").and_then(HeaderValue::as_i64))
                .sum()
        })
        .unwrap_or(0);

    clamp(deaths)
}

/// Routing key of the original publish, as recorded by this layer
pub fn original_routing_key(properties: &MessageProperties) -> Option<&str> {
    properties
        .header(HEADER_ORIGINAL_ROUTING_KEY)
        .and_then(HeaderValue::as_str)
}

/// Properties of a copy headed for the retry queue
pub fn retry_properties(
    event: &Event,
    retry_count: u32,
    original_routing_key: &str,
    expiration: Option<Duration>,
) -> MessageProperties {
    let mut properties = event_properties(event)
        .with_header(HEADER_RETRY_COUNT, retry_count)
        .with_header(HEADER_ORIGINAL_ROUTING_KEY, original_routing_key)
        .with_header(HEADER_RETRY_SCHEDULED_AT, Utc::now().timestamp_millis());
    properties.expiration = expiration.map(|d| d.as_millis().to_string());
    properties
}

/// Properties of a copy headed for the dead-letter queue
pub fn dead_letter_properties(
    event: &Event,
    final_retry_count: u32,
    original_routing_key: &str,
) -> MessageProperties {
    event_properties(event)
        .with_header(HEADER_RETRY_COUNT, final_retry_count)
        .with_header(HEADER_ORIGINAL_ROUTING_KEY, original_routing_key)
        .with_header(
            HEADER_FAILED_AT,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        )
        .with_header(HEADER_FINAL_RETRY_COUNT, final_retry_count)
}

/// Properties for sending a parked retry back to the main routing key.
///
/// Broker dead-letter bookkeeping and the per-message TTL are dropped; the
/// headers this layer owns travel unchanged.
pub fn redelivery_properties(properties: &MessageProperties, retry_count: u32, original_routing_key: &str) -> MessageProperties {
    let mut redelivery = properties.clone();
    redelivery.expiration = None;
    redelivery.headers.remove(HEADER_DEATH);
    redelivery.headers.remove(HEADER_RETRY_SCHEDULED_AT);
    redelivery
        .with_header(HEADER_RETRY_COUNT, retry_count)
        .with_header(HEADER_ORIGINAL_ROUTING_KEY, original_routing_key)
}

/// Part of `delay` still to wait for a parked retry, counting from when it
/// was parked rather than from when it was delivered
pub fn remaining_retry_delay(properties: &MessageProperties, delay: Duration) -> Duration {
    let Some(scheduled_at) = properties
        .header(HEADER_RETRY_SCHEDULED_AT)
        .and_then(HeaderValue::as_i64)
    else {
        return delay;
    };

    let waited = Utc::now().timestamp_millis().saturating_sub(scheduled_at);
    delay.saturating_sub(Duration::from_millis(u64::try_from(waited).unwrap_or(0)))
}

fn clamp(count: i64) -> u32 {
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}
