//! Event types and topic patterns
//!
//! An event type is a dotted string (`movement.created`). The same string is
//! the routing key on the topic exchange. Subscriptions may use a trailing
//! wildcard segment (`movement.*`, `ledger.#`) to receive a family of events.

use crate::error::{MessagingError, MessagingResult};

/// Matches a single segment
pub const SINGLE_WILDCARD: &str = "*";

/// Matches zero or more segments
pub const MULTI_WILDCARD: &str = "#";

/// Validate an event type or subscription topic.
///
/// Segments must be non-empty. Wildcards are only accepted when
/// `allow_wildcard` is set, and then only as the last segment.
pub fn validate_event_type(value: &str, allow_wildcard: bool) -> MessagingResult<()> {
    let invalid = |reason: &str| MessagingError::InvalidEventType {
        event_type: value.to_string(),
        reason: reason.to_string(),
    };

    if value.trim().is_empty() {
        return Err(invalid("event type is empty"));
    }

    let segments: Vec<&str> = value.split('.').collect();
    let last = segments.len() - 1;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        if segment.chars().any(char::is_whitespace) {
            return Err(invalid("whitespace in segment"));
        }

        let is_wildcard = *segment == SINGLE_WILDCARD || *segment == MULTI_WILDCARD;
        if is_wildcard {
            if !allow_wildcard {
                return Err(invalid("wildcards are only allowed in subscriptions"));
            }
            if i != last {
                return Err(invalid("wildcard must be the last segment"));
            }
        } else if segment.contains(['*', '#']) {
            return Err(invalid("wildcard mixed into a segment"));
        }
    }

    Ok(())
}

/// True if the topic contains a wildcard segment
pub fn is_pattern(topic: &str) -> bool {
    topic
        .split('.')
        .any(|s| s == SINGLE_WILDCARD || s == MULTI_WILDCARD)
}

/// AMQP topic matching: `*` matches exactly one segment, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&MULTI_WILDCARD, rest)) => {
            (0..=key.len()).any(|skip| match_segments(rest, &key[skip..]))
        }
        Some((&SINGLE_WILDCARD, rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((segment, rest)) => {
            key.first() == Some(segment) && match_segments(rest, &key[1..])
        }
    }
}
