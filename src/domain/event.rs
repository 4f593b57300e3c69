//! Event envelope
//!
//! The unit of communication on the bus. The JSON form of an [`Event`] is the
//! message body on the wire, so field names and the timestamp format must stay
//! stable across deployments.

use chrono::{DateTime, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::event_type::validate_event_type;
use crate::error::{MessagingError, MessagingResult};

/// Schema version stamped on every event created by this crate
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

/// A domain event as it travels through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    id: String,

    #[serde(rename = "type")]
    event_type: String,

    #[serde(with = "iso8601")]
    timestamp: DateTime<Utc>,

    version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,

    #[serde(default)]
    data: serde_json::Value,
}

impl Event {
    /// Create a new event with a fresh id and the current time
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now().trunc_subsecs(3),
            version: EVENT_SCHEMA_VERSION.to_string(),
            correlation_id: None,
            data,
        }
    }

    /// Create an event from a typed payload
    pub fn from_payload<T: Serialize + ?Sized>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> MessagingResult<Self> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    /// Use a caller-supplied id instead of the generated one.
    ///
    /// Only meant for construction (e.g. replaying a known event); the id is
    /// never changed once the event has been handed to the bus.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach the correlation id of the triggering request
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Deserialize the business payload into a concrete type
    pub fn payload<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Check that this event can be published (concrete, non-wildcard type)
    pub fn validate(&self) -> MessagingResult<()> {
        validate_event_type(&self.event_type, false)
    }

    /// Serialize to the UTF-8 JSON message body
    pub fn to_wire(&self) -> MessagingResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a message body back into an event
    pub fn from_wire(body: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(body).map_err(|e| MessagingError::MalformedMessage(e.to_string()))
    }
}

/// ISO-8601 with millisecond precision and a `Z` suffix, e.g.
/// `2026-01-15T09:30:00.123Z`.
mod iso8601 {
    use super::*;
    use chrono::SecondsFormat;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
