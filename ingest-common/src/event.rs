use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Enumeration of reasons a queue item cannot be turned into an `Event`.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed event: {0}")]
    MalformedEvent(#[from] serde_json::Error),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("payload must be a JSON object")]
    PayloadNotAnObject,
}

/// An event as it travels through the shared queue.
///
/// `payload` is kept as the raw JSON text we received, so it reaches the store without being
/// re-serialized. `timestamp` is whatever the producer claimed and is never persisted: the store
/// stamps its own `recorded_at`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Event {
    #[serde(rename = "topic", alias = "category")]
    pub category: String,
    #[serde(rename = "event_id", alias = "identifier")]
    pub identifier: String,
    pub timestamp: String,
    pub source: String,
    pub payload: Box<RawValue>,
}

impl Event {
    /// Build a new `Event` stamped with the current time.
    pub fn new(category: &str, identifier: &str, source: &str, payload: Box<RawValue>) -> Self {
        Self {
            category: category.to_owned(),
            identifier: identifier.to_owned(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            source: source.to_owned(),
            payload,
        }
    }

    /// Decode one queue item into a validated `Event`.
    pub fn decode(item: &str) -> Result<Self, DecodeError> {
        let event: Event = serde_json::from_str(item)?;
        event.validate()?;
        Ok(event)
    }

    /// Serialize this `Event` into the shape consumers pop from the queue.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Check the invariants serde can't express: a usable deduplication key and an object payload.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.category.is_empty() {
            return Err(DecodeError::EmptyField("topic"));
        }
        if self.identifier.is_empty() {
            return Err(DecodeError::EmptyField("event_id"));
        }
        if !self.payload.get().starts_with('{') {
            return Err(DecodeError::PayloadNotAnObject);
        }
        Ok(())
    }
}
