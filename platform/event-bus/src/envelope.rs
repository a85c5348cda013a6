//! # Message Envelope
//!
//! The structured JSON value passed between every component in this
//! library: publisher, outbox, broker wire format, inbox, and consumer
//! handler all speak this one shape.
//!
//! ## Fields
//!
//! - `message_id`: time-ordered (UUIDv7) idempotency key.
//! - `event`: routing key, `^[A-Za-z0-9._-]{1,255}$`.
//! - `payload`: application data.
//! - `meta`: tenant/routing context (product, env, tenant).
//! - `status`: consumer-observable processing status.
//! - `system`: debug flag, last consumer error, creation time, trace chain.
//!
//! Mutators are expressed as "decode → mutate subtree → encode" over a
//! cached decoded representation, re-encoding once at the edge before
//! hand-off to the publisher — never round-tripping through JSON on every
//! mutation.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::MessagingError;

/// Hard cap on serialized envelope size (§3.1).
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;
/// Size past which a warning is logged but the envelope is still accepted.
pub const WARN_ENVELOPE_BYTES: usize = 512 * 1024;

static EVENT_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,255}$").unwrap());

/// Validate a routing-key/event-name string against the platform pattern.
pub fn validate_event_name(name: &str) -> Result<(), MessagingError> {
    if EVENT_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(MessagingError::Validation(format!(
            "invalid event name {name:?}: must match ^[A-Za-z0-9._-]{{1,255}}$"
        )))
    }
}

/// Consumer-observable processing status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvelopeStatus {
    pub code: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Default for EnvelopeStatus {
    fn default() -> Self {
        Self {
            code: "pending".to_string(),
            data: Map::new(),
        }
    }
}

/// System-managed metadata: debug routing, last consumer error, creation
/// timestamp, and the trace chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvelopeSystem {
    pub is_debug: bool,
    pub consumer_error: Option<String>,
    /// UTC, millisecond precision (§3.1).
    pub created_at: DateTime<Utc>,
    /// Ordered sequence of parent message ids; each relay appends its own.
    #[serde(default)]
    pub trace_id: Vec<String>,
}

impl Default for EnvelopeSystem {
    fn default() -> Self {
        Self {
            is_debug: false,
            consumer_error: None,
            created_at: now_millis(),
            trace_id: Vec::new(),
        }
    }
}

fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// The wire-format message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub event: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub status: EnvelopeStatus,
    #[serde(default)]
    pub system: EnvelopeSystem,
}

impl Envelope {
    /// Create a new envelope with a fresh time-ordered message id.
    pub fn new(event: impl Into<String>) -> Result<Self, MessagingError> {
        let event = event.into();
        validate_event_name(&event)?;
        Ok(Self {
            message_id: Uuid::now_v7(),
            event,
            payload: Map::new(),
            meta: Map::new(),
            status: EnvelopeStatus::default(),
            system: EnvelopeSystem::default(),
        })
    }

    /// Construct an envelope from a JSON map, merging it over the default
    /// shape so callers may omit `status`/`system` entirely.
    pub fn from_map(mut value: Value) -> Result<Self, MessagingError> {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| MessagingError::Encoding("envelope must be a JSON object".into()))?;

        if !obj.contains_key("message_id") {
            obj.insert(
                "message_id".to_string(),
                Value::String(Uuid::now_v7().to_string()),
            );
        }
        if !obj.contains_key("status") {
            obj.insert(
                "status".to_string(),
                serde_json::to_value(EnvelopeStatus::default())
                    .expect("EnvelopeStatus always serializes"),
            );
        }
        if !obj.contains_key("system") {
            obj.insert(
                "system".to_string(),
                serde_json::to_value(EnvelopeSystem::default())
                    .expect("EnvelopeSystem always serializes"),
            );
        }

        let envelope: Envelope =
            serde_json::from_value(value).map_err(MessagingError::from_json)?;
        validate_event_name(&envelope.event)?;
        Ok(envelope)
    }

    /// Decode a serialized envelope. Strict UTF-8, strict JSON: malformed
    /// input is always an error, never a silent `null`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessagingError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| MessagingError::Encoding(format!("invalid UTF-8: {e}")))?;
        let value: Value = serde_json::from_str(text).map_err(MessagingError::from_json)?;
        Self::from_map(value)
    }

    /// Encode this envelope, validating its serialized size against the
    /// platform cap.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        let bytes = serde_json::to_vec(self).map_err(MessagingError::from_json)?;
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(MessagingError::Validation(format!(
                "envelope of {} bytes exceeds the {} byte cap",
                bytes.len(),
                MAX_ENVELOPE_BYTES
            )));
        }
        if bytes.len() > WARN_ENVELOPE_BYTES {
            warn!(
                message_id = %self.message_id,
                event = %self.event,
                bytes = bytes.len(),
                "envelope exceeds the warn threshold"
            );
        }
        Ok(bytes)
    }

    /// Cheap estimate of the encoded size, without validating. Callers use
    /// this to decide whether to log a [`WARN_ENVELOPE_BYTES`] warning
    /// before committing to a full encode.
    pub fn size_hint(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(usize::MAX)
    }

    pub fn set_event(&mut self, event: impl Into<String>) -> Result<(), MessagingError> {
        let event = event.into();
        validate_event_name(&event)?;
        self.event = event;
        Ok(())
    }

    pub fn add_payload(&mut self, key: impl Into<String>, value: Value) {
        self.payload.insert(key.into(), value);
    }

    pub fn add_meta(&mut self, key: impl Into<String>, value: Value) {
        self.meta.insert(key.into(), value);
    }

    /// Merge a map of meta values over the existing ones (§4.1 `setMeta`).
    pub fn merge_meta(&mut self, meta: Map<String, Value>) {
        for (k, v) in meta {
            self.meta.insert(k, v);
        }
    }

    pub fn set_debug(&mut self, is_debug: bool) {
        self.system.is_debug = is_debug;
    }

    pub fn set_consumer_error(&mut self, error: Option<String>) {
        self.system.consumer_error = error;
    }

    /// Append a parent message id to the trace chain. Not idempotent by
    /// design (§4.5): relaying the same message twice appends twice.
    pub fn append_trace_id(&mut self, id: impl Into<String>) {
        self.system.trace_id.push(id.into());
    }

    pub fn trace_id(&self) -> &[String] {
        &self.system.trace_id
    }

    pub fn set_status(&mut self, code: impl Into<String>, data: Map<String, Value>) {
        self.status = EnvelopeStatus {
            code: code.into(),
            data,
        };
    }
}

/// Millisecond-precision Unix timestamp, used where a raw integer (rather
/// than an RFC3339 string) is required on the wire, e.g. the `x-delay`
/// and retry-count headers.
pub fn unix_millis_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelope_has_valid_message_id_and_defaults() {
        let env = Envelope::new("user.created").unwrap();
        assert_eq!(env.event, "user.created");
        assert_eq!(env.status.code, "pending");
        assert!(!env.system.is_debug);
        assert!(env.system.trace_id.is_empty());
    }

    #[test]
    fn rejects_invalid_event_names() {
        assert!(Envelope::new("user created!").is_err());
        assert!(Envelope::new("").is_err());
        assert!(Envelope::new("a".repeat(256)).is_err());
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut env = Envelope::new("order.paid").unwrap();
        env.add_payload("id", Value::from(42));
        env.add_meta("tenant", Value::from("acme"));
        env.append_trace_id("parent-1");

        let bytes = env.to_bytes().unwrap();
        let decoded = Envelope::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.message_id, env.message_id);
        assert_eq!(decoded.event, env.event);
        assert_eq!(decoded.payload.get("id"), Some(&Value::from(42)));
        assert_eq!(decoded.meta.get("tenant"), Some(&Value::from("acme")));
        assert_eq!(decoded.system.trace_id, vec!["parent-1".to_string()]);
    }

    #[test]
    fn from_bytes_rejects_invalid_utf8() {
        let bad = vec![0xff, 0xfe, 0xfd];
        let err = Envelope::from_bytes(&bad).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Encoding);
    }

    #[test]
    fn from_bytes_rejects_malformed_json() {
        let err = Envelope::from_bytes(b"{not json").unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Encoding);
    }

    #[test]
    fn append_trace_id_is_not_idempotent() {
        let mut env = Envelope::new("a.b").unwrap();
        env.append_trace_id("x");
        env.append_trace_id("x");
        assert_eq!(env.trace_id(), &["x".to_string(), "x".to_string()]);
        assert_eq!(env.trace_id().last().unwrap(), "x");
    }

    #[test]
    fn oversized_envelope_fails_to_encode() {
        let mut env = Envelope::new("big.event").unwrap();
        env.add_payload("blob", Value::String("x".repeat(MAX_ENVELOPE_BYTES + 1)));
        let err = env.to_bytes().unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Validation);
    }

    #[test]
    fn from_map_fills_in_missing_subtrees() {
        let value = serde_json::json!({
            "event": "user.created",
            "payload": {"id": 1}
        });
        let env = Envelope::from_map(value).unwrap();
        assert_eq!(env.status.code, "pending");
        assert!(!env.system.is_debug);
    }
}
