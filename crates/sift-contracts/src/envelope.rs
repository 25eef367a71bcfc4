//! Versioned wire envelope.
//!
//! Every record on the ingest topic is wrapped in an `Envelope` whose
//! `domain` selects the payload schema. The codec only enforces the outer
//! structure; payload decoding is the receiving handler's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

pub const SPEC_VERSION_V1: &str = "1.0";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The bytes were not a JSON object of the expected shape.
    #[error("malformed envelope: {0}")]
    Malformed(String),
    /// A structurally required field was empty or absent.
    #[error("envelope field {0:?} is required")]
    MissingField(&'static str),
}

/// Outer wire structure wrapping all domain payloads.
///
/// `payload` is kept opaque; its shape is determined by `domain`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub spec_version: String,
    pub domain: String,
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Parse and validate an envelope from raw record bytes.
    ///
    /// Uses simd-json on an owned buffer; the input itself is untouched.
    pub fn parse(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let mut buf = raw.to_vec();
        let envelope: Envelope = simd_json::from_slice(&mut buf)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.spec_version.is_empty() {
            return Err(EnvelopeError::MissingField("spec_version"));
        }
        if self.domain.is_empty() {
            return Err(EnvelopeError::MissingField("domain"));
        }
        if self.event_type.is_empty() {
            return Err(EnvelopeError::MissingField("event_type"));
        }
        if self.payload.is_null() {
            return Err(EnvelopeError::MissingField("payload"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_envelope() -> Value {
        json!({
            "spec_version": "1.0",
            "domain": "user_activity",
            "event_type": "login",
            "source": "http-ingestor",
            "timestamp": "2025-06-01T12:00:00Z",
            "payload": {"user_id": 42}
        })
    }

    #[test]
    fn parses_valid_envelope() {
        let raw = serde_json::to_vec(&valid_envelope()).unwrap();
        let envelope = Envelope::parse(&raw).unwrap();
        assert_eq!(envelope.spec_version, SPEC_VERSION_V1);
        assert_eq!(envelope.domain, "user_activity");
        assert_eq!(envelope.payload["user_id"], 42);
    }

    #[test]
    fn serialize_then_parse_is_identity() {
        let raw = serde_json::to_vec(&valid_envelope()).unwrap();
        let first = Envelope::parse(&raw).unwrap();
        let reserialized = serde_json::to_vec(&first).unwrap();
        let second = Envelope::parse(&reserialized).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_missing_required_fields() {
        for field in ["spec_version", "domain", "event_type", "payload"] {
            let mut v = valid_envelope();
            v.as_object_mut().unwrap().remove(field);
            let raw = serde_json::to_vec(&v).unwrap();
            assert!(Envelope::parse(&raw).is_err(), "field {field} should be required");
        }
    }

    #[test]
    fn rejects_empty_domain() {
        let mut v = valid_envelope();
        v["domain"] = json!("");
        let raw = serde_json::to_vec(&v).unwrap();
        match Envelope::parse(&raw) {
            Err(EnvelopeError::MissingField("domain")) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(matches!(
            Envelope::parse(b"not json at all"),
            Err(EnvelopeError::Malformed(_))
        ));
    }
}
