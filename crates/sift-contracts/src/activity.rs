//! User-activity domain payload.

use crate::envelope::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DOMAIN_USER_ACTIVITY: &str = "user_activity";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload does not decode as user activity: {0}")]
    Decode(String),
    #[error("invalid user activity payload: {0}")]
    Invalid(&'static str),
}

/// Closed set of user activity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Login,
    Payment,
    Logout,
    FailedLogin,
    PasswordReset,
    Other,
}

impl ActivityType {
    pub const ALL: [ActivityType; 6] = [
        Self::Login,
        Self::Payment,
        Self::Logout,
        Self::FailedLogin,
        Self::PasswordReset,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Payment => "payment",
            Self::Logout => "logout",
            Self::FailedLogin => "failed_login",
            Self::PasswordReset => "password_reset",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub country: String,
}

/// One user-activity event as carried in an envelope payload.
///
/// This same structure is what the profile store serializes into the
/// per-user event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserActivityPayload {
    pub user_id: i64,
    #[serde(rename = "type")]
    pub activity: ActivityType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub metadata: UserMetadata,
    #[serde(default)]
    pub additional: Map<String, Value>,
}

impl UserActivityPayload {
    /// Decode the payload of a user-activity envelope.
    ///
    /// The caller is expected to have routed on `envelope.domain` already;
    /// this only performs structural checks on the payload itself.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, PayloadError> {
        let payload: UserActivityPayload =
            serde_json::from_value(envelope.payload.clone())
                .map_err(|e| PayloadError::Decode(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.user_id == 0 {
            return Err(PayloadError::Invalid("user_id must be set"));
        }
        if self.timestamp.timestamp() == 0 && self.timestamp.timestamp_subsec_nanos() == 0 {
            return Err(PayloadError::Invalid("timestamp must be set"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope_with(payload: Value) -> Envelope {
        let raw = serde_json::to_vec(&json!({
            "spec_version": "1.0",
            "domain": DOMAIN_USER_ACTIVITY,
            "event_type": "login",
            "timestamp": "2025-06-01T12:00:00Z",
            "payload": payload,
        }))
        .unwrap();
        Envelope::parse(&raw).unwrap()
    }

    #[test]
    fn decodes_full_payload() {
        let envelope = envelope_with(json!({
            "user_id": 42,
            "type": "login",
            "timestamp": "2025-06-01T11:59:58Z",
            "session_id": "c2b7f3a0-0000-0000-0000-000000000001",
            "metadata": {"ip": "1.1.1.1", "user_agent": "UA-A", "country": "PL"},
            "additional": {"device": "mobile"}
        }));
        let payload = UserActivityPayload::from_envelope(&envelope).unwrap();
        assert_eq!(payload.user_id, 42);
        assert_eq!(payload.activity, ActivityType::Login);
        assert_eq!(payload.metadata.country, "PL");
        assert_eq!(payload.additional["device"], "mobile");
    }

    #[test]
    fn additional_defaults_to_empty_map() {
        let envelope = envelope_with(json!({
            "user_id": 7,
            "type": "logout",
            "timestamp": "2025-06-01T11:00:00Z",
            "session_id": "s",
            "metadata": {"ip": "2.2.2.2", "user_agent": "UA", "country": "DE"}
        }));
        let payload = UserActivityPayload::from_envelope(&envelope).unwrap();
        assert!(payload.additional.is_empty());
    }

    #[test]
    fn rejects_zero_user_id() {
        let envelope = envelope_with(json!({
            "user_id": 0,
            "type": "login",
            "timestamp": "2025-06-01T11:00:00Z",
        }));
        assert!(matches!(
            UserActivityPayload::from_envelope(&envelope),
            Err(PayloadError::Invalid("user_id must be set"))
        ));
    }

    #[test]
    fn rejects_unknown_activity_type() {
        let envelope = envelope_with(json!({
            "user_id": 1,
            "type": "teleport",
            "timestamp": "2025-06-01T11:00:00Z",
        }));
        assert!(matches!(
            UserActivityPayload::from_envelope(&envelope),
            Err(PayloadError::Decode(_))
        ));
    }

    #[test]
    fn activity_type_round_trips_through_snake_case() {
        for t in ActivityType::ALL {
            let s = serde_json::to_string(&t).unwrap();
            assert_eq!(s, format!("\"{}\"", t.as_str()));
            let back: ActivityType = serde_json::from_str(&s).unwrap();
            assert_eq!(back, t);
        }
    }
}
