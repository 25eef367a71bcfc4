//! Analyser verdict records.
//!
//! A verdict describes whether one source (the stat analyser or the ML
//! scorer) considers a single event anomalous, and why. Verdicts are
//! published per event and fanned back in per session by the aggregator.

use crate::activity::ActivityType;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const SOURCE_STAT: &str = "stat";
pub const SOURCE_ML: &str = "ml";

/// Closed taxonomy of anomaly tags carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    NewIp,
    NewUserAgent,
    NewCountry,
    InvalidTransition,
    UnknownTransitionRule,
    MarkovLowProbability,
    EmaOutlier,
    ZscoreOutlier,
    TimeDeviation,
    NoVariance,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewIp => "new_ip",
            Self::NewUserAgent => "new_user_agent",
            Self::NewCountry => "new_country",
            Self::InvalidTransition => "invalid_transition",
            Self::UnknownTransitionRule => "unknown_transition_rule",
            Self::MarkovLowProbability => "markov_low_probability",
            Self::EmaOutlier => "ema_outlier",
            Self::ZscoreOutlier => "zscore_outlier",
            Self::TimeDeviation => "time_deviation",
            Self::NoVariance => "no_variance",
        }
    }
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stat analyser verdict for one event.
///
/// `anomaly_type` is the empty string on the wire when the event is normal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatVerdict {
    pub user_id: i64,
    pub session_id: String,
    pub event_type: ActivityType,
    pub anomaly: bool,
    #[serde(with = "empty_string_tag")]
    pub anomaly_type: Option<AnomalyType>,
    pub message: String,
    #[serde(with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

/// ML scorer verdict for one session window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlResult {
    pub user_id: i64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub anomaly: bool,
    pub score: f64,
    pub threshold: f64,
    #[serde(default)]
    pub event_count: i32,
    #[serde(default)]
    pub unique_events: i32,
    #[serde(default)]
    pub source: String,
}

/// `Option<AnomalyType>` as a bare tag, with `None` encoded as `""`.
mod empty_string_tag {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<AnomalyType>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(tag) => serializer.serialize_str(tag.as_str()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<AnomalyType>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(None);
        }
        serde_json::from_value(serde_json::Value::String(raw))
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

/// RFC 3339 with fixed nanosecond precision, UTC.
mod rfc3339_nanos {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn verdict(anomaly_type: Option<AnomalyType>) -> StatVerdict {
        StatVerdict {
            user_id: 42,
            session_id: "s-1".into(),
            event_type: ActivityType::Login,
            anomaly: anomaly_type.is_some(),
            anomaly_type,
            message: "IP address never seen before".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            source: SOURCE_STAT.into(),
        }
    }

    #[test]
    fn anomaly_type_serializes_as_bare_tag() {
        let json = serde_json::to_value(verdict(Some(AnomalyType::NewIp))).unwrap();
        assert_eq!(json["anomaly_type"], "new_ip");
        assert_eq!(json["source"], "stat");
    }

    #[test]
    fn normal_verdict_has_empty_anomaly_type() {
        let json = serde_json::to_value(verdict(None)).unwrap();
        assert_eq!(json["anomaly_type"], "");
    }

    #[test]
    fn timestamp_is_rfc3339_nanos_utc() {
        let json = serde_json::to_value(verdict(None)).unwrap();
        assert_eq!(json["timestamp"], "2025-06-01T12:00:00.000000000Z");
    }

    #[test]
    fn verdict_round_trips() {
        let original = verdict(Some(AnomalyType::MarkovLowProbability));
        let bytes = serde_json::to_vec(&original).unwrap();
        let back: StatVerdict = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn ml_result_decodes_with_defaults() {
        let back: MlResult = serde_json::from_str(
            r#"{"user_id":7,"session_id":"s","timestamp":"2025-06-01T12:00:00Z",
                "anomaly":false,"score":0.2,"threshold":0.7}"#,
        )
        .unwrap();
        assert_eq!(back.event_count, 0);
        assert_eq!(back.source, "");
    }
}
