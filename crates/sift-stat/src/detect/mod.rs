//! Detector suite.
//!
//! Each detector is pure logic over data the orchestrator has already
//! fetched from the profile store: set-membership flags, decoded recent
//! events, transition histograms, the 24-bucket activity-hour array.
//! Keeping the store plumbing out of the detectors makes every decision
//! rule testable with plain values.

pub mod frequency;
pub mod hours;
pub mod markov;
pub mod novelty;
pub mod transition;

use sift_contracts::AnomalyType;

/// A single detector's positive finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub anomaly_type: AnomalyType,
    pub message: String,
}

impl Detection {
    pub fn new(anomaly_type: AnomalyType, message: impl Into<String>) -> Self {
        Self {
            anomaly_type,
            message: message.into(),
        }
    }
}
