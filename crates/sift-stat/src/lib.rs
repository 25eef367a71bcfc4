//! Stat analyser: per-user online anomaly detection.
//!
//! Consumes user-activity envelopes, scores each event against the
//! emitting user's profile with a suite of detectors, keeps the profile
//! current in Redis, and publishes one verdict per event.

pub mod config;
pub mod consumer;
pub mod detect;
pub mod metrics;
pub mod pipeline;
pub mod producer;
pub mod profile;
