//! Per-event analysis pipeline.
//!
//! Envelopes are dispatched by domain through a handler registry; the
//! user-activity handler runs the detector suite in two phases and then
//! unconditionally persists the event and publishes a verdict. Persisting
//! *after* detection is deliberate: the novelty checks depend on the
//! current event being absent from the profile.

use crate::detect::{frequency, hours, markov, novelty, transition, Detection};
use crate::metrics;
use crate::producer::{ProducerError, VerdictProducer};
use crate::profile::{ProfileStore, ProfileStoreError};
use async_trait::async_trait;
use chrono::{Timelike, Utc};
use sift_contracts::{
    AnomalyType, Envelope, StatVerdict, UserActivityPayload, DOMAIN_USER_ACTIVITY, SOURCE_STAT,
};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Errors that abort the current event; the record is left uncommitted
/// and redelivery is the retry mechanism.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] ProfileStoreError),
    #[error(transparent)]
    Publish(#[from] ProducerError),
}

/// How a record was resolved. Every variant is acknowledgeable; retryable
/// failures travel as `PipelineError` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Processed,
    /// No handler is registered for the envelope's domain.
    UnsupportedDomain(String),
    /// The envelope or payload does not decode; redelivery cannot fix it.
    Malformed(String),
}

#[async_trait]
pub trait DomainHandler: Send + Sync {
    fn domain(&self) -> &str;
    async fn handle(&self, envelope: &Envelope) -> Result<Disposition, PipelineError>;
}

/// Lookup table of domain handlers; a small closed set, registered once
/// at startup.
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn DomainHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Box<dyn DomainHandler>>) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|h| (h.domain().to_string(), h))
            .collect();
        Self { handlers }
    }

    /// Parse raw record bytes and route them to the matching handler.
    pub async fn dispatch(&self, raw: &[u8]) -> Result<Disposition, PipelineError> {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => return Ok(Disposition::Malformed(err.to_string())),
        };
        match self.handlers.get(&envelope.domain) {
            Some(handler) => handler.handle(&envelope).await,
            None => Ok(Disposition::UnsupportedDomain(envelope.domain)),
        }
    }
}

/// The user-activity domain: detector suite plus profile upkeep.
pub struct UserActivityHandler {
    store: ProfileStore,
    producer: VerdictProducer,
}

#[async_trait]
impl DomainHandler for UserActivityHandler {
    fn domain(&self) -> &str {
        DOMAIN_USER_ACTIVITY
    }

    async fn handle(&self, envelope: &Envelope) -> Result<Disposition, PipelineError> {
        let event = match UserActivityPayload::from_envelope(envelope) {
            Ok(event) => event,
            Err(err) => return Ok(Disposition::Malformed(err.to_string())),
        };
        self.process(event).await?;
        Ok(Disposition::Processed)
    }
}

impl UserActivityHandler {
    pub fn new(store: ProfileStore, producer: VerdictProducer) -> Self {
        Self { store, producer }
    }

    /// Analyse, persist, publish; in that order, always all three.
    async fn process(&self, event: UserActivityPayload) -> Result<(), PipelineError> {
        let detection = self.analyse(&event).await?;

        self.store.append_event(&event, Utc::now()).await?;
        self.store.record_transition(event.user_id).await?;

        if let Some(detection) = &detection {
            metrics::ANOMALIES_TOTAL
                .with_label_values(&[detection.anomaly_type.as_str()])
                .inc();
        }

        let verdict = verdict_for(&event, detection);
        self.producer.publish(&verdict).await?;
        Ok(())
    }

    /// Run the detectors in priority order, stopping at the first finding.
    ///
    /// Phase A consults cached profile data and rules; phase B the
    /// statistical baselines.
    async fn analyse(
        &self,
        event: &UserActivityPayload,
    ) -> Result<Option<Detection>, PipelineError> {
        let user_id = event.user_id;

        // Phase A: novelty, transition validity, Markov surprise.
        let sightings = self.store.metadata_membership(user_id, &event.metadata).await?;
        if let Some(found) = novelty::check(&sightings) {
            return Ok(Some(found));
        }

        let recent = self.store.recent_events(user_id, 2).await?;
        if let Some(found) = transition::check(recent.first(), event) {
            return Ok(Some(found));
        }

        if !recent.is_empty() {
            let user_histogram = self.store.transition_histogram(user_id).await?;
            let global_histogram = self.store.global_transition_histogram().await?;
            if let Some(found) =
                markov::check(&recent, event.activity, &user_histogram, &global_histogram)
            {
                return Ok(Some(found));
            }
        }

        // Phase B: EMA frequency, activity hour.
        if let Some(found) = self.check_frequency(event).await? {
            return Ok(Some(found));
        }

        let histogram = self.store.hour_histogram(user_id).await?;
        Ok(hours::check(&histogram, event.timestamp.hour()))
    }

    async fn check_frequency(
        &self,
        event: &UserActivityPayload,
    ) -> Result<Option<Detection>, PipelineError> {
        let window = frequency::window_for(event.activity);
        let now = Utc::now();
        let events = self
            .store
            .window_events(event.user_id, (now - window).timestamp(), now.timestamp())
            .await?;
        let observed = events
            .iter()
            .filter(|e| e.activity == event.activity)
            .count() as f64;

        let ema = self
            .store
            .ema_update(event.user_id, event.activity, observed, frequency::ALPHA)
            .await?;
        let deviation = frequency::deviation(observed, ema.prior);
        let ema_std = self
            .store
            .ema_std_update(event.user_id, event.activity, deviation, frequency::ALPHA)
            .await?;

        let decision = frequency::evaluate(deviation, ema_std.current);
        if decision.no_variance {
            debug!(
                user_id = event.user_id,
                event_type = %event.activity,
                tag = %AnomalyType::NoVariance,
                "frequency baseline has no variance yet"
            );
            return Ok(None);
        }
        if decision.fired {
            return Ok(Some(Detection::new(
                AnomalyType::EmaOutlier,
                format!(
                    "Occurrences of {} spiked: count={observed} ema={:.2} ema_std={:.2}",
                    event.activity, ema.current, ema_std.current
                ),
            )));
        }
        Ok(None)
    }
}

/// Build the verdict record for an analysed event.
pub fn verdict_for(event: &UserActivityPayload, detection: Option<Detection>) -> StatVerdict {
    let (anomaly, anomaly_type, message) = match detection {
        Some(found) => (true, Some(found.anomaly_type), found.message),
        None => (false, None, "No anomaly detected".to_string()),
    };
    StatVerdict {
        user_id: event.user_id,
        session_id: event.session_id.clone(),
        event_type: event.activity,
        anomaly,
        anomaly_type,
        message,
        timestamp: Utc::now(),
        source: SOURCE_STAT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_contracts::ActivityType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        domain: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DomainHandler for CountingHandler {
        fn domain(&self) -> &str {
            self.domain
        }

        async fn handle(&self, _envelope: &Envelope) -> Result<Disposition, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Disposition::Processed)
        }
    }

    fn registry_with(domain: &'static str) -> (HandlerRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new(vec![Box::new(CountingHandler {
            domain,
            calls: calls.clone(),
        })]);
        (registry, calls)
    }

    fn raw_envelope(domain: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "spec_version": "1.0",
            "domain": domain,
            "event_type": "login",
            "timestamp": "2025-06-01T12:00:00Z",
            "payload": {"user_id": 42}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn dispatch_routes_to_matching_domain() {
        let (registry, calls) = registry_with(DOMAIN_USER_ACTIVITY);
        let disposition = registry.dispatch(&raw_envelope(DOMAIN_USER_ACTIVITY)).await.unwrap();
        assert_eq!(disposition, Disposition::Processed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_skips_unsupported_domain() {
        let (registry, calls) = registry_with(DOMAIN_USER_ACTIVITY);
        let disposition = registry.dispatch(&raw_envelope("billing")).await.unwrap();
        assert_eq!(
            disposition,
            Disposition::UnsupportedDomain("billing".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispatch_marks_garbage_as_malformed() {
        let (registry, _) = registry_with(DOMAIN_USER_ACTIVITY);
        let disposition = registry.dispatch(b"{\"domain\":").await.unwrap();
        assert!(matches!(disposition, Disposition::Malformed(_)));
    }

    fn event() -> UserActivityPayload {
        UserActivityPayload {
            user_id: 42,
            activity: ActivityType::Login,
            timestamp: Utc::now(),
            session_id: "s-1".into(),
            metadata: Default::default(),
            additional: Default::default(),
        }
    }

    #[test]
    fn anomalous_verdict_carries_the_detection() {
        let verdict = verdict_for(
            &event(),
            Some(Detection::new(
                AnomalyType::NewIp,
                "IP address never seen before",
            )),
        );
        assert!(verdict.anomaly);
        assert_eq!(verdict.anomaly_type, Some(AnomalyType::NewIp));
        assert_eq!(verdict.source, SOURCE_STAT);
        assert_eq!(verdict.session_id, "s-1");
    }

    #[test]
    fn normal_verdict_is_tagless() {
        let verdict = verdict_for(&event(), None);
        assert!(!verdict.anomaly);
        assert_eq!(verdict.anomaly_type, None);
        assert_eq!(verdict.message, "No anomaly detected");
    }
}
