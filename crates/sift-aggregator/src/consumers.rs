//! Verdict and raw-event consumers.
//!
//! Each topic gets its own consumer loop. Every record is persisted to
//! the cold store before the aggregator is notified; a persistence
//! failure is logged but does not block aggregation, and a decode failure
//! skips the record (redelivery cannot fix a malformed payload).

use crate::correlate::{AggregateSink, Aggregator};
use crate::metrics;
use crate::store::ColdStore;
use futures::StreamExt;
use rdkafka::consumer::StreamConsumer;
use rdkafka::message::Message;
use sift_contracts::{Envelope, MlResult, StatVerdict, UserActivityPayload, DOMAIN_USER_ACTIVITY};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct StatVerdictConsumer<S: AggregateSink> {
    consumer: StreamConsumer,
    store: ColdStore,
    aggregator: Arc<Aggregator<S>>,
}

impl<S: AggregateSink> StatVerdictConsumer<S> {
    pub fn new(consumer: StreamConsumer, store: ColdStore, aggregator: Arc<Aggregator<S>>) -> Self {
        Self {
            consumer,
            store,
            aggregator,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("stat verdict consumer started");
        let mut stream = self.consumer.stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = stream.next() => {
                    let Some(message) = message else { break };
                    let message = match message {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(error = %err, "kafka consumer error");
                            continue;
                        }
                    };
                    let Some(payload) = message.payload() else { continue };
                    let verdict: StatVerdict = match serde_json::from_slice(payload) {
                        Ok(verdict) => verdict,
                        Err(err) => {
                            warn!(error = %err, "skipping undecodable stat verdict");
                            continue;
                        }
                    };
                    metrics::STAT_RECORDS.inc();

                    if let Err(err) = self.store.insert_stat_verdict(&verdict).await {
                        metrics::INSERT_FAILURES.inc();
                        error!(error = %err, session_id = %verdict.session_id, "stat verdict insert failed");
                    }
                    if let Err(err) = self.aggregator.on_stat_result(verdict).await {
                        // Entry stays buffered; retried on the next arrival
                        // for the session or swept after the idle limit.
                        error!(error = %err, "aggregation after stat verdict failed");
                    }
                }
            }
        }
        info!("stat verdict consumer stopped");
    }
}

pub struct MlResultConsumer<S: AggregateSink> {
    consumer: StreamConsumer,
    store: ColdStore,
    aggregator: Arc<Aggregator<S>>,
}

impl<S: AggregateSink> MlResultConsumer<S> {
    pub fn new(consumer: StreamConsumer, store: ColdStore, aggregator: Arc<Aggregator<S>>) -> Self {
        Self {
            consumer,
            store,
            aggregator,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("ml result consumer started");
        let mut stream = self.consumer.stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = stream.next() => {
                    let Some(message) = message else { break };
                    let message = match message {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(error = %err, "kafka consumer error");
                            continue;
                        }
                    };
                    let Some(payload) = message.payload() else { continue };
                    let result: MlResult = match serde_json::from_slice(payload) {
                        Ok(result) => result,
                        Err(err) => {
                            warn!(error = %err, "skipping undecodable ml result");
                            continue;
                        }
                    };
                    metrics::ML_RECORDS.inc();

                    if let Err(err) = self.store.insert_ml_result(&result).await {
                        metrics::INSERT_FAILURES.inc();
                        error!(error = %err, session_id = %result.session_id, "ml result insert failed");
                    }
                    if let Err(err) = self.aggregator.on_ml_result(result).await {
                        error!(error = %err, "aggregation after ml result failed");
                    }
                }
            }
        }
        info!("ml result consumer stopped");
    }
}

/// Archives every user-activity event from the ingest topic, so an
/// aggregation that never completes can still be reconstructed.
pub struct RawEventConsumer {
    consumer: StreamConsumer,
    store: ColdStore,
}

impl RawEventConsumer {
    pub fn new(consumer: StreamConsumer, store: ColdStore) -> Self {
        Self { consumer, store }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("raw event consumer started");
        let mut stream = self.consumer.stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = stream.next() => {
                    let Some(message) = message else { break };
                    let message = match message {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(error = %err, "kafka consumer error");
                            continue;
                        }
                    };
                    let Some(payload) = message.payload() else { continue };
                    self.handle_record(payload).await;
                }
            }
        }
        info!("raw event consumer stopped");
    }

    async fn handle_record(&self, raw: &[u8]) {
        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "skipping malformed envelope");
                return;
            }
        };
        if envelope.domain != DOMAIN_USER_ACTIVITY {
            debug!(domain = %envelope.domain, "skipping domain");
            return;
        }
        let event = match UserActivityPayload::from_envelope(&envelope) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "skipping invalid user activity payload");
                return;
            }
        };
        metrics::RAW_RECORDS.inc();

        if let Err(err) = self.store.insert_event(&event).await {
            metrics::INSERT_FAILURES.inc();
            error!(error = %err, user_id = event.user_id, "raw event insert failed");
        }
    }
}
