//! Stat verdict producer.
//!
//! Serializes verdicts and publishes them to the stat verdict topic,
//! keyed by the decimal user id so a user's verdicts stay ordered on one
//! partition.

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use sift_contracts::StatVerdict;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const PUBLISH_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("verdict could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("kafka publish failed: {0}")]
    Kafka(#[from] KafkaError),
}

pub struct VerdictProducer {
    producer: FutureProducer,
    topic: String,
}

impl VerdictProducer {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub async fn publish(&self, verdict: &StatVerdict) -> Result<(), ProducerError> {
        let payload = serde_json::to_vec(verdict)?;
        let key = verdict.user_id.to_string();

        self.producer
            .send(
                FutureRecord::to(&self.topic).key(&key).payload(&payload),
                Timeout::After(PUBLISH_DEADLINE),
            )
            .await
            .map_err(|(err, _record)| ProducerError::Kafka(err))?;

        debug!(
            user_id = verdict.user_id,
            event_type = %verdict.event_type,
            anomaly = verdict.anomaly,
            topic = %self.topic,
            "published stat verdict"
        );
        Ok(())
    }
}
