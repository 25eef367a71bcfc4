//! Environment-driven configuration.
//!
//! Defaults are local-dev friendly; a misconfigured startup is fatal and
//! exits non-zero. Outside Docker a `.env` file is honored.

use crate::consumer::DispatchMode;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::StreamConsumer;
use rdkafka::error::KafkaError;
use rdkafka::producer::FutureProducer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("kafka client: {0}")]
    Kafka(#[from] KafkaError),
    #[error("redis client: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Clone)]
pub struct StatConfig {
    pub brokers: String,
    pub topic: String,
    pub group: String,
    pub result_topic: String,
    pub redis_url: String,
    pub health_addr: String,
    /// 0 = sequential dispatch; otherwise the worker-pool size.
    pub workers: usize,
}

pub fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Load the `.env` file when running outside Docker, as local-dev sugar.
pub fn load_dotenv() {
    if std::env::var("RUNNING_IN_DOCKER").is_err() {
        let _ = dotenvy::dotenv();
    }
}

impl StatConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let workers_raw = env_string("ANALYSER_WORKERS", "0");
        let workers = workers_raw
            .parse::<usize>()
            .map_err(|_| ConfigError::Invalid {
                key: "ANALYSER_WORKERS",
                value: workers_raw,
            })?;

        Ok(Self {
            brokers: env_string("KAFKA_URL", "localhost:9092"),
            topic: env_string("KAFKA_TOPIC", "events"),
            group: env_string("KAFKA_CONSUMER_GROUP", "stat-analyser"),
            result_topic: env_string("KAFKA_RESULT_TOPIC", "stat_out"),
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            health_addr: env_string("HEALTH_ADDR", "0.0.0.0:8090"),
            workers,
        })
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        if self.workers == 0 {
            DispatchMode::Sequential
        } else {
            DispatchMode::WorkerPool {
                workers: self.workers,
            }
        }
    }

    pub fn consumer(&self) -> Result<StreamConsumer, ConfigError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()?;
        Ok(consumer)
    }

    pub fn producer(&self) -> Result<FutureProducer, ConfigError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(producer)
    }

    pub async fn redis(&self) -> Result<redis::aio::ConnectionManager, ConfigError> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        Ok(redis::aio::ConnectionManager::new(client).await?)
    }
}
