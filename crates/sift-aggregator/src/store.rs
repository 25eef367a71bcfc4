//! Cold-store writers.
//!
//! Raw events, stat verdicts, ML verdicts and aggregated records all land
//! in Postgres. Inserts carry a 10-second deadline. The aggregated table
//! is unique on `session_id`, so replays and concurrent retries collapse
//! into one row.

use crate::correlate::{AggregateSink, AggregatedRecord};
use async_trait::async_trait;
use sift_contracts::{MlResult, StatVerdict, UserActivityPayload};
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

const WRITE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("relational write exceeded {0:?}")]
    Deadline(Duration),
    #[error("postgres: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct ColdStore {
    pool: PgPool,
}

impl ColdStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, SinkError> {
        match tokio::time::timeout(WRITE_DEADLINE, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SinkError::Deadline(WRITE_DEADLINE)),
        }
    }

    pub async fn insert_event(&self, event: &UserActivityPayload) -> Result<(), SinkError> {
        let additional = serde_json::to_value(&event.additional)?;
        let query = sqlx::query(
            r#"INSERT INTO events
                   (user_id, event_type, timestamp, ip, user_agent, country, session_id, metadata)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(event.user_id)
        .bind(event.activity.as_str())
        .bind(event.timestamp)
        .bind(&event.metadata.ip)
        .bind(&event.metadata.user_agent)
        .bind(&event.metadata.country)
        .bind(&event.session_id)
        .bind(additional)
        .execute(&self.pool);
        self.deadline(query).await?;
        Ok(())
    }

    pub async fn insert_stat_verdict(&self, verdict: &StatVerdict) -> Result<(), SinkError> {
        let query = sqlx::query(
            r#"INSERT INTO stat_results
                   (user_id, session_id, event_type, anomaly, anomaly_type, message, timestamp)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(verdict.user_id)
        .bind(&verdict.session_id)
        .bind(verdict.event_type.as_str())
        .bind(verdict.anomaly)
        .bind(verdict.anomaly_type.map(|t| t.as_str()))
        .bind(&verdict.message)
        .bind(verdict.timestamp)
        .execute(&self.pool);
        self.deadline(query).await?;
        Ok(())
    }

    pub async fn insert_ml_result(&self, result: &MlResult) -> Result<(), SinkError> {
        let query = sqlx::query(
            r#"INSERT INTO ml_results
                   (user_id, session_id, anomaly, score, threshold, event_count, timestamp)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(result.user_id)
        .bind(&result.session_id)
        .bind(result.anomaly)
        .bind(result.score)
        .bind(result.threshold)
        .bind(result.event_count)
        .bind(result.timestamp)
        .execute(&self.pool);
        self.deadline(query).await?;
        Ok(())
    }
}

#[async_trait]
impl AggregateSink for ColdStore {
    async fn write(&self, record: &AggregatedRecord) -> Result<(), SinkError> {
        let query = sqlx::query(
            r#"INSERT INTO aggregated_results
                   (session_id, user_id, ml_anomaly, ml_score, ml_threshold,
                    stat_anomaly, anomaly_type, event_count, unique_events)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
               ON CONFLICT (session_id) DO NOTHING"#,
        )
        .bind(&record.session_id)
        .bind(record.user_id)
        .bind(record.ml_anomaly)
        .bind(record.ml_score)
        .bind(record.ml_threshold)
        .bind(record.stat_anomaly)
        .bind(record.anomaly_type.as_deref())
        .bind(record.event_count)
        .bind(record.unique_events)
        .execute(&self.pool);
        self.deadline(query).await?;
        Ok(())
    }
}
