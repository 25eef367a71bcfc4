//! Session correlation buffer.
//!
//! One map entry per session, guarded by a single mutex. Critical
//! sections never perform I/O: the aggregated row is assembled under the
//! lock, written outside it, and the entry is deleted only after the
//! write succeeds. A failed sink leaves the entry for the next arrival
//! or the sweeper.

use crate::metrics;
use crate::store::SinkError;
use async_trait::async_trait;
use sift_contracts::{MlResult, StatVerdict};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sessions idle longer than this are discarded without emission.
pub const SESSION_IDLE_LIMIT: Duration = Duration::from_secs(5 * 60);
/// Sweeper cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One aggregated row, keyed by session.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRecord {
    pub session_id: String,
    pub user_id: i64,
    pub ml_anomaly: bool,
    pub ml_score: f64,
    pub ml_threshold: f64,
    pub stat_anomaly: bool,
    /// ", "-joined unique stat anomaly tags; `None` when all stat
    /// verdicts were normal.
    pub anomaly_type: Option<String>,
    pub event_count: i32,
    pub unique_events: i32,
}

#[async_trait]
pub trait AggregateSink: Send + Sync {
    async fn write(&self, record: &AggregatedRecord) -> Result<(), SinkError>;
}

#[derive(Debug, Default)]
struct AggregatorEntry {
    ml: Option<MlResult>,
    stat: Vec<StatVerdict>,
    last_event: Option<Instant>,
}

impl AggregatorEntry {
    fn touch(&mut self) {
        self.last_event = Some(Instant::now());
    }

    fn idle_for(&self, limit: Duration) -> bool {
        self.last_event
            .map(|t| t.elapsed() > limit)
            .unwrap_or(true)
    }

    /// Assemble the row if both sides have arrived.
    fn assemble(&self) -> Option<AggregatedRecord> {
        let ml = self.ml.as_ref()?;
        if self.stat.is_empty() {
            return None;
        }

        let stat_anomaly = self.stat.iter().any(|s| s.anomaly);
        let mut tags: Vec<&str> = Vec::new();
        for verdict in &self.stat {
            if let (true, Some(tag)) = (verdict.anomaly, verdict.anomaly_type) {
                if !tags.contains(&tag.as_str()) {
                    tags.push(tag.as_str());
                }
            }
        }
        let anomaly_type = if tags.is_empty() {
            None
        } else {
            Some(tags.join(", "))
        };

        Some(AggregatedRecord {
            session_id: ml.session_id.clone(),
            user_id: ml.user_id,
            ml_anomaly: ml.anomaly,
            ml_score: ml.score,
            ml_threshold: ml.threshold,
            stat_anomaly,
            anomaly_type,
            event_count: ml.event_count,
            unique_events: ml.unique_events,
        })
    }
}

pub struct Aggregator<S: AggregateSink> {
    sink: S,
    sessions: Mutex<HashMap<String, AggregatorEntry>>,
}

impl<S: AggregateSink> Aggregator<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn on_ml_result(&self, result: MlResult) -> Result<(), SinkError> {
        let session_id = result.session_id.clone();
        {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            let entry = sessions.entry(session_id.clone()).or_default();
            entry.ml = Some(result);
            entry.touch();
        }
        self.try_emit(&session_id).await
    }

    pub async fn on_stat_result(&self, verdict: StatVerdict) -> Result<(), SinkError> {
        let session_id = verdict.session_id.clone();
        {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            let entry = sessions.entry(session_id.clone()).or_default();
            entry.stat.push(verdict);
            entry.touch();
        }
        self.try_emit(&session_id).await
    }

    async fn try_emit(&self, session_id: &str) -> Result<(), SinkError> {
        let record = {
            let sessions = self.sessions.lock().expect("session map poisoned");
            match sessions.get(session_id).and_then(AggregatorEntry::assemble) {
                Some(record) => record,
                None => return Ok(()), // one side still missing
            }
        };

        self.sink.write(&record).await?;
        metrics::AGGREGATED_WRITTEN.inc();
        debug!(session_id, "aggregated record written");

        self.sessions
            .lock()
            .expect("session map poisoned")
            .remove(session_id);
        Ok(())
    }

    /// Drop sessions idle past the limit. Returns how many were removed.
    pub fn sweep(&self, limit: Duration) -> usize {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let before = sessions.len();
        sessions.retain(|_, entry| !entry.idle_for(limit));
        before - sessions.len()
    }

    pub fn buffered_sessions(&self) -> usize {
        self.sessions.lock().expect("session map poisoned").len()
    }

    /// Periodic eviction loop; bounds memory when one side of a session
    /// never arrives.
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await; // immediate first tick is a no-op
        info!("session sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = self.sweep(SESSION_IDLE_LIMIT);
                    if swept > 0 {
                        metrics::SESSIONS_SWEPT.inc_by(swept as u64);
                        warn!(swept, "evicted incomplete sessions");
                    }
                }
            }
        }
        info!("session sweeper stopped");
    }
}
