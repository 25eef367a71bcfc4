//! Profile store client.
//!
//! Typed operations over the per-user profile keys in Redis: the event
//! history zset, the metadata seen-sets, the activity-hour hash, the
//! transition histograms and the EMA scalars. This is the only persistent
//! hot-path state, shared by every analyser instance; read-modify-write
//! races on the counters are tolerated (detection thresholds are wide).
//!
//! Every operation runs under a 5-second deadline.

use crate::detect::frequency;
use crate::detect::novelty::MetadataSightings;
use chrono::{DateTime, Duration, Timelike, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sift_contracts::{ActivityType, UserActivityPayload};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tracing::warn;

const OP_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

/// Event history retention: 72 hours.
const EVENT_TTL_SECS: i64 = 72 * 60 * 60;
/// Seen-sets and the hour histogram: 14 days.
const METADATA_TTL_SECS: i64 = 14 * 24 * 60 * 60;
/// EMA scalars: 30 days.
const EMA_TTL_SECS: u64 = 30 * 24 * 60 * 60;

const GLOBAL_TRANSITIONS_KEY: &str = "global:transitions";

#[derive(Debug, Error)]
pub enum ProfileStoreError {
    #[error("profile store operation exceeded {0:?}")]
    Deadline(std::time::Duration),
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("event could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("stored value does not decode: {0}")]
    Corrupt(String),
}

/// Result of folding one observation into a stored EMA scalar.
///
/// `prior` is `None` when this observation established the baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaUpdate {
    pub prior: Option<f64>,
    pub current: f64,
}

#[derive(Clone)]
pub struct ProfileStore {
    conn: ConnectionManager,
}

fn events_key(user_id: i64) -> String {
    format!("user:{user_id}")
}

fn ips_key(user_id: i64) -> String {
    format!("user:{user_id}:ips")
}

fn user_agents_key(user_id: i64) -> String {
    format!("user:{user_id}:user_agents")
}

fn countries_key(user_id: i64) -> String {
    format!("user:{user_id}:countries")
}

fn activity_hours_key(user_id: i64) -> String {
    format!("user:{user_id}:activity_hours")
}

fn transitions_key(user_id: i64) -> String {
    format!("user:{user_id}:transitions")
}

fn ema_key(user_id: i64, activity: ActivityType) -> String {
    format!("user:{user_id}:ema:{activity}")
}

fn ema_std_key(user_id: i64, activity: ActivityType) -> String {
    format!("user:{user_id}:ema_std:{activity}")
}

fn decode_events(raw: Vec<String>) -> Result<Vec<UserActivityPayload>, ProfileStoreError> {
    raw.into_iter()
        .map(|entry| {
            serde_json::from_str(&entry)
                .map_err(|e| ProfileStoreError::Corrupt(format!("stored event: {e}")))
        })
        .collect()
}

/// Hash of `hour -> count` into the fixed 24-bucket array.
/// Entries that do not parse are dropped with a warning.
fn parse_hour_histogram(raw: HashMap<String, String>) -> [u64; 24] {
    let mut buckets = [0u64; 24];
    for (hour, count) in raw {
        match (hour.parse::<usize>(), count.parse::<u64>()) {
            (Ok(h), Ok(c)) if h < 24 => buckets[h] = c,
            _ => warn!(%hour, %count, "dropping unparseable activity-hour entry"),
        }
    }
    buckets
}

fn parse_transition_histogram(raw: HashMap<String, String>) -> HashMap<String, u64> {
    let mut histogram = HashMap::with_capacity(raw.len());
    for (key, count) in raw {
        match count.parse::<u64>() {
            Ok(c) => {
                histogram.insert(key, c);
            }
            Err(_) => warn!(%key, %count, "dropping unparseable transition entry"),
        }
    }
    histogram
}

impl ProfileStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn deadline<T>(
        &self,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, ProfileStoreError> {
        match tokio::time::timeout(OP_DEADLINE, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProfileStoreError::Deadline(OP_DEADLINE)),
        }
    }

    /// Append the event to the user's history and touch every auxiliary
    /// profile key.
    ///
    /// The zset is pruned of entries older than the retention horizon on
    /// every write, and all auxiliary touches refresh their TTLs.
    pub async fn append_event(
        &self,
        event: &UserActivityPayload,
        now: DateTime<Utc>,
    ) -> Result<(), ProfileStoreError> {
        let serialized = serde_json::to_string(event)?;
        let score = event.timestamp.timestamp();
        let cutoff = (now - Duration::seconds(EVENT_TTL_SECS)).timestamp();
        let hour = event.timestamp.hour().to_string();

        let user_id = event.user_id;
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.zadd(events_key(user_id), serialized, score)
            .ignore()
            .zrembyscore(events_key(user_id), 0, cutoff)
            .ignore()
            .expire(events_key(user_id), EVENT_TTL_SECS)
            .ignore()
            .sadd(ips_key(user_id), &event.metadata.ip)
            .ignore()
            .expire(ips_key(user_id), METADATA_TTL_SECS)
            .ignore()
            .sadd(user_agents_key(user_id), &event.metadata.user_agent)
            .ignore()
            .expire(user_agents_key(user_id), METADATA_TTL_SECS)
            .ignore()
            .sadd(countries_key(user_id), &event.metadata.country)
            .ignore()
            .expire(countries_key(user_id), METADATA_TTL_SECS)
            .ignore()
            .hincr(activity_hours_key(user_id), hour, 1)
            .ignore()
            .expire(activity_hours_key(user_id), METADATA_TTL_SECS)
            .ignore();

        self.deadline(pipe.query_async(&mut conn)).await
    }

    /// Newest `k` events, descending by score.
    pub async fn recent_events(
        &self,
        user_id: i64,
        k: usize,
    ) -> Result<Vec<UserActivityPayload>, ProfileStoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = self
            .deadline(conn.zrevrange(events_key(user_id), 0, k as isize - 1))
            .await?;
        decode_events(raw)
    }

    /// Events with score in `[start, end]`, both in unix seconds.
    pub async fn window_events(
        &self,
        user_id: i64,
        start: i64,
        end: i64,
    ) -> Result<Vec<UserActivityPayload>, ProfileStoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = self
            .deadline(conn.zrangebyscore(events_key(user_id), start, end))
            .await?;
        decode_events(raw)
    }

    /// Record the transitions leading into the newest stored event.
    ///
    /// Expects the event to have been appended already; with fewer than
    /// three stored events there is no second-order path and nothing is
    /// recorded. Both the user and the global histograms receive the
    /// first-order and second-order keys.
    pub async fn record_transition(&self, user_id: i64) -> Result<(), ProfileStoreError> {
        let newest = self.recent_events(user_id, 3).await?;
        if newest.len() < 3 {
            return Ok(());
        }
        let (current, prev1, prev2) = (&newest[0], &newest[1], &newest[2]);
        let first_order = format!("{}->{}", prev1.activity, current.activity);
        let second_order = format!(
            "{}->{}->{}",
            prev2.activity, prev1.activity, current.activity
        );

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.hincr(transitions_key(user_id), &first_order, 1)
            .ignore()
            .hincr(transitions_key(user_id), &second_order, 1)
            .ignore()
            .hincr(GLOBAL_TRANSITIONS_KEY, &first_order, 1)
            .ignore()
            .hincr(GLOBAL_TRANSITIONS_KEY, &second_order, 1)
            .ignore();
        self.deadline(pipe.query_async(&mut conn)).await
    }

    /// Which of the event's metadata values the profile has seen before.
    pub async fn metadata_membership(
        &self,
        user_id: i64,
        metadata: &sift_contracts::UserMetadata,
    ) -> Result<MetadataSightings, ProfileStoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.sismember(ips_key(user_id), &metadata.ip)
            .sismember(user_agents_key(user_id), &metadata.user_agent)
            .sismember(countries_key(user_id), &metadata.country);
        let (ip_known, user_agent_known, country_known): (bool, bool, bool) =
            self.deadline(pipe.query_async(&mut conn)).await?;
        Ok(MetadataSightings {
            ip_known,
            user_agent_known,
            country_known,
        })
    }

    pub async fn ema_update(
        &self,
        user_id: i64,
        activity: ActivityType,
        observation: f64,
        alpha: f64,
    ) -> Result<EmaUpdate, ProfileStoreError> {
        self.fold_scalar(ema_key(user_id, activity), observation, alpha)
            .await
    }

    pub async fn ema_std_update(
        &self,
        user_id: i64,
        activity: ActivityType,
        deviation: f64,
        alpha: f64,
    ) -> Result<EmaUpdate, ProfileStoreError> {
        self.fold_scalar(ema_std_key(user_id, activity), deviation, alpha)
            .await
    }

    async fn fold_scalar(
        &self,
        key: String,
        observation: f64,
        alpha: f64,
    ) -> Result<EmaUpdate, ProfileStoreError> {
        let mut conn = self.conn.clone();
        let prior: Option<f64> = self.deadline(conn.get(&key)).await?;
        let current = frequency::fold(prior, observation, alpha);
        self.deadline(conn.set_ex::<_, _, ()>(&key, current, EMA_TTL_SECS))
            .await?;
        Ok(EmaUpdate { prior, current })
    }

    /// Full 24-bucket activity-hour histogram; missing hours read as zero.
    pub async fn hour_histogram(&self, user_id: i64) -> Result<[u64; 24], ProfileStoreError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = self
            .deadline(conn.hgetall(activity_hours_key(user_id)))
            .await?;
        Ok(parse_hour_histogram(raw))
    }

    pub async fn transition_histogram(
        &self,
        user_id: i64,
    ) -> Result<HashMap<String, u64>, ProfileStoreError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> =
            self.deadline(conn.hgetall(transitions_key(user_id))).await?;
        Ok(parse_transition_histogram(raw))
    }

    pub async fn global_transition_histogram(
        &self,
    ) -> Result<HashMap<String, u64>, ProfileStoreError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> =
            self.deadline(conn.hgetall(GLOBAL_TRANSITIONS_KEY)).await?;
        Ok(parse_transition_histogram(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_user() {
        assert_eq!(events_key(42), "user:42");
        assert_eq!(ips_key(42), "user:42:ips");
        assert_eq!(user_agents_key(42), "user:42:user_agents");
        assert_eq!(countries_key(42), "user:42:countries");
        assert_eq!(activity_hours_key(42), "user:42:activity_hours");
        assert_eq!(transitions_key(42), "user:42:transitions");
        assert_eq!(ema_key(42, ActivityType::Login), "user:42:ema:login");
        assert_eq!(
            ema_std_key(42, ActivityType::FailedLogin),
            "user:42:ema_std:failed_login"
        );
    }

    #[test]
    fn hour_histogram_tolerates_junk_entries() {
        let raw = HashMap::from([
            ("3".to_string(), "7".to_string()),
            ("23".to_string(), "1".to_string()),
            ("not-an-hour".to_string(), "9".to_string()),
            ("25".to_string(), "9".to_string()),
            ("4".to_string(), "NaN".to_string()),
        ]);
        let buckets = parse_hour_histogram(raw);
        assert_eq!(buckets[3], 7);
        assert_eq!(buckets[23], 1);
        assert_eq!(buckets[4], 0);
        assert_eq!(buckets.iter().sum::<u64>(), 8);
    }

    #[test]
    fn transition_histogram_drops_unparseable_counts() {
        let raw = HashMap::from([
            ("login->logout".to_string(), "25".to_string()),
            ("login->payment".to_string(), "zero".to_string()),
        ]);
        let histogram = parse_transition_histogram(raw);
        assert_eq!(histogram.get("login->logout"), Some(&25));
        assert!(!histogram.contains_key("login->payment"));
    }

    #[test]
    fn corrupt_stored_event_surfaces_as_error() {
        let result = decode_events(vec!["{not json".to_string()]);
        assert!(matches!(result, Err(ProfileStoreError::Corrupt(_))));
    }
}
