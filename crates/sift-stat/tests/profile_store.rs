//! Profile store contract tests.
//!
//! These need a live Redis (REDIS_URL, default localhost) and are ignored
//! by default; run with `cargo test -- --ignored`.

use chrono::{Duration, Timelike, Utc};
use sift_contracts::{ActivityType, UserActivityPayload, UserMetadata};
use sift_stat::detect::frequency;
use sift_stat::profile::ProfileStore;

async fn store() -> ProfileStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
    let client = redis::Client::open(url).expect("redis url");
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .expect("redis connection");
    ProfileStore::new(conn)
}

fn event(user_id: i64, activity: ActivityType, offset_secs: i64) -> UserActivityPayload {
    UserActivityPayload {
        user_id,
        activity,
        timestamp: Utc::now() - Duration::seconds(offset_secs),
        session_id: uuid::Uuid::new_v4().to_string(),
        metadata: UserMetadata {
            ip: "1.1.1.1".into(),
            user_agent: "UA-A".into(),
            country: "PL".into(),
        },
        additional: Default::default(),
    }
}

// Distinct user ids per test so concurrent runs do not interfere.

#[tokio::test]
#[ignore]
async fn append_makes_event_and_metadata_visible() {
    let store = store().await;
    let e = event(910_001, ActivityType::Login, 0);

    store.append_event(&e, Utc::now()).await.unwrap();

    let recent = store.recent_events(e.user_id, 1).await.unwrap();
    assert_eq!(recent[0].session_id, e.session_id);

    let seen = store
        .metadata_membership(e.user_id, &e.metadata)
        .await
        .unwrap();
    assert!(seen.ip_known && seen.user_agent_known && seen.country_known);

    let histogram = store.hour_histogram(e.user_id).await.unwrap();
    assert!(histogram[e.timestamp.hour() as usize] >= 1);
}

#[tokio::test]
#[ignore]
async fn append_prunes_beyond_retention() {
    let store = store().await;
    let user = 910_002;
    let stale = event(user, ActivityType::Login, 73 * 3600);
    let fresh = event(user, ActivityType::Logout, 60);

    store.append_event(&stale, Utc::now()).await.unwrap();
    store.append_event(&fresh, Utc::now()).await.unwrap();

    let all = store
        .window_events(user, 0, Utc::now().timestamp())
        .await
        .unwrap();
    assert!(all.iter().all(|e| e.activity != ActivityType::Login));
}

#[tokio::test]
#[ignore]
async fn transitions_need_three_events_and_feed_both_histograms() {
    let store = store().await;
    let user = 910_003;

    for (i, activity) in [ActivityType::Login, ActivityType::Payment].iter().enumerate() {
        store
            .append_event(&event(user, *activity, 100 - i as i64), Utc::now())
            .await
            .unwrap();
        store.record_transition(user).await.unwrap();
    }
    assert!(store.transition_histogram(user).await.unwrap().is_empty());

    store
        .append_event(&event(user, ActivityType::Logout, 1), Utc::now())
        .await
        .unwrap();
    store.record_transition(user).await.unwrap();

    let user_histogram = store.transition_histogram(user).await.unwrap();
    assert_eq!(user_histogram.get("payment->logout"), Some(&1));
    assert_eq!(user_histogram.get("login->payment->logout"), Some(&1));

    let global = store.global_transition_histogram().await.unwrap();
    assert!(global.get("payment->logout").copied().unwrap_or(0) >= 1);
}

#[tokio::test]
#[ignore]
async fn ema_converges_on_a_constant_stream() {
    let store = store().await;
    let user = 910_004;

    let first = store
        .ema_update(user, ActivityType::Payment, 3.0, frequency::ALPHA)
        .await
        .unwrap();
    assert_eq!(first.prior, None);
    assert_eq!(first.current, 3.0);

    let mut last = first;
    for _ in 0..100 {
        last = store
            .ema_update(user, ActivityType::Payment, 3.0, frequency::ALPHA)
            .await
            .unwrap();
    }
    assert!((last.current - 3.0).abs() < 1e-6);
}
