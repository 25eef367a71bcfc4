//! Prometheus metrics and the health listener.

use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub static STAT_RECORDS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_agg_stat_records_total", "Stat verdicts consumed").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ML_RECORDS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_agg_ml_records_total", "ML results consumed").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static RAW_RECORDS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_agg_raw_records_total", "Raw events archived").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static INSERT_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_agg_insert_failures_total", "Cold-store inserts that failed")
        .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static AGGREGATED_WRITTEN: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_agg_aggregated_written_total", "Aggregated rows written")
        .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static SESSIONS_SWEPT: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_agg_sessions_swept_total", "Incomplete sessions evicted")
        .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Serve `/metrics` and `/healthz` until cancelled.
pub async fn serve(addr: String, cancel: CancellationToken) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(health_handler));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, error = %err, "health listener failed to bind");
            return;
        }
    };
    info!(%addr, "health listener started");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        error!(error = %err, "health listener stopped with error");
    }
}
