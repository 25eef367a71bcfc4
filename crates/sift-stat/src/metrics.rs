//! Prometheus metrics and the health listener.

use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub static RECORDS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_stat_records_total", "Records consumed from the ingest topic")
        .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DOMAIN_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_stat_domain_skipped_total", "Records with an unsupported domain")
        .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DECODE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_stat_decode_failures_total", "Records that failed to decode")
        .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static PROCESSING_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "sift_stat_processing_failures_total",
        "Records left uncommitted for redelivery",
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ANOMALIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("sift_stat_anomalies_total", "Anomalies detected, by type"),
        &["anomaly_type"],
    )
    .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static OFFSETS_COMMITTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_stat_offsets_committed_total", "Partition offsets committed")
        .unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static COMMIT_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("sift_stat_commit_failures_total", "Offset commit attempts that failed")
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
