use anyhow::Context;
use sift_aggregator::config::{load_dotenv, AggregatorConfig};
use sift_aggregator::consumers::{MlResultConsumer, RawEventConsumer, StatVerdictConsumer};
use sift_aggregator::correlate::Aggregator;
use sift_aggregator::metrics;
use sift_aggregator::store::ColdStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    load_dotenv();

    let config = AggregatorConfig::from_env();
    info!(
        brokers = %config.brokers,
        group = %config.group,
        topic_stat = %config.topic_stat,
        topic_ml = %config.topic_ml,
        topic_raw = %config.topic_raw,
        "starting anomaly aggregator"
    );

    let pool = config.pool().await.context("postgres connection")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrations")?;
    let store = ColdStore::new(pool);

    let aggregator = Arc::new(Aggregator::new(store.clone()));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    tokio::spawn(metrics::serve(config.health_addr.clone(), cancel.clone()));

    let sweeper = {
        let aggregator = aggregator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { aggregator.run_sweeper(cancel).await })
    };

    let stat = StatVerdictConsumer::new(
        config.consumer(&config.topic_stat).context("stat consumer")?,
        store.clone(),
        aggregator.clone(),
    );
    let ml = MlResultConsumer::new(
        config.consumer(&config.topic_ml).context("ml consumer")?,
        store.clone(),
        aggregator.clone(),
    );
    let raw = RawEventConsumer::new(
        config.consumer(&config.topic_raw).context("raw consumer")?,
        store,
    );

    let stat_task = tokio::spawn(stat.run(cancel.clone()));
    let ml_task = tokio::spawn(ml.run(cancel.clone()));
    let raw_task = tokio::spawn(raw.run(cancel.clone()));

    let _ = tokio::join!(stat_task, ml_task, raw_task, sweeper);

    info!("anomaly aggregator stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
    info!("shutdown signal received; draining");
    cancel.cancel();
}
