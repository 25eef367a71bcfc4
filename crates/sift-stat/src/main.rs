use anyhow::Context;
use sift_stat::config::{load_dotenv, StatConfig};
use sift_stat::consumer::ConsumerRuntime;
use sift_stat::metrics;
use sift_stat::pipeline::{HandlerRegistry, UserActivityHandler};
use sift_stat::producer::VerdictProducer;
use sift_stat::profile::ProfileStore;
use rdkafka::consumer::Consumer;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    load_dotenv();

    let config = StatConfig::from_env().context("configuration")?;
    info!(
        brokers = %config.brokers,
        topic = %config.topic,
        group = %config.group,
        result_topic = %config.result_topic,
        workers = config.workers,
        "starting stat analyser"
    );

    let consumer = config.consumer().context("kafka consumer")?;
    consumer
        .subscribe(&[config.topic.as_str()])
        .context("topic subscription")?;

    let redis = config.redis().await.context("redis connection")?;
    let store = ProfileStore::new(redis);
    let producer = VerdictProducer::new(
        config.producer().context("kafka producer")?,
        config.result_topic.clone(),
    );

    let registry = HandlerRegistry::new(vec![Box::new(UserActivityHandler::new(
        store, producer,
    ))]);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    tokio::spawn(metrics::serve(config.health_addr.clone(), cancel.clone()));

    let runtime = ConsumerRuntime::new(consumer, registry, config.dispatch_mode(), cancel);
    runtime.run().await;

    info!("stat analyser stopped");
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
