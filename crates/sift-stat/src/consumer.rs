//! Consumer runtime.
//!
//! Polls the ingest topic in a consumer group and drives records through
//! the handler registry. Two dispatch modes:
//!
//! - sequential (default): records are processed inline in the poll loop,
//!   so a partition's records strictly observe each other's writes; the
//!   producer keys by user id, which makes that a per-user guarantee;
//! - worker pool: a bounded set of workers, each fed by its own channel;
//!   records are pinned to a worker by the xxh3 of their key, which keeps
//!   per-user ordering intact while spreading users across workers.
//!
//! Offsets are committed out of band: processed records feed an offset
//! tracker that a dedicated committer flushes every three seconds.
//! Auto-commit is off; a crash replays at most the uncommitted suffix.

use crate::metrics;
use crate::pipeline::{Disposition, HandlerRegistry};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::TopicPartitionList;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_64;

pub const COMMIT_INTERVAL: Duration = Duration::from_secs(3);
const WORKER_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    Sequential,
    WorkerPool { workers: usize },
}

/// Highest processed offset per partition, pending commit.
///
/// Stores the *next* offset to consume (processed offset + 1), which is
/// what the broker expects in a commit.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    pending: HashMap<(String, i32), i64>,
}

impl OffsetTracker {
    pub fn record(&mut self, topic: &str, partition: i32, offset: i64) {
        let next = offset + 1;
        self.pending
            .entry((topic.to_string(), partition))
            .and_modify(|o| *o = (*o).max(next))
            .or_insert(next);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Snapshot of everything pending, for one commit attempt.
    pub fn snapshot(&self) -> Vec<((String, i32), i64)> {
        self.pending
            .iter()
            .map(|(tp, o)| (tp.clone(), *o))
            .collect()
    }

    /// Drop entries covered by a successful commit; offsets that advanced
    /// past the committed snapshot stay pending.
    pub fn acknowledge(&mut self, committed: &[((String, i32), i64)]) {
        for (tp, offset) in committed {
            if let Some(current) = self.pending.get(tp) {
                if *current <= *offset {
                    self.pending.remove(tp);
                }
            }
        }
    }
}

/// One record lifted off the broker, detached for dispatch.
struct PendingRecord {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

impl PendingRecord {
    fn from_message(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            payload: message.payload().unwrap_or_default().to_vec(),
        }
    }
}

pub struct ConsumerRuntime {
    consumer: Arc<StreamConsumer>,
    registry: Arc<HandlerRegistry>,
    mode: DispatchMode,
    tracker: Arc<Mutex<OffsetTracker>>,
    cancel: CancellationToken,
}

impl ConsumerRuntime {
    pub fn new(
        consumer: StreamConsumer,
        registry: HandlerRegistry,
        mode: DispatchMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            consumer: Arc::new(consumer),
            registry: Arc::new(registry),
            mode,
            tracker: Arc::new(Mutex::new(OffsetTracker::default())),
            cancel,
        }
    }

    /// Run until cancelled. In-flight work completes under its own
    /// deadlines and the committer performs a final flush before return.
    pub async fn run(self) {
        let committer = tokio::spawn(commit_loop(
            self.consumer.clone(),
            self.tracker.clone(),
            self.cancel.clone(),
        ));

        match self.mode {
            DispatchMode::Sequential => {
                info!("consumer runtime started (sequential dispatch)");
                self.run_sequential().await;
            }
            DispatchMode::WorkerPool { workers } => {
                info!(workers, "consumer runtime started (worker pool dispatch)");
                self.run_worker_pool(workers.max(1)).await;
            }
        }

        if let Err(err) = committer.await {
            error!(error = %err, "offset committer task panicked");
        }
        // Records finished during the drain land after the committer's
        // final tick; flush them before returning.
        flush_offsets(&self.consumer, &self.tracker);
        info!("consumer runtime stopped");
    }

    async fn run_sequential(&self) {
        let mut stream = self.consumer.stream();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = stream.next() => {
                    let Some(message) = message else { break };
                    match message {
                        Ok(message) => {
                            let record = PendingRecord::from_message(&message);
                            process_record(&self.registry, &self.tracker, record).await;
                        }
                        Err(err) => warn!(error = %err, "kafka consumer error"),
                    }
                }
            }
        }
    }

    async fn run_worker_pool(&self, workers: usize) {
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, mut rx) = mpsc::channel::<PendingRecord>(WORKER_CHANNEL_CAPACITY);
            senders.push(tx);
            let registry = self.registry.clone();
            let tracker = self.tracker.clone();
            handles.push(tokio::spawn(async move {
                while let Some(record) = rx.recv().await {
                    process_record(&registry, &tracker, record).await;
                }
                debug!(worker = id, "worker drained");
            }));
        }

        let mut stream = self.consumer.stream();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = stream.next() => {
                    let Some(message) = message else { break };
                    match message {
                        Ok(message) => {
                            let record = PendingRecord::from_message(&message);
                            let worker = worker_for(record.key.as_deref(), record.partition, workers);
                            if senders[worker].send(record).await.is_err() {
                                error!(worker, "worker channel closed; stopping poll loop");
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "kafka consumer error"),
                    }
                }
            }
        }

        // Close the channels and let the workers drain their backlog.
        drop(senders);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Pin a record to a worker. Keys carry the user id, so one worker serves
/// all of a user's events; keyless records fall back to the partition.
fn worker_for(key: Option<&[u8]>, partition: i32, workers: usize) -> usize {
    match key {
        Some(key) if !key.is_empty() => (xxh3_64(key) % workers as u64) as usize,
        _ => partition as usize % workers,
    }
}

async fn process_record(
    registry: &HandlerRegistry,
    tracker: &Mutex<OffsetTracker>,
    record: PendingRecord,
) {
    metrics::RECORDS_TOTAL.inc();

    let committable = match registry.dispatch(&record.payload).await {
        Ok(Disposition::Processed) => true,
        Ok(Disposition::UnsupportedDomain(domain)) => {
            metrics::DOMAIN_SKIPPED.inc();
            debug!(%domain, "skipping unsupported domain");
            true
        }
        Ok(Disposition::Malformed(reason)) => {
            metrics::DECODE_FAILURES.inc();
            warn!(
                partition = record.partition,
                offset = record.offset,
                %reason,
                "acknowledging malformed record"
            );
            true
        }
        Err(err) => {
            // Leave the offset uncommitted; redelivery is the retry path.
            metrics::PROCESSING_FAILURES.inc();
            error!(
                partition = record.partition,
                offset = record.offset,
                error = %err,
                "record processing failed"
            );
            false
        }
    };

    if committable {
        tracker
            .lock()
            .expect("offset tracker poisoned")
            .record(&record.topic, record.partition, record.offset);
    }
}

/// Flush pending offsets every tick; on failure the offsets stay pending
/// and the next tick retries. A final flush runs on shutdown.
async fn commit_loop(
    consumer: Arc<StreamConsumer>,
    tracker: Arc<Mutex<OffsetTracker>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(COMMIT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => flush_offsets(&consumer, &tracker),
            _ = cancel.cancelled() => break,
        }
    }
    flush_offsets(&consumer, &tracker);
}

fn flush_offsets(consumer: &StreamConsumer, tracker: &Mutex<OffsetTracker>) {
    let snapshot = {
        let tracker = tracker.lock().expect("offset tracker poisoned");
        if tracker.is_empty() {
            return;
        }
        tracker.snapshot()
    };

    let mut tpl = TopicPartitionList::new();
    for ((topic, partition), offset) in &snapshot {
        if let Err(err) =
            tpl.add_partition_offset(topic, *partition, rdkafka::Offset::Offset(*offset))
        {
            error!(%topic, partition = *partition, offset = *offset, error = %err, "invalid commit offset");
            return;
        }
    }

    match consumer.commit(&tpl, CommitMode::Sync) {
        Ok(()) => {
            tracker
                .lock()
                .expect("offset tracker poisoned")
                .acknowledge(&snapshot);
            metrics::OFFSETS_COMMITTED.inc_by(snapshot.len() as u64);
            debug!(partitions = snapshot.len(), "committed offsets");
        }
        Err(err) => {
            metrics::COMMIT_FAILURES.inc();
            warn!(error = %err, "offset commit failed; will retry next tick");
        }
    }
}
