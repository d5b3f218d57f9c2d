//! Worker pool partitioning change records by partition key.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{PostprocessError, Postprocessor, Result};
use crate::config::PostprocessorConfig;
use crate::storage::change::ChangeRecord;

/// Counts reported by [`PostprocessorPool::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Records at least one handler reconciled.
    pub processed: usize,
    /// Records no handler matched.
    pub ignored: usize,
    /// Records whose handler failed; dropped after logging.
    pub failed: usize,
}

impl PoolStats {
    fn merge(&mut self, other: PoolStats) {
        self.processed += other.processed;
        self.ignored += other.ignored;
        self.failed += other.failed;
    }
}

/// N workers with bounded queues. A partition key always maps to the same
/// worker, so records of one partition are handled serially and in order.
pub struct PostprocessorPool {
    senders: Vec<mpsc::Sender<ChangeRecord>>,
    workers: Vec<JoinHandle<PoolStats>>,
}

impl PostprocessorPool {
    pub fn start(postprocessor: Arc<Postprocessor>, config: &PostprocessorConfig) -> Self {
        let count = config.workers.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);

        for worker in 0..count {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(worker, postprocessor.clone(), rx)));
        }

        info!(workers = count, queue_capacity = config.queue_capacity, "Postprocessor pool started");
        Self { senders, workers }
    }

    /// Worker index for a partition key.
    pub fn worker_for(&self, partition_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue a record, waiting while its worker's queue is full.
    pub async fn submit(&self, record: ChangeRecord) -> Result<()> {
        let worker = self.worker_for(&record.partition_key);
        self.senders[worker]
            .send(record)
            .await
            .map_err(|_| PostprocessError::PoolClosed)
    }

    /// Close the queues, let the workers drain them and collect their counts.
    pub async fn shutdown(self) -> PoolStats {
        drop(self.senders);
        let mut stats = PoolStats::default();
        for (worker, handle) in self.workers.into_iter().enumerate() {
            match handle.await {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(e) => error!(worker, error = %e, "Postprocessor worker panicked"),
            }
        }
        info!(
            processed = stats.processed,
            ignored = stats.ignored,
            failed = stats.failed,
            "Postprocessor pool stopped"
        );
        stats
    }
}

async fn run_worker(
    worker: usize,
    postprocessor: Arc<Postprocessor>,
    mut rx: mpsc::Receiver<ChangeRecord>,
) -> PoolStats {
    let mut stats = PoolStats::default();
    debug!(worker, "Postprocessor worker started");
    while let Some(record) = rx.recv().await {
        match postprocessor.dispatch(&record).await {
            Ok(0) => stats.ignored += 1,
            Ok(_) => stats.processed += 1,
            // logged by dispatch
            Err(_) => stats.failed += 1,
        }
    }
    stats
}
