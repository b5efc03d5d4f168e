//! Streaming worker pool.
//!
//! A fixed number of tokio tasks pull pending items from a shared queue and
//! run them through the [`UnitExecutor`]. Results are consumed in completion
//! order: each finished record is upserted into the [`CheckpointStore`],
//! which persists it at the configured interval inside its own lock.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Per-item failures never stop a worker
//! - Pool statistics tracking

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointStore;
use crate::dataset::WorkItem;
use crate::metrics::MetricsCollector;
use crate::pipeline::executor::UnitExecutor;
use crate::pipeline::progress::ProgressCounters;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { num_workers: 5 }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self { num_workers }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing an item.
    pub active_workers: usize,
    /// Items that produced a success record.
    pub items_succeeded: u64,
    /// Items that produced a failure record.
    pub items_failed: u64,
    /// Average time per item, including pacing and retries.
    pub average_item_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of items processed.
    pub fn total_processed(&self) -> u64 {
        self.items_succeeded + self.items_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.items_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    items_succeeded: AtomicU64,
    items_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            items_succeeded: AtomicU64::new(0),
            items_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, success: bool, duration: Duration) {
        if success {
            self.items_succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.items_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.items_succeeded.load(Ordering::SeqCst);
        let failed = self.items_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = succeeded + failed;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            items_succeeded: succeeded,
            items_failed: failed,
            average_item_duration: average,
        }
    }
}

type SharedQueue = Arc<Mutex<VecDeque<WorkItem>>>;

/// Worker pool that drains a list of pending items.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    executor: Arc<UnitExecutor>,
    store: Arc<CheckpointStore>,
    progress: ProgressCounters,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a new worker pool. Zero workers is treated as one.
    pub fn new(
        config: WorkerPoolConfig,
        executor: Arc<UnitExecutor>,
        store: Arc<CheckpointStore>,
    ) -> Self {
        let config = WorkerPoolConfig::new(config.num_workers.max(1));
        Self {
            config,
            executor,
            store,
            progress: ProgressCounters::new(),
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    /// Shares progress counters with a monitor.
    pub fn with_progress(mut self, progress: ProgressCounters) -> Self {
        self.progress = progress;
        self
    }

    /// Runs every item to a result record and returns once all are stored.
    ///
    /// No more workers than items are spawned.
    pub async fn run(&self, items: Vec<WorkItem>) -> PoolStats {
        let total = items.len();
        let num_workers = self.config.num_workers.min(total.max(1));
        let queue: SharedQueue = Arc::new(Mutex::new(items.into()));

        info!(
            workers = num_workers,
            items = total,
            stage = self.executor.stage().name(),
            "Worker pool started"
        );

        let handles: Vec<_> = (0..num_workers)
            .map(|i| {
                let worker = Worker {
                    id: format!("worker-{}", i),
                    queue: Arc::clone(&queue),
                    executor: Arc::clone(&self.executor),
                    store: Arc::clone(&self.store),
                    progress: self.progress.clone(),
                    stats: Arc::clone(&self.stats),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task panicked");
            }
        }

        let stats = self.stats();
        info!(
            succeeded = stats.items_succeeded,
            failed = stats.items_failed,
            "Worker pool finished"
        );
        stats
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker pulling items until the queue is empty.
struct Worker {
    id: String,
    queue: SharedQueue,
    executor: Arc<UnitExecutor>,
    store: Arc<CheckpointStore>,
    progress: ProgressCounters,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = %self.id, "Worker started");
        let metrics = MetricsCollector::new();

        loop {
            let next = self.queue.lock().await.pop_front();
            let Some(item) = next else {
                break;
            };

            let start = Instant::now();
            self.stats.increment_active();
            self.progress.start_item();
            metrics.inc_active_workers();

            let record = self.executor.execute(&item).await;

            metrics.dec_active_workers();
            self.progress.finish_item();
            self.stats.decrement_active();

            let success = record.is_success();
            self.stats.record(success, start.elapsed());
            self.progress.record(success);
            debug!(
                worker_id = %self.id,
                item_id = %item.id(),
                success,
                duration_ms = start.elapsed().as_millis() as u64,
                "Item finished"
            );

            self.store.upsert(record).await;
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }
}
