//! Background progress monitor for long engine runs.
//!
//! Periodically logs how many items have resolved, how many succeeded and
//! failed, and how many remote calls are in flight, so operators can follow a
//! run without reading per-item log lines.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Snapshot of progress counters at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Items resolved this run (success or failure).
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items currently being executed.
    pub in_flight: usize,
    /// Wall-clock elapsed time since the monitor started.
    pub elapsed: Duration,
}

/// Shared atomic counters for run progress.
///
/// Cloned into workers and updated with `fetch_add`; the monitor only reads.
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    pub completed: Arc<AtomicUsize>,
    pub succeeded: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
}

impl Default for ProgressCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCounters {
    /// Create a new set of zeroed progress counters.
    pub fn new() -> Self {
        Self {
            completed: Arc::new(AtomicUsize::new(0)),
            succeeded: Arc::new(AtomicUsize::new(0)),
            failed: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counts one resolved item.
    pub fn record(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn start_item(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_item(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the current counter values.
    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs run progress.
///
/// Call [`ProgressMonitor::stop`] to cancel.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a monitor that logs every `interval`.
    ///
    /// # Arguments
    ///
    /// * `stage` - Stage name included in every log line
    /// * `counters` - Shared counters updated by the coordinator
    /// * `total` - Items dispatched this run (used for the percentage)
    /// * `interval` - How often to emit progress logs
    pub fn start(
        stage: impl Into<String>,
        counters: ProgressCounters,
        total: usize,
        interval: Duration,
    ) -> Self {
        let stage = stage.into();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();
        let interval = interval.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let pct = if total > 0 {
                    (snap.completed as f64 / total as f64 * 100.0).min(100.0)
                } else {
                    100.0
                };
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let per_sec = if elapsed_secs > 0.0 {
                    snap.completed as f64 / elapsed_secs
                } else {
                    0.0
                };

                tracing::info!(
                    stage = %stage,
                    completed = snap.completed,
                    total = total,
                    succeeded = snap.succeeded,
                    failed = snap.failed,
                    in_flight = snap.in_flight,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    items_per_sec = format!("{:.2}", per_sec),
                    "Run progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
