//! Provider batch coordinator.
//!
//! Pending items are split into chunks of `batch_size`. Each chunk becomes one
//! provider job, tracked by a [`BatchJob`] that moves through
//! `Submitted -> Processing -> Ended` as status polls come back. When the job
//! ends, every enclosed item gets exactly one record: the parsed response, the
//! provider's per-item error, or a failure for an entry that never came back.
//!
//! Chunks run one after another. The checkpoint is flushed after every
//! `save_every` chunks; the final flush belongs to the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, Failure, FailureKind, ResultRecord};
use crate::dataset::WorkItem;
use crate::llm::{BatchEntry, BatchEntryOutcome, BatchProvider, BatchRequest, BatchStatus};
use crate::metrics::MetricsCollector;
use crate::pipeline::executor::{classify_retry_failure, record_from_text};
use crate::pipeline::progress::ProgressCounters;
use crate::pipeline::retry::{retry_with_backoff, RetryPolicy};
use crate::stages::Stage;

/// Lifecycle of one provider job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchJobState {
    Submitted,
    Processing,
    Ended,
}

impl fmt::Display for BatchJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchJobState::Submitted => f.write_str("submitted"),
            BatchJobState::Processing => f.write_str("processing"),
            BatchJobState::Ended => f.write_str("ended"),
        }
    }
}

/// One submitted chunk.
#[derive(Debug, Clone)]
pub struct BatchJob {
    /// Id assigned by the provider.
    pub batch_id: String,
    pub chunk_index: usize,
    /// Custom id sent to the provider, mapped back to the enclosed item.
    members: BTreeMap<String, WorkItem>,
    state: BatchJobState,
    pub submitted_at: DateTime<Utc>,
    pub polls: u32,
}

impl BatchJob {
    pub fn new(
        batch_id: impl Into<String>,
        chunk_index: usize,
        members: BTreeMap<String, WorkItem>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            chunk_index,
            members,
            state: BatchJobState::Submitted,
            submitted_at: Utc::now(),
            polls: 0,
        }
    }

    pub fn state(&self) -> BatchJobState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == BatchJobState::Ended
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Applies one status poll. `Ended` is terminal.
    pub fn observe(&mut self, status: BatchStatus) -> BatchJobState {
        self.polls += 1;
        self.state = match (self.state, status) {
            (BatchJobState::Ended, _) => BatchJobState::Ended,
            (_, BatchStatus::Ended) => BatchJobState::Ended,
            _ => BatchJobState::Processing,
        };
        self.state
    }

    /// Maps the job's results to one record per enclosed item.
    ///
    /// Entries with unknown custom ids are ignored; items without an entry
    /// get a `remote_fatal` failure.
    pub fn resolve(&self, entries: Vec<BatchEntry>, stage: &dyn Stage) -> Vec<ResultRecord> {
        let mut outcomes: BTreeMap<String, BatchEntryOutcome> = BTreeMap::new();
        for entry in entries {
            if self.members.contains_key(&entry.custom_id) {
                outcomes.insert(entry.custom_id, entry.outcome);
            } else {
                warn!(
                    batch_id = %self.batch_id,
                    custom_id = %entry.custom_id,
                    "Batch result for unknown request, ignoring"
                );
            }
        }

        self.members
            .iter()
            .map(|(custom_id, item)| match outcomes.remove(custom_id) {
                Some(BatchEntryOutcome::Succeeded(response)) => {
                    record_from_text(stage, item, &response.text())
                }
                Some(other) => ResultRecord::failure(item.id().clone(), entry_failure(&other)),
                None => ResultRecord::failure(
                    item.id().clone(),
                    Failure::new(
                        FailureKind::RemoteFatal,
                        format!("batch {} returned no result for this item", self.batch_id),
                    ),
                ),
            })
            .collect()
    }

    /// One failure record per enclosed item.
    pub fn fail_all(&self, failure: &Failure) -> Vec<ResultRecord> {
        fail_items(self.members.values(), failure)
    }
}

fn fail_items<'a>(
    items: impl IntoIterator<Item = &'a WorkItem>,
    failure: &Failure,
) -> Vec<ResultRecord> {
    items
        .into_iter()
        .map(|item| ResultRecord::failure(item.id().clone(), failure.clone()))
        .collect()
}

fn entry_failure(outcome: &BatchEntryOutcome) -> Failure {
    match outcome {
        BatchEntryOutcome::Errored {
            error_type,
            message,
        } => {
            let kind = if error_type == "rate_limit_error" || error_type == "overloaded_error" {
                FailureKind::RemoteTransient
            } else {
                FailureKind::RemoteFatal
            };
            Failure::new(kind, format!("{}: {}", error_type, message))
        }
        BatchEntryOutcome::Canceled => {
            Failure::new(FailureKind::RemoteFatal, "batch request was canceled")
        }
        BatchEntryOutcome::Expired => {
            Failure::new(FailureKind::RemoteTransient, "batch request expired")
        }
        BatchEntryOutcome::Succeeded(_) => {
            Failure::new(FailureKind::RemoteFatal, "unexpected success outcome")
        }
    }
}

/// Settings for batch dispatch.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Items per provider job.
    pub batch_size: usize,
    /// Pause between status polls.
    pub poll_interval: Duration,
    /// Chunks between checkpoint flushes.
    pub save_every: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            poll_interval: Duration::from_secs(8),
            save_every: 5,
        }
    }
}

/// Totals for one batch-mode run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRunStats {
    pub chunks: usize,
    /// Requests accepted by the provider.
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub polls: u32,
}

/// Drives pending items through provider batch jobs.
pub struct BatchCoordinator {
    stage: Arc<dyn Stage>,
    provider: Arc<dyn BatchProvider>,
    store: Arc<CheckpointStore>,
    config: BatchConfig,
    retry: RetryPolicy,
    progress: ProgressCounters,
    metrics: MetricsCollector,
}

impl BatchCoordinator {
    pub fn new(
        stage: Arc<dyn Stage>,
        provider: Arc<dyn BatchProvider>,
        store: Arc<CheckpointStore>,
        config: BatchConfig,
    ) -> Self {
        Self {
            stage,
            provider,
            store,
            config,
            retry: RetryPolicy::default(),
            progress: ProgressCounters::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// Backoff applied to submit, status and results calls.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCounters) -> Self {
        self.progress = progress;
        self
    }

    /// Runs every item to a result record, chunk by chunk.
    pub async fn run(&self, items: Vec<WorkItem>) -> BatchRunStats {
        let batch_size = self.config.batch_size.max(1);
        let save_every = self.config.save_every.max(1);
        let mut stats = BatchRunStats::default();
        let mut next_request = 0usize;

        info!(
            stage = self.stage.name(),
            items = items.len(),
            batch_size,
            "Batch dispatch started"
        );

        for (chunk_index, chunk) in items.chunks(batch_size).enumerate() {
            let records = self
                .run_chunk(chunk_index, chunk, &mut next_request, &mut stats)
                .await;

            for record in &records {
                let success = record.is_success();
                if success {
                    stats.succeeded += 1;
                } else {
                    stats.failed += 1;
                }
                self.progress.record(success);
                let outcome = record.failure_ref().map_or("success", |f| f.kind.as_str());
                self.metrics.record_item(self.stage.name(), outcome);
            }
            self.store.insert_many(records).await;
            stats.chunks += 1;

            if (chunk_index + 1) % save_every == 0 {
                if let Err(e) = self.store.flush().await {
                    error!(chunk = chunk_index, error = %e, "Checkpoint save after batch failed");
                }
            }
        }

        info!(
            chunks = stats.chunks,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Batch dispatch finished"
        );
        stats
    }

    async fn run_chunk(
        &self,
        chunk_index: usize,
        chunk: &[WorkItem],
        next_request: &mut usize,
        stats: &mut BatchRunStats,
    ) -> Vec<ResultRecord> {
        let mut records = Vec::new();
        let mut requests = Vec::new();
        let mut members = BTreeMap::new();

        for item in chunk {
            match self.stage.build_request(item) {
                Ok(params) => {
                    let custom_id = format!("item-{}", *next_request);
                    *next_request += 1;
                    requests.push(BatchRequest {
                        custom_id: custom_id.clone(),
                        params,
                    });
                    members.insert(custom_id, item.clone());
                }
                Err(failure) => {
                    warn!(item_id = %item.id(), error = %failure, "Item rejected before batch submission");
                    records.push(ResultRecord::failure(item.id().clone(), failure));
                }
            }
        }

        if requests.is_empty() {
            return records;
        }

        let provider = &self.provider;
        let request_count = requests.len();
        let submitted = retry_with_backoff(&self.retry, || {
            let requests = requests.clone();
            async move { provider.submit(requests).await }
        })
        .await;

        let batch_id = match submitted {
            Ok(id) => id,
            Err(e) => {
                let failure = classify_retry_failure(&e);
                error!(chunk = chunk_index, error = %failure, "Batch submission failed");
                records.extend(fail_items(members.values(), &failure));
                return records;
            }
        };

        stats.submitted += request_count;
        self.progress
            .in_flight
            .fetch_add(request_count, Ordering::Relaxed);
        let mut job = BatchJob::new(batch_id.clone(), chunk_index, members);
        info!(
            batch_id = %batch_id,
            chunk = chunk_index,
            requests = request_count,
            "Batch submitted"
        );

        let ended = self.wait_until_ended(&mut job).await;
        stats.polls += job.polls;
        self.progress
            .in_flight
            .fetch_sub(request_count, Ordering::Relaxed);

        if let Err(failure) = ended {
            records.extend(job.fail_all(&failure));
            return records;
        }

        let id = batch_id.as_str();
        match retry_with_backoff(&self.retry, move || provider.results(id)).await {
            Ok(entries) => {
                debug!(batch_id = %batch_id, entries = entries.len(), "Batch results received");
                records.extend(job.resolve(entries, self.stage.as_ref()));
            }
            Err(e) => {
                let failure = classify_retry_failure(&e);
                error!(batch_id = %batch_id, error = %failure, "Reading batch results failed");
                records.extend(job.fail_all(&failure));
            }
        }
        records
    }

    async fn wait_until_ended(&self, job: &mut BatchJob) -> Result<(), Failure> {
        let provider = &self.provider;
        let batch_id = job.batch_id.clone();
        loop {
            let id = batch_id.as_str();
            let status = retry_with_backoff(&self.retry, move || provider.status(id))
                .await
                .map_err(|e| {
                    let failure = classify_retry_failure(&e);
                    error!(batch_id = %batch_id, error = %failure, "Polling batch status failed");
                    failure
                })?;
            self.metrics.record_batch_poll();

            let state = job.observe(status);
            debug!(batch_id = %batch_id, status = %status, state = %state, polls = job.polls, "Polled batch");
            if state == BatchJobState::Ended {
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationRequest, GenerationResponse, Message};
    use crate::stages::ParsedResponse;
    use serde_json::{json, Map, Value};

    struct UpperStage;

    impl Stage for UpperStage {
        fn name(&self) -> &str {
            "upper"
        }

        fn build_request(&self, item: &WorkItem) -> Result<GenerationRequest, Failure> {
            let prompt = item
                .str_field("prompt")
                .ok_or_else(|| Failure::validation("missing prompt"))?;
            Ok(GenerationRequest::new("m", vec![Message::user(prompt)]))
        }

        fn parse_response(&self, _item: &WorkItem, text: &str) -> ParsedResponse {
            let mut payload = Map::new();
            payload.insert("out".to_string(), Value::String(text.to_uppercase()));
            ParsedResponse {
                payload,
                missing_tags: Vec::new(),
            }
        }
    }

    fn job() -> BatchJob {
        let mut members = BTreeMap::new();
        for (n, id) in [(0, 10), (1, 11), (2, 12)] {
            members.insert(
                format!("item-{}", n),
                WorkItem::from_value(json!({"id": id})).expect("item"),
            );
        }
        BatchJob::new("batch_1", 0, members)
    }

    #[test]
    fn test_state_machine() {
        let mut job = job();
        assert_eq!(job.state(), BatchJobState::Submitted);
        assert_eq!(job.observe(BatchStatus::InProgress), BatchJobState::Processing);
        assert_eq!(job.observe(BatchStatus::Canceling), BatchJobState::Processing);
        assert_eq!(job.observe(BatchStatus::Ended), BatchJobState::Ended);
        assert_eq!(job.observe(BatchStatus::InProgress), BatchJobState::Ended);
        assert_eq!(job.polls, 4);
        assert!(job.is_ended());
    }

    #[test]
    fn test_resolve_maps_every_member() {
        let entries = vec![
            BatchEntry {
                custom_id: "item-0".to_string(),
                outcome: BatchEntryOutcome::Succeeded(GenerationResponse::from_text("m", "ok")),
            },
            BatchEntry {
                custom_id: "item-1".to_string(),
                outcome: BatchEntryOutcome::Errored {
                    error_type: "invalid_request_error".to_string(),
                    message: "too long".to_string(),
                },
            },
            BatchEntry {
                custom_id: "item-9".to_string(),
                outcome: BatchEntryOutcome::Expired,
            },
        ];

        let records = job().resolve(entries, &UpperStage);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].payload().expect("payload")["out"], json!("OK"));

        let failure = records[1].failure_ref().expect("failure");
        assert_eq!(failure.kind, FailureKind::RemoteFatal);
        assert!(failure.message.contains("too long"));

        let missing = records[2].failure_ref().expect("failure");
        assert_eq!(missing.kind, FailureKind::RemoteFatal);
        assert!(missing.message.contains("no result"));
    }

    #[test]
    fn test_entry_failure_kinds() {
        let rate_limited = entry_failure(&BatchEntryOutcome::Errored {
            error_type: "rate_limit_error".to_string(),
            message: "slow".to_string(),
        });
        assert_eq!(rate_limited.kind, FailureKind::RemoteTransient);
        assert_eq!(entry_failure(&BatchEntryOutcome::Expired).kind, FailureKind::RemoteTransient);
        assert_eq!(entry_failure(&BatchEntryOutcome::Canceled).kind, FailureKind::RemoteFatal);
    }

    #[test]
    fn test_fail_all() {
        let failure = Failure::new(FailureKind::RemoteFatal, "submit failed");
        let records = job().fail_all(&failure);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(ResultRecord::is_failure));
    }
}
