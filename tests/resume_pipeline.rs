//! End-to-end runs of the engine against fake providers.
//!
//! The fake streaming provider answers `<answer>{prompt}</answer>` for every
//! request and can be told to reject or rate limit specific prompts. The fake
//! batch provider answers each entry the same way once polled.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use puzzle_forge::checkpoint::{self, FailureKind};
use puzzle_forge::dataset::ItemId;
use puzzle_forge::llm::{
    BatchEntry, BatchEntryOutcome, BatchProvider, BatchRequest, BatchStatus, GenerationRequest,
    GenerationResponse, LlmProvider,
};
use puzzle_forge::pipeline::{EngineConfig, ExecutionMode, PipelineRunner, RetryPolicy};
use puzzle_forge::stages::{FieldSpec, PromptTemplate, Stage, TemplateStage};
use puzzle_forge::LlmError;

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeProvider {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    fatal: HashSet<String>,
    rate_limited: HashSet<String>,
}

impl FakeProvider {
    fn with_fatal(mut self, prompt: &str) -> Self {
        self.fatal.insert(prompt.to_string());
        self
    }

    fn with_rate_limited(mut self, prompt: &str) -> Self {
        self.rate_limited.insert(prompt.to_string());
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("lock").clone()
    }
}

fn prompt_of(request: &GenerationRequest) -> String {
    request
        .messages
        .iter()
        .map(|m| m.text())
        .collect::<Vec<_>>()
        .join("")
}

#[async_trait]
impl LlmProvider for FakeProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = prompt_of(&request);
        self.prompts.lock().expect("lock").push(prompt.clone());

        if self.fatal.contains(&prompt) {
            return Err(LlmError::ApiError {
                code: 400,
                message: "invalid_request_error".to_string(),
            });
        }
        if self.rate_limited.contains(&prompt) {
            return Err(LlmError::RateLimited("rate_limit_error".to_string()));
        }
        Ok(GenerationResponse::from_text(
            request.model,
            format!("<answer>{}</answer>", prompt),
        ))
    }
}

#[derive(Default)]
struct FakeBatchProvider {
    jobs: Mutex<HashMap<String, Vec<BatchRequest>>>,
    submits: AtomicUsize,
    polls: AtomicUsize,
    reject_submit: bool,
}

#[async_trait]
impl BatchProvider for FakeBatchProvider {
    async fn submit(&self, requests: Vec<BatchRequest>) -> Result<String, LlmError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        if self.reject_submit {
            return Err(LlmError::ApiError {
                code: 413,
                message: "request_too_large".to_string(),
            });
        }
        let batch_id = format!("msgbatch_{}", n);
        self.jobs
            .lock()
            .expect("lock")
            .insert(batch_id.clone(), requests);
        Ok(batch_id)
    }

    async fn status(&self, _batch_id: &str) -> Result<BatchStatus, LlmError> {
        // Every job needs one extra poll before it ends.
        let n = self.polls.fetch_add(1, Ordering::SeqCst);
        if n % 2 == 0 {
            Ok(BatchStatus::InProgress)
        } else {
            Ok(BatchStatus::Ended)
        }
    }

    async fn results(&self, batch_id: &str) -> Result<Vec<BatchEntry>, LlmError> {
        let jobs = self.jobs.lock().expect("lock");
        let requests = jobs.get(batch_id).cloned().unwrap_or_default();
        Ok(requests
            .into_iter()
            .map(|r| {
                let prompt = prompt_of(&r.params);
                let outcome = if prompt == "expired" {
                    BatchEntryOutcome::Expired
                } else {
                    BatchEntryOutcome::Succeeded(GenerationResponse::from_text(
                        r.params.model.clone(),
                        format!("<answer>{}</answer>", prompt),
                    ))
                };
                BatchEntry {
                    custom_id: r.custom_id,
                    outcome,
                }
            })
            .collect())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn stage() -> Arc<dyn Stage> {
    let template = PromptTemplate::parse("answer.md", "{{ prompt }}").expect("template");
    Arc::new(
        TemplateStage::new("answer", template)
            .with_model("fake-model")
            .with_field(FieldSpec::text("answer")),
    )
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_pacing(Duration::ZERO, Duration::ZERO)
        .with_concurrency(3)
        .with_save_interval(2)
        .with_batch_size(4)
        .with_poll_interval(Duration::from_millis(1))
        .with_retry(
            RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
}

fn items(ids: impl IntoIterator<Item = i64>) -> Vec<Value> {
    ids.into_iter()
        .map(|id| json!({"id": id, "prompt": format!("q{}", id)}))
        .collect()
}

fn streaming_runner(provider: Arc<FakeProvider>, config: EngineConfig) -> PipelineRunner {
    PipelineRunner::new(stage(), config).with_provider(provider)
}

fn read_checkpoint(path: &Path) -> Vec<Value> {
    let content = std::fs::read_to_string(path).expect("read checkpoint");
    serde_json::from_str(&content).expect("checkpoint json")
}

fn checkpoint_ids(path: &Path) -> Vec<i64> {
    read_checkpoint(path)
        .iter()
        .map(|v| v["id"].as_i64().expect("integer id"))
        .collect()
}

// ============================================================================
// Streaming mode
// ============================================================================

#[tokio::test]
async fn test_streaming_run_writes_sorted_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    let provider = Arc::new(FakeProvider::default());

    let summary = streaming_runner(provider.clone(), config())
        .run_records(items([5, 3, 9, 1, 7]), &output)
        .await
        .expect("run");

    assert_eq!(summary.dispatched, 5);
    assert_eq!(summary.succeeded, 5);
    assert_eq!(summary.failed, 0);
    assert_eq!(provider.calls(), 5);
    assert_eq!(checkpoint_ids(&output), vec![1, 3, 5, 7, 9]);

    let records = read_checkpoint(&output);
    assert_eq!(records[0], json!({"id": 1, "answer": "q1"}));
}

#[tokio::test]
async fn test_resume_skips_resolved_items() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");

    let first = Arc::new(FakeProvider::default());
    streaming_runner(first.clone(), config())
        .run_records(items(1..=4), &output)
        .await
        .expect("first run");
    assert_eq!(first.calls(), 4);

    let second = Arc::new(FakeProvider::default());
    let summary = streaming_runner(second.clone(), config())
        .run_records(items(1..=6), &output)
        .await
        .expect("second run");

    assert_eq!(summary.already_resolved, 4);
    assert_eq!(summary.dispatched, 2);
    let mut prompts = second.prompts();
    prompts.sort();
    assert_eq!(prompts, vec!["q5".to_string(), "q6".to_string()]);
    assert_eq!(checkpoint_ids(&output), vec![1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn test_rerun_of_finished_output_makes_no_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    std::fs::write(
        &output,
        r#"[{"id": 3, "error": "boom"}, {"id": 2, "answer": "b"}, {"id": 1, "answer": "a"}]"#,
    )
    .expect("seed checkpoint");

    let provider = Arc::new(FakeProvider::default());
    let summary = streaming_runner(provider.clone(), config())
        .run_records(items([1, 2, 3]), &output)
        .await
        .expect("run");

    assert_eq!(provider.calls(), 0);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.already_resolved, 3);
    assert_eq!(
        read_checkpoint(&output),
        vec![
            json!({"id": 1, "answer": "a"}),
            json!({"id": 2, "answer": "b"}),
            json!({"id": 3, "error": "boom"}),
        ]
    );
}

#[tokio::test]
async fn test_ids_beyond_i64_are_kept() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    let big = 18_446_744_073_709_551_000u64;
    let records = vec![json!({"id": big, "prompt": "big"}), json!({"id": 1, "prompt": "small"})];

    let first = Arc::new(FakeProvider::default());
    streaming_runner(first.clone(), config())
        .run_records(records.clone(), &output)
        .await
        .expect("first run");
    assert_eq!(first.calls(), 2);

    let second = Arc::new(FakeProvider::default());
    let summary = streaming_runner(second.clone(), config())
        .run_records(records, &output)
        .await
        .expect("second run");
    assert_eq!(second.calls(), 0);
    assert_eq!(summary.already_resolved, 2);

    let saved = read_checkpoint(&output);
    assert_eq!(saved[1], json!({"id": big, "answer": "big"}));
}

#[tokio::test]
async fn test_duplicate_and_idless_input_is_dispatched_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    let provider = Arc::new(FakeProvider::default());

    let mut records = items([1, 2]);
    records.push(json!({"id": 1, "prompt": "again"}));
    records.push(json!({"prompt": "no id"}));

    let summary = streaming_runner(provider.clone(), config())
        .run_records(records, &output)
        .await
        .expect("run");

    assert_eq!(provider.calls(), 2);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.dropped_missing_id, 1);
    assert_eq!(checkpoint_ids(&output), vec![1, 2]);
}

#[tokio::test]
async fn test_one_fatal_item_does_not_stop_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    let provider = Arc::new(FakeProvider::default().with_fatal("q5"));

    let summary = streaming_runner(provider.clone(), config())
        .run_records(items(1..=10), &output)
        .await
        .expect("run");

    assert_eq!(summary.succeeded, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(provider.calls(), 10);

    let set = checkpoint::load(&output);
    assert_eq!(set.len(), 10);
    let failed = set.get(&ItemId::Int(5)).expect("record for 5");
    let failure = failed.failure_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::RemoteFatal);
}

#[tokio::test]
async fn test_failures_are_sticky_unless_retried() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");

    let failing = Arc::new(FakeProvider::default().with_fatal("q2"));
    streaming_runner(failing, config())
        .run_records(items(1..=3), &output)
        .await
        .expect("first run");

    let healthy = Arc::new(FakeProvider::default());
    streaming_runner(healthy.clone(), config())
        .run_records(items(1..=3), &output)
        .await
        .expect("second run");
    assert_eq!(healthy.calls(), 0);

    let summary = streaming_runner(healthy.clone(), config().with_retry_failed(true))
        .run_records(items(1..=3), &output)
        .await
        .expect("retry run");
    assert_eq!(healthy.prompts(), vec!["q2".to_string()]);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(checkpoint::load(&output).failure_count(), 0);
}

#[tokio::test]
async fn test_rate_limit_gives_up_at_ceiling() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    let provider = Arc::new(FakeProvider::default().with_rate_limited("q1"));
    let retry = RetryPolicy::default()
        .with_max_attempts(4)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_elapsed(Duration::from_secs(2))
        .with_jitter(false);

    let start = Instant::now();
    let summary = streaming_runner(provider.clone(), config().with_retry(retry))
        .run_records(items([1, 2]), &output)
        .await
        .expect("run");

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(provider.calls(), 5);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failures_by_kind.get(&FailureKind::RemoteTransient), Some(&1));

    let set = checkpoint::load(&output);
    let failure = set
        .get(&ItemId::Int(1))
        .and_then(|r| r.failure_ref())
        .expect("failure for 1");
    assert!(failure.message.contains("4 attempts"));
}

#[tokio::test]
async fn test_item_without_prompt_fields_still_gets_a_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    let provider = Arc::new(FakeProvider::default());

    let summary = streaming_runner(provider.clone(), config())
        .run_records(vec![json!({"id": 1})], &output)
        .await
        .expect("run");

    assert_eq!(provider.calls(), 0);
    assert_eq!(summary.failures_by_kind.get(&FailureKind::Validation), Some(&1));
}

// ============================================================================
// Batch mode
// ============================================================================

#[tokio::test]
async fn test_batch_run_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    let provider = Arc::new(FakeBatchProvider::default());

    let mut records = items(1..=9);
    records.push(json!({"id": 10, "prompt": "expired"}));

    let summary = PipelineRunner::new(stage(), config())
        .with_mode(ExecutionMode::Batch)
        .with_batch_provider(provider.clone())
        .run_records(records, &output)
        .await
        .expect("run");

    assert_eq!(provider.submits.load(Ordering::SeqCst), 3);
    assert_eq!(summary.succeeded, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        summary.failures_by_kind.get(&FailureKind::RemoteTransient),
        Some(&1)
    );
    assert_eq!(checkpoint_ids(&output), (1..=10).collect::<Vec<_>>());
    assert_eq!(read_checkpoint(&output)[2], json!({"id": 3, "answer": "q3"}));
}

#[tokio::test]
async fn test_batch_submit_failure_marks_chunk_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    let provider = Arc::new(FakeBatchProvider {
        reject_submit: true,
        ..Default::default()
    });

    let summary = PipelineRunner::new(stage(), config())
        .with_mode(ExecutionMode::Batch)
        .with_batch_provider(provider)
        .run_records(items(1..=3), &output)
        .await
        .expect("run");

    assert_eq!(summary.failed, 3);
    let set = checkpoint::load(&output);
    assert_eq!(set.failures_by_kind().get(&FailureKind::RemoteFatal), Some(&3));
}
