//! Unit-of-work executor.
//!
//! Turns one work item into exactly one [`ResultRecord`]. Every error on the
//! way is classified into a [`FailureKind`] and returned as a failure record;
//! nothing escapes this boundary.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::pacing::Pacer;
use super::retry::{retry_with_backoff, RetryFailure, RetryPolicy};
use crate::checkpoint::{Failure, FailureKind, ResultRecord};
use crate::dataset::WorkItem;
use crate::error::LlmError;
use crate::llm::LlmProvider;
use crate::metrics::{MetricsCollector, TokenUsage};
use crate::stages::Stage;

/// Executes single items against a streaming provider.
pub struct UnitExecutor {
    stage: Arc<dyn Stage>,
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    pacer: Pacer,
    metrics: MetricsCollector,
}

impl UnitExecutor {
    pub fn new(stage: Arc<dyn Stage>, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            stage,
            provider,
            retry: RetryPolicy::default(),
            pacer: Pacer::none(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pacer(mut self, pacer: Pacer) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn stage(&self) -> &Arc<dyn Stage> {
        &self.stage
    }

    /// Runs one item to completion.
    pub async fn execute(&self, item: &WorkItem) -> ResultRecord {
        let stage = self.stage.name();

        let request = match self.stage.build_request(item) {
            Ok(request) => request,
            Err(failure) => {
                warn!(stage, item_id = %item.id(), error = %failure, "Item rejected before remote call");
                return self.finish(ResultRecord::failure(item.id().clone(), failure));
            }
        };

        let pacer = &self.pacer;
        let provider = &self.provider;
        let metrics = self.metrics;
        let result = retry_with_backoff(&self.retry, || {
            let request = request.clone();
            async move {
                pacer.wait().await;
                let model = request.model.clone();
                let start = Instant::now();
                let response = provider.generate(request).await;
                let latency = start.elapsed().as_secs_f64();
                match &response {
                    Ok(resp) => metrics.record_llm_request(
                        &model,
                        true,
                        latency,
                        TokenUsage::new(
                            resp.usage.input_tokens as u64,
                            resp.usage.output_tokens as u64,
                        ),
                    ),
                    Err(_) => metrics.record_llm_request(&model, false, latency, TokenUsage::default()),
                }
                response
            }
        })
        .await;

        let record = match result {
            Ok(response) => record_from_text(self.stage.as_ref(), item, &response.text()),
            Err(failure) => {
                let failure = classify_retry_failure(&failure);
                warn!(stage, item_id = %item.id(), error = %failure, "Remote call failed");
                ResultRecord::failure(item.id().clone(), failure)
            }
        };
        self.finish(record)
    }

    fn finish(&self, record: ResultRecord) -> ResultRecord {
        let outcome = match record.failure_ref() {
            Some(failure) => failure.kind.as_str(),
            None => "success",
        };
        self.metrics.record_item(self.stage.name(), outcome);
        record
    }
}

/// Builds the record for a response text.
///
/// An empty response yields a `parse_fallback` failure; anything else is
/// parsed by the stage and stored as a success.
pub fn record_from_text(stage: &dyn Stage, item: &WorkItem, text: &str) -> ResultRecord {
    if text.trim().is_empty() {
        return ResultRecord::failure(
            item.id().clone(),
            Failure::new(FailureKind::ParseFallback, "response contained no text"),
        );
    }
    let parsed = stage.parse_response(item, text);
    debug!(
        stage = stage.name(),
        item_id = %item.id(),
        fields = parsed.payload.len(),
        "Parsed response"
    );
    ResultRecord::success(item.id().clone(), parsed.payload)
}

/// Maps a provider error to a failure.
pub fn classify_error(error: &LlmError) -> Failure {
    let kind = if error.is_retryable() {
        FailureKind::RemoteTransient
    } else {
        FailureKind::RemoteFatal
    };
    Failure::new(kind, error.to_string())
}

/// Maps the final error of an attempt sequence to a failure.
pub fn classify_retry_failure(failure: &RetryFailure) -> Failure {
    let mut classified = classify_error(&failure.error);
    if failure.is_exhausted() {
        classified.message = format!(
            "{} (gave up after {} attempts)",
            classified.message, failure.attempts
        );
    }
    classified
}
