//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, BATCH_POLLS_TOTAL, CHECKPOINT_SAVES_TOTAL, ITEMS_TOTAL, LLM_LATENCY,
    LLM_REQUESTS_TOTAL, LLM_TOKENS_TOTAL, RETRIES_TOTAL,
};

/// Token usage information for LLM requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    /// Number of input/prompt tokens.
    pub input_tokens: u64,
    /// Number of output/completion tokens.
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Metrics collector for recording engine metrics.
///
/// Zero-sized; create one wherever needed. Every method is a no-op until
/// `init_metrics()` has been called.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one resolved work item.
    ///
    /// `outcome` is `success` or the failure kind name.
    pub fn record_item(&self, stage: &str, outcome: &str) {
        if let Some(items_total) = ITEMS_TOTAL.get() {
            items_total.with_label_values(&[stage, outcome]).inc();
        }

        tracing::trace!(stage = stage, outcome = outcome, "Recorded item metric");
    }

    /// Record one remote call attempt.
    pub fn record_llm_request(
        &self,
        model: &str,
        success: bool,
        latency_secs: f64,
        tokens: TokenUsage,
    ) {
        let status = if success { "success" } else { "failure" };

        if let Some(llm_requests) = LLM_REQUESTS_TOTAL.get() {
            llm_requests.with_label_values(&[model, status]).inc();
        }

        if let Some(llm_latency) = LLM_LATENCY.get() {
            llm_latency.with_label_values(&[model]).observe(latency_secs);
        }

        if let Some(llm_tokens) = LLM_TOKENS_TOTAL.get() {
            llm_tokens
                .with_label_values(&[model, "input"])
                .inc_by(tokens.input_tokens as f64);
            llm_tokens
                .with_label_values(&[model, "output"])
                .inc_by(tokens.output_tokens as f64);
        }

        tracing::trace!(
            model = model,
            status = status,
            latency_secs = latency_secs,
            input_tokens = tokens.input_tokens,
            output_tokens = tokens.output_tokens,
            "Recorded LLM request metric"
        );
    }

    pub fn record_retry(&self) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.inc();
        }
    }

    pub fn record_checkpoint_save(&self) {
        if let Some(saves) = CHECKPOINT_SAVES_TOTAL.get() {
            saves.inc();
        }
    }

    pub fn record_batch_poll(&self) {
        if let Some(polls) = BATCH_POLLS_TOTAL.get() {
            polls.inc();
        }
    }

    pub fn inc_active_workers(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_token_usage() {
        let usage = TokenUsage::new(1000, 500);
        assert_eq!(usage.total(), 1500);
        assert_eq!(TokenUsage::default().total(), 0);
    }

    #[test]
    fn test_collector_without_init_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_item("verify", "success");
        collector.record_retry();
        collector.dec_active_workers();
    }

    #[test]
    fn test_record_item_and_request() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_item("rewrite", "success");
        collector.record_item("rewrite", "remote_fatal");
        collector.record_llm_request("claude-3-7-sonnet", true, 1.2, TokenUsage::new(100, 20));
        collector.record_batch_poll();
        collector.inc_active_workers();
        collector.dec_active_workers();

        let exported = export_metrics();
        assert!(exported.contains("puzzle_forge_items_total"));
        assert!(exported.contains("puzzle_forge_llm_tokens_total"));
    }
}
