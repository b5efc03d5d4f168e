//! Prometheus metrics registration and export.
//!
//! Metrics live in process-wide statics and are only recorded after
//! [`init_metrics`] has run. Until then every recording call is a no-op.

use ::prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::path::Path;
use std::sync::OnceLock;

/// Global Prometheus registry for all puzzle_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Work items resolved, labeled by stage and outcome (`success` or a failure kind).
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Remote calls, labeled by model and status.
pub static LLM_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Remote call latency in seconds, labeled by model.
pub static LLM_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Tokens used, labeled by model and type (input/output).
pub static LLM_TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Backoff retries after a rate-limit response.
pub static RETRIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Checkpoint files written.
pub static CHECKPOINT_SAVES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Provider batch status polls.
pub static BATCH_POLLS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Workers currently executing a unit of work.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let items_total = CounterVec::new(
        Opts::new("puzzle_forge_items_total", "Work items resolved"),
        &["stage", "outcome"],
    )?;

    let llm_requests_total = CounterVec::new(
        Opts::new("puzzle_forge_llm_requests_total", "Total LLM API requests"),
        &["model", "status"],
    )?;

    let llm_latency = HistogramVec::new(
        HistogramOpts::new(
            "puzzle_forge_llm_latency_seconds",
            "LLM API request latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["model"],
    )?;

    let llm_tokens_total = CounterVec::new(
        Opts::new("puzzle_forge_llm_tokens_total", "Total tokens used"),
        &["model", "type"],
    )?;

    let retries_total = Counter::new(
        "puzzle_forge_retries_total",
        "Remote calls retried after rate limiting",
    )?;

    let checkpoint_saves_total = Counter::new(
        "puzzle_forge_checkpoint_saves_total",
        "Checkpoint files written",
    )?;

    let batch_polls_total = Counter::new(
        "puzzle_forge_batch_polls_total",
        "Provider batch status polls",
    )?;

    let active_workers = Gauge::new(
        "puzzle_forge_active_workers",
        "Workers currently executing a unit of work",
    )?;

    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(llm_requests_total.clone()))?;
    registry.register(Box::new(llm_latency.clone()))?;
    registry.register(Box::new(llm_tokens_total.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(checkpoint_saves_total.clone()))?;
    registry.register(Box::new(batch_polls_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = LLM_REQUESTS_TOTAL.set(llm_requests_total);
    let _ = LLM_LATENCY.set(llm_latency);
    let _ = LLM_TOKENS_TOTAL.set(llm_tokens_total);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = CHECKPOINT_SAVES_TOTAL.set(checkpoint_saves_total);
    let _ = BATCH_POLLS_TOTAL.set(batch_polls_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the text exposition to `path`, creating the parent directory.
pub fn write_metrics(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, export_metrics())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();
        if let Some(saves) = CHECKPOINT_SAVES_TOTAL.get() {
            saves.inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("puzzle_forge_checkpoint_saves_total"));
    }

    #[test]
    fn test_write_metrics() {
        let _ = init_metrics();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out/metrics.prom");
        write_metrics(&path).expect("write");
        assert!(path.exists());
    }
}
