//! Run driver tying the engine together.
//!
//! load checkpoint -> plan -> dispatch (worker pool or batch jobs) ->
//! final save -> summary. Only setup problems surface as errors; every
//! per-item problem ends up as a failure record in the checkpoint.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use super::config::{ConfigError, EngineConfig, ExecutionMode};
use super::executor::UnitExecutor;
use super::pacing::Pacer;
use super::planner::plan;
use super::progress::{ProgressCounters, ProgressMonitor};
use super::summary::RunSummary;
use crate::checkpoint::CheckpointStore;
use crate::dataset::{read_input, WorkItem};
use crate::error::{CheckpointError, InputError};
use crate::llm::{BatchProvider, LlmProvider};
use crate::scheduler::{BatchConfig, BatchCoordinator, WorkerPool, WorkerPoolConfig};
use crate::stages::Stage;

/// Errors that abort a run before or after dispatch.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The input file could not be read.
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    /// The final checkpoint save failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The selected mode has no provider to talk to.
    #[error("No provider configured for {0} mode")]
    MissingProvider(ExecutionMode),
}

/// Runs one stage over one input file.
pub struct PipelineRunner {
    stage: Arc<dyn Stage>,
    config: EngineConfig,
    mode: ExecutionMode,
    provider: Option<Arc<dyn LlmProvider>>,
    batch_provider: Option<Arc<dyn BatchProvider>>,
}

impl PipelineRunner {
    /// Mode defaults to the configured one, or streaming.
    pub fn new(stage: Arc<dyn Stage>, config: EngineConfig) -> Self {
        let mode = config.mode_or(ExecutionMode::Streaming);
        Self {
            stage,
            config,
            mode,
            provider: None,
            batch_provider: None,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Provider used in streaming mode.
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Provider used in batch mode.
    pub fn with_batch_provider(mut self, provider: Arc<dyn BatchProvider>) -> Self {
        self.batch_provider = Some(provider);
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reads `input` and runs it against the checkpoint at `output`.
    pub async fn run(
        &self,
        input: &Path,
        output: &Path,
        image_dir: Option<&Path>,
    ) -> Result<RunSummary, PipelineError> {
        self.check_setup()?;
        let records = read_input(input, image_dir)?;
        info!(
            input = %input.display(),
            records = records.len(),
            stage = self.stage.name(),
            "Loaded input"
        );
        self.run_records(records, output).await
    }

    /// Runs already loaded input records against the checkpoint at `output`.
    pub async fn run_records(
        &self,
        records: Vec<Value>,
        output: &Path,
    ) -> Result<RunSummary, PipelineError> {
        self.check_setup()?;
        let start = Instant::now();

        let store = Arc::new(CheckpointStore::open(output, self.config.save_interval));
        let loaded = store.snapshot().await;
        info!(
            output = %output.display(),
            records = loaded.len(),
            "Loaded checkpoint"
        );

        let plan = plan(records, &loaded, self.config.retry_failed);
        let summary = RunSummary::begin(
            self.stage.name(),
            self.mode,
            &output.display().to_string(),
            &plan,
        );

        if plan.is_empty() {
            info!(
                resolved = plan.already_resolved,
                "All items already resolved, rewriting checkpoint"
            );
            store.flush().await?;
            let snapshot = store.snapshot().await;
            return Ok(summary.finish(0, 0, &snapshot, store.saves().await, start.elapsed()));
        }

        info!(
            pending = plan.pending.len(),
            skipped = plan.already_resolved,
            mode = %self.mode,
            "Dispatching pending items"
        );

        let progress = ProgressCounters::new();
        let monitor = ProgressMonitor::start(
            self.stage.name(),
            progress.clone(),
            plan.pending.len(),
            self.config.progress_interval,
        );

        let (succeeded, failed) = match self.mode {
            ExecutionMode::Streaming => self.run_streaming(plan.pending, &store, progress).await?,
            ExecutionMode::Batch => self.run_batch(plan.pending, &store, progress).await?,
        };
        monitor.stop().await;

        store.flush().await?;
        let snapshot = store.snapshot().await;
        Ok(summary.finish(
            succeeded,
            failed,
            &snapshot,
            store.saves().await,
            start.elapsed(),
        ))
    }

    fn check_setup(&self) -> Result<(), PipelineError> {
        self.config.validate()?;
        let available = match self.mode {
            ExecutionMode::Streaming => self.provider.is_some(),
            ExecutionMode::Batch => self.batch_provider.is_some(),
        };
        if available {
            Ok(())
        } else {
            Err(PipelineError::MissingProvider(self.mode))
        }
    }

    async fn run_streaming(
        &self,
        items: Vec<WorkItem>,
        store: &Arc<CheckpointStore>,
        progress: ProgressCounters,
    ) -> Result<(usize, usize), PipelineError> {
        let provider = self
            .provider
            .clone()
            .ok_or(PipelineError::MissingProvider(ExecutionMode::Streaming))?;
        let executor = UnitExecutor::new(Arc::clone(&self.stage), provider)
            .with_retry(self.config.retry.clone())
            .with_pacer(Pacer::new(
                self.config.request_delay,
                self.config.request_jitter,
            ));
        let pool = WorkerPool::new(
            WorkerPoolConfig::new(self.config.concurrency),
            Arc::new(executor),
            Arc::clone(store),
        )
        .with_progress(progress);

        let stats = pool.run(items).await;
        Ok((stats.items_succeeded as usize, stats.items_failed as usize))
    }

    async fn run_batch(
        &self,
        items: Vec<WorkItem>,
        store: &Arc<CheckpointStore>,
        progress: ProgressCounters,
    ) -> Result<(usize, usize), PipelineError> {
        let provider = self
            .batch_provider
            .clone()
            .ok_or(PipelineError::MissingProvider(ExecutionMode::Batch))?;
        let coordinator = BatchCoordinator::new(
            Arc::clone(&self.stage),
            provider,
            Arc::clone(store),
            BatchConfig {
                batch_size: self.config.batch_size,
                poll_interval: self.config.poll_interval,
                save_every: self.config.batch_save_every,
            },
        )
        .with_retry(self.config.retry.clone())
        .with_progress(progress);

        let stats = coordinator.run(items).await;
        Ok((stats.succeeded, stats.failed))
    }
}
