//! End-of-run summary.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::config::ExecutionMode;
use super::planner::Plan;
use crate::checkpoint::{CheckpointSet, FailureKind};

/// Counts describing one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub stage: String,
    pub mode: ExecutionMode,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records read from the input.
    pub total_input: usize,
    pub dropped_missing_id: usize,
    pub duplicates: usize,
    /// Items skipped because the checkpoint already resolved them.
    pub already_resolved: usize,
    /// Items sent to the coordinator this run.
    pub dispatched: usize,
    /// Success records produced this run.
    pub succeeded: usize,
    /// Failure records produced this run.
    pub failed: usize,
    /// Records in the checkpoint after the final save.
    pub checkpoint_records: usize,
    pub checkpoint_successes: usize,
    pub checkpoint_failures: usize,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    /// Checkpoint writes performed this run.
    pub saves: usize,
    pub elapsed_secs: f64,
}

impl RunSummary {
    /// Starts a summary for a planned run. Outcome counts are filled in by
    /// [`RunSummary::finish`].
    pub fn begin(stage: &str, mode: ExecutionMode, output: &str, plan: &Plan) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            stage: stage.to_string(),
            mode,
            output: output.to_string(),
            started_at: now,
            finished_at: now,
            total_input: plan.total_input,
            dropped_missing_id: plan.dropped_missing_id,
            duplicates: plan.duplicates,
            already_resolved: plan.already_resolved,
            dispatched: plan.pending.len(),
            succeeded: 0,
            failed: 0,
            checkpoint_records: 0,
            checkpoint_successes: 0,
            checkpoint_failures: 0,
            failures_by_kind: BTreeMap::new(),
            saves: 0,
            elapsed_secs: 0.0,
        }
    }

    /// Records the run's outcome against the final checkpoint.
    pub fn finish(
        mut self,
        succeeded: usize,
        failed: usize,
        checkpoint: &CheckpointSet,
        saves: usize,
        elapsed: Duration,
    ) -> Self {
        self.finished_at = Utc::now();
        self.succeeded = succeeded;
        self.failed = failed;
        self.checkpoint_records = checkpoint.len();
        self.checkpoint_successes = checkpoint.success_count();
        self.checkpoint_failures = checkpoint.failure_count();
        self.failures_by_kind = checkpoint.failures_by_kind();
        self.saves = saves;
        self.elapsed_secs = elapsed.as_secs_f64();
        self
    }

    /// Emits the summary as log lines.
    pub fn log(&self) {
        info!(
            run_id = %self.run_id,
            stage = %self.stage,
            mode = %self.mode,
            input = self.total_input,
            skipped = self.already_resolved,
            dropped = self.dropped_missing_id,
            duplicates = self.duplicates,
            dispatched = self.dispatched,
            "Run finished"
        );
        info!(
            succeeded = self.succeeded,
            failed = self.failed,
            checkpoint_records = self.checkpoint_records,
            checkpoint_successes = self.checkpoint_successes,
            checkpoint_failures = self.checkpoint_failures,
            saves = self.saves,
            elapsed_secs = format!("{:.1}", self.elapsed_secs),
            output = %self.output,
            "Run results"
        );
        for (kind, count) in &self.failures_by_kind {
            info!(kind = %kind, count, "Failures by kind");
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
