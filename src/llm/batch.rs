//! Provider-side batch submission.
//!
//! A batch groups many generation requests under one provider job. The job is
//! created with [`BatchProvider::submit`], polled with [`BatchProvider::status`]
//! until it ends, and its per-request outcomes are read back with
//! [`BatchProvider::results`], keyed by the caller-chosen custom id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::{GenerationRequest, GenerationResponse};
use crate::error::LlmError;

/// One request inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Caller-chosen id, unique within the batch.
    pub custom_id: String,
    pub params: GenerationRequest,
}

/// Processing status of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Canceling,
    Ended,
}

impl BatchStatus {
    pub fn is_ended(&self) -> bool {
        matches!(self, BatchStatus::Ended)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Canceling => "canceling",
            BatchStatus::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Outcome of one request in an ended batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEntryOutcome {
    Succeeded(GenerationResponse),
    Errored { error_type: String, message: String },
    Canceled,
    Expired,
}

/// One line of a batch's results.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub custom_id: String,
    pub outcome: BatchEntryOutcome,
}

/// Trait for providers that accept grouped submissions.
#[async_trait]
pub trait BatchProvider: Send + Sync {
    /// Submits the requests as one job and returns the provider's job id.
    async fn submit(&self, requests: Vec<BatchRequest>) -> Result<String, LlmError>;

    /// Returns the job's current processing status.
    async fn status(&self, batch_id: &str) -> Result<BatchStatus, LlmError>;

    /// Returns the per-request outcomes of an ended job.
    async fn results(&self, batch_id: &str) -> Result<Vec<BatchEntry>, LlmError>;
}
