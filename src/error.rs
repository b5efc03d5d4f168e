//! Error types for puzzle-forge operations.
//!
//! Defines error types for the subsystems shared by every curation stage:
//! - Remote LLM calls (streaming and provider batch)
//! - Input dataset loading and attachment encoding
//! - Checkpoint persistence
//! - Prompt template loading and rendering
//! - The correctness filter

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: ANTHROPIC_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Batch '{batch_id}' error: {message}")]
    Batch { batch_id: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LlmError {
    /// Whether the failure is a transient rate-limit condition worth retrying.
    ///
    /// Every other error is terminal for the current attempt sequence.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimited(_))
    }
}

/// Errors that can occur while reading the upstream input file.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Input file not found: {0}")]
    NotFound(PathBuf),

    #[error("Could not decode JSON from input file '{path}': {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Input '{0}' must be a JSON array of objects or a single object")]
    InvalidShape(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while loading an image attachment.
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Image not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read image '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while persisting the checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur during prompt template operations.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Prompt template not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse prompt template '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Failed to render prompt template: {0}")]
    Render(String),

    #[error("Template references an image marker '{marker}' but no {what} image is available")]
    MissingImage { marker: String, what: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while filtering verified results.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Failed to write filtered dataset '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
