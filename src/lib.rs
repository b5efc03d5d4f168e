//! puzzle-forge: resumable LLM batch engine for visual-puzzle data curation.
//!
//! This library drives every item of an input dataset through a model-backed
//! stage exactly once, persisting results to a checkpoint so interrupted runs
//! resume where they stopped.

// Core modules
pub mod checkpoint;
pub mod cli;
pub mod dataset;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod stages;
pub mod utils;

// Re-export commonly used error types
pub use error::{
    AttachmentError, CheckpointError, FilterError, InputError, LlmError, TemplateError,
};
