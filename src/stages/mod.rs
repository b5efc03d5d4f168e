//! Pipeline stages.
//!
//! A stage knows how to turn a work item into a model request and how to turn
//! the model's free-text answer into result fields. Everything else (pacing,
//! retry, checkpointing, scheduling) lives in [`crate::pipeline`] and
//! [`crate::scheduler`] and is shared by every stage.

pub mod presets;
pub mod prompt;
pub mod template_stage;

use serde_json::{Map, Value};

use crate::checkpoint::Failure;
use crate::dataset::WorkItem;
use crate::llm::GenerationRequest;

pub use presets::StageKind;
pub use prompt::{PromptTemplate, EXAMPLE_MARKER, ITEM_MARKER, LEGACY_ITEM_MARKER};
pub use template_stage::{FieldKind, FieldSpec, TemplateStage};

/// Result fields parsed from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub payload: Map<String, Value>,
    /// Tags that were expected but absent from the response.
    pub missing_tags: Vec<String>,
}

/// One transformation step of the curation pipeline.
pub trait Stage: Send + Sync {
    /// Short name used in logs, metrics and summaries.
    fn name(&self) -> &str;

    /// Builds the request for one item.
    ///
    /// Errors are terminal for the item: a missing required field or a
    /// missing attachment is never retried.
    fn build_request(&self, item: &WorkItem) -> Result<GenerationRequest, Failure>;

    /// Parses a response. Never fails: absent tags fall back to defaults.
    fn parse_response(&self, item: &WorkItem, text: &str) -> ParsedResponse;
}
