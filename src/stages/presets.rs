//! The four model-backed stages of the curation pipeline.

use std::fmt;

use super::prompt::PromptTemplate;
use super::template_stage::{FieldSpec, TemplateStage};
use crate::dataset::Attachment;
use crate::error::TemplateError;
use crate::pipeline::config::{EngineConfig, ExecutionMode};

const HAIKU: &str = "claude-3-5-haiku-20241022";
const SONNET: &str = "claude-3-7-sonnet-20250219";

/// A preset stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Translate and rewrite the explanation text.
    Rewrite,
    /// Answer the puzzle from its image to check the reference answer.
    Verify,
    /// Abstract the rule behind a puzzle, guided by an example image.
    Abstract,
    /// Classify the abstracted rule.
    Classify,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Rewrite,
        StageKind::Verify,
        StageKind::Abstract,
        StageKind::Classify,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Rewrite => "rewrite",
            StageKind::Verify => "verify",
            StageKind::Abstract => "abstract",
            StageKind::Classify => "classify",
        }
    }

    /// Scheduling mode used when neither config nor CLI selects one.
    pub fn default_mode(&self) -> ExecutionMode {
        match self {
            StageKind::Rewrite | StageKind::Verify => ExecutionMode::Streaming,
            StageKind::Abstract | StageKind::Classify => ExecutionMode::Batch,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            StageKind::Rewrite => HAIKU,
            _ => SONNET,
        }
    }

    pub fn default_temperature(&self) -> f64 {
        match self {
            StageKind::Verify => 0.7,
            _ => 1.0,
        }
    }

    pub fn default_max_tokens(&self) -> u32 {
        match self {
            StageKind::Rewrite | StageKind::Classify => 8192,
            StageKind::Verify | StageKind::Abstract => 20000,
        }
    }

    /// Whether the stage needs a fixed example image.
    pub fn needs_example_image(&self) -> bool {
        matches!(self, StageKind::Abstract)
    }

    /// Builds the stage. Model, temperature and token limit come from
    /// `config` when set there, otherwise from the preset defaults.
    pub fn build(
        &self,
        template: PromptTemplate,
        example: Option<Attachment>,
        config: &EngineConfig,
    ) -> Result<TemplateStage, TemplateError> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| self.default_model().to_string());
        let mut stage = TemplateStage::new(self.name(), template)
            .with_model(model)
            .with_temperature(config.temperature.unwrap_or(self.default_temperature()))
            .with_max_tokens(config.max_tokens.unwrap_or(self.default_max_tokens()));

        stage = match self {
            StageKind::Rewrite => {
                stage.with_field(FieldSpec::text_or_raw("translated_explanation", "translation"))
            }
            StageKind::Verify => stage
                .with_item_image(true)
                .with_field(FieldSpec::text("reasoning"))
                .with_field(FieldSpec::text("answer"))
                .with_passthrough("correct_answer")
                .with_raw_field("raw_response"),
            StageKind::Abstract => stage
                .with_item_image(true)
                .with_passthrough("correct_answer")
                .with_field(FieldSpec::text("detailed_analysis"))
                .with_field(FieldSpec::text("puzzle_breakdown"))
                .with_field(FieldSpec::list("key_points"))
                .with_raw_field("raw_response"),
            StageKind::Classify => stage
                .with_item_image(true)
                .with_passthrough("correct_answer")
                .with_field(FieldSpec::text("puzzle_breakdown"))
                .with_field(FieldSpec::text("question_type"))
                .with_field(FieldSpec::text("knowledge_point"))
                .with_raw_field("raw_response"),
        };

        if let Some(example) = example {
            stage = stage.with_example_image(example);
        }
        stage.validate()?;
        Ok(stage)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::WorkItem;
    use crate::stages::Stage;
    use serde_json::json;

    fn template(source: &str) -> PromptTemplate {
        PromptTemplate::parse("t.md", source).expect("parse")
    }

    #[test]
    fn test_default_modes() {
        assert_eq!(StageKind::Rewrite.default_mode(), ExecutionMode::Streaming);
        assert_eq!(StageKind::Verify.default_mode(), ExecutionMode::Streaming);
        assert_eq!(StageKind::Abstract.default_mode(), ExecutionMode::Batch);
        assert_eq!(StageKind::Classify.default_mode(), ExecutionMode::Batch);
    }

    #[test]
    fn test_config_overrides_preset() {
        let config = EngineConfig::default()
            .with_model("custom-model")
            .with_temperature(0.2);
        let stage = StageKind::Rewrite
            .build(template("{{ explanation }}"), None, &config)
            .expect("stage");
        assert_eq!(stage.model(), "custom-model");
        assert_eq!(stage.temperature(), Some(0.2));
        assert_eq!(stage.max_tokens(), 8192);
    }

    #[test]
    fn test_rewrite_falls_back_to_raw() {
        let stage = StageKind::Rewrite
            .build(template("{{ explanation }}"), None, &EngineConfig::default())
            .expect("stage");
        let item = WorkItem::from_value(json!({"id": 1})).expect("item");
        let parsed = stage.parse_response(&item, "plain translation");
        assert_eq!(parsed.payload["translation"], json!("plain translation"));
        assert_eq!(parsed.payload.len(), 1);
    }

    #[test]
    fn test_classify_fields() {
        let stage = StageKind::Classify
            .build(template("<!--PUZZLE_SPLIT-->"), None, &EngineConfig::default())
            .expect("stage");
        let item = WorkItem::from_value(json!({"id": 1, "correct_answer": "A"})).expect("item");
        let text = "<puzzle_breakdown>p</puzzle_breakdown><question_type>q</question_type>\
                    <knowledge_point>k</knowledge_point>";
        let parsed = stage.parse_response(&item, text);
        assert!(parsed.missing_tags.is_empty());
        assert_eq!(parsed.payload["question_type"], json!("q"));
        assert_eq!(parsed.payload["correct_answer"], json!("A"));
    }

    #[test]
    fn test_abstract_requires_example() {
        let err = StageKind::Abstract
            .build(
                template("<!--EXAMPLE_SPLIT--><!--PUZZLE_SPLIT-->"),
                None,
                &EngineConfig::default(),
            )
            .unwrap_err();
        assert!(matches!(err, TemplateError::MissingImage { .. }));
    }
}
