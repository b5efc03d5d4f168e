//! Template-driven stage: render a prompt, extract tagged fields.

use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::warn;

use super::prompt::PromptTemplate;
use super::{ParsedResponse, Stage};
use crate::checkpoint::Failure;
use crate::dataset::{Attachment, WorkItem, IMAGE_FIELD};
use crate::error::TemplateError;
use crate::llm::{GenerationRequest, Message, DEFAULT_MAX_TOKENS};
use crate::utils::tags::{extract_list, extract_tag, extract_tag_or_raw};

/// How a tag's content is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Trimmed text; empty string when the tag is absent.
    Text,
    /// Trimmed text; the whole response when the tag is absent.
    TextOrRaw,
    /// Bullet list; empty list when the tag is absent.
    List,
}

/// Maps one response tag to one result field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub tag: String,
    pub field: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn text(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            field: tag.clone(),
            tag,
            kind: FieldKind::Text,
        }
    }

    pub fn list(tag: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::List,
            ..Self::text(tag)
        }
    }

    /// Stores `tag` under a different field name, falling back to the raw response.
    pub fn text_or_raw(tag: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            field: field.into(),
            kind: FieldKind::TextOrRaw,
        }
    }
}

/// A stage defined by a prompt template and a tag mapping.
#[derive(Debug)]
pub struct TemplateStage {
    name: String,
    template: PromptTemplate,
    model: String,
    system: Option<String>,
    temperature: Option<f64>,
    max_tokens: u32,
    requires_image: bool,
    example_image: Option<Attachment>,
    fields: Vec<FieldSpec>,
    passthrough: Vec<String>,
    raw_field: Option<String>,
}

impl TemplateStage {
    pub fn new(name: impl Into<String>, template: PromptTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            model: String::new(),
            system: None,
            temperature: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            requires_image: false,
            example_image: None,
            fields: Vec::new(),
            passthrough: Vec::new(),
            raw_field: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Requires every item to carry an existing `image` file.
    pub fn with_item_image(mut self, required: bool) -> Self {
        self.requires_image = required;
        self
    }

    pub fn with_example_image(mut self, example: Attachment) -> Self {
        self.example_image = Some(example);
        self
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Copies an input field into every success payload.
    pub fn with_passthrough(mut self, field: impl Into<String>) -> Self {
        self.passthrough.push(field.into());
        self
    }

    /// Stores the full response text under `field`.
    pub fn with_raw_field(mut self, field: impl Into<String>) -> Self {
        self.raw_field = Some(field.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn template(&self) -> &PromptTemplate {
        &self.template
    }

    /// Checks setup-time consistency between the template and the stage.
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.template.uses_example_image() && self.example_image.is_none() {
            return Err(TemplateError::MissingImage {
                marker: super::EXAMPLE_MARKER.to_string(),
                what: "example".to_string(),
            });
        }
        Ok(())
    }

    fn load_image(&self, item: &WorkItem) -> Result<Option<Attachment>, Failure> {
        if !self.requires_image {
            return Ok(None);
        }
        let path: PathBuf = item
            .path_field(IMAGE_FIELD)
            .ok_or_else(|| Failure::validation(format!("item has no '{IMAGE_FIELD}' field")))?;
        Attachment::from_path(&path)
            .map(Some)
            .map_err(|e| Failure::attachment_missing(e.to_string()))
    }
}

impl Stage for TemplateStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_request(&self, item: &WorkItem) -> Result<GenerationRequest, Failure> {
        let image = self.load_image(item)?;
        let content = self
            .template
            .build_content(item, self.example_image.as_ref(), image.as_ref())
            .map_err(|e| Failure::validation(e.to_string()))?;
        if content.is_empty() {
            return Err(Failure::validation("rendered prompt is empty"));
        }

        let mut request = GenerationRequest::new(self.model.clone(), vec![Message::user_blocks(content)])
            .with_max_tokens(self.max_tokens);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(system) = &self.system {
            request = request.with_system(system.clone());
        }
        Ok(request)
    }

    fn parse_response(&self, item: &WorkItem, text: &str) -> ParsedResponse {
        let mut payload = Map::new();
        let mut missing_tags = Vec::new();

        for spec in &self.fields {
            let value = match spec.kind {
                FieldKind::Text => extract_tag(text, &spec.tag).map(Value::String),
                FieldKind::List => extract_list(text, &spec.tag)
                    .map(|items| Value::Array(items.into_iter().map(Value::String).collect())),
                FieldKind::TextOrRaw => {
                    let (content, fallback) = extract_tag_or_raw(text, &spec.tag);
                    if fallback {
                        missing_tags.push(spec.tag.clone());
                    }
                    Some(Value::String(content))
                }
            };
            let value = value.unwrap_or_else(|| {
                missing_tags.push(spec.tag.clone());
                match spec.kind {
                    FieldKind::List => Value::Array(Vec::new()),
                    _ => Value::String(String::new()),
                }
            });
            payload.insert(spec.field.clone(), value);
        }

        for field in &self.passthrough {
            let value = item
                .field(field)
                .cloned()
                .unwrap_or_else(|| Value::String(String::new()));
            payload.insert(field.clone(), value);
        }

        if let Some(raw) = &self.raw_field {
            payload.insert(raw.clone(), Value::String(text.to_string()));
        }

        if !missing_tags.is_empty() {
            warn!(
                stage = %self.name,
                item_id = %item.id(),
                tags = ?missing_tags,
                "Expected tags not found in response"
            );
        }

        ParsedResponse {
            payload,
            missing_tags,
        }
    }
}
