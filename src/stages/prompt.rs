//! Prompt templates with inline image markers.
//!
//! Templates are tera files rendered against the item's fields. The rendered
//! text is split on image markers, and each marker is replaced by an image
//! content block:
//!
//! - `<!--EXAMPLE_SPLIT-->`: the stage's fixed example image
//! - `<!--PUZZLE_SPLIT-->` or `<!--SPLIT-->`: the item's own image

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tera::{Context, Tera};

use crate::dataset::{Attachment, WorkItem};
use crate::error::TemplateError;
use crate::llm::ContentBlock;

/// Marker replaced by the example image.
pub const EXAMPLE_MARKER: &str = "<!--EXAMPLE_SPLIT-->";
/// Marker replaced by the item image.
pub const ITEM_MARKER: &str = "<!--PUZZLE_SPLIT-->";
/// Older spelling of [`ITEM_MARKER`].
pub const LEGACY_ITEM_MARKER: &str = "<!--SPLIT-->";

const TEMPLATE_NAME: &str = "prompt";

/// Fields every template may reference even when an item lacks them.
const DEFAULT_FIELDS: [&str; 3] = ["prompt", "explanation", "correct_answer"];

/// A parsed prompt template.
#[derive(Debug)]
pub struct PromptTemplate {
    path: PathBuf,
    source: String,
    tera: Tera,
}

impl PromptTemplate {
    /// Loads and parses a template file.
    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        if !path.exists() {
            return Err(TemplateError::NotFound(path.to_path_buf()));
        }
        let source = std::fs::read_to_string(path)?;
        Self::parse(path, source)
    }

    /// Parses template source. `path` is only used in error messages.
    pub fn parse(path: impl Into<PathBuf>, source: impl Into<String>) -> Result<Self, TemplateError> {
        let path = path.into();
        let source = source.into();
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, &source)
            .map_err(|e| TemplateError::ParseError {
                path: path.clone(),
                message: error_chain(&e),
            })?;
        Ok(Self { path, source, tera })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the template source contains the example image marker.
    pub fn uses_example_image(&self) -> bool {
        self.source.contains(EXAMPLE_MARKER)
    }

    /// Whether the template source contains an item image marker.
    pub fn uses_item_image(&self) -> bool {
        self.source.contains(ITEM_MARKER) || self.source.contains(LEGACY_ITEM_MARKER)
    }

    /// Renders the template for one item.
    ///
    /// Besides the item's own fields, the context carries:
    /// `question` (alias of `prompt`), `options_block` (`"k": "v"` per line),
    /// `options_lines` (`k: v` per line) and `hint` (the explanation, with
    /// list entries joined by newlines).
    ///
    /// An object-valued `options` renders as `options_lines`, and a
    /// list-valued `explanation` renders as `hint`.
    pub fn render(&self, item: &WorkItem) -> Result<String, TemplateError> {
        let context = build_context(item.fields());
        self.tera
            .render(TEMPLATE_NAME, &context)
            .map_err(|e| TemplateError::Render(error_chain(&e)))
    }

    /// Renders the template and splits it into content blocks.
    pub fn build_content(
        &self,
        item: &WorkItem,
        example: Option<&Attachment>,
        image: Option<&Attachment>,
    ) -> Result<Vec<ContentBlock>, TemplateError> {
        let rendered = self.render(item)?;
        split_markers(&rendered, example, image)
    }
}

fn build_context(fields: &Map<String, Value>) -> Context {
    let mut context = Context::new();
    for name in DEFAULT_FIELDS {
        context.insert(name, "");
    }
    for (key, value) in fields {
        context.insert(key.as_str(), value);
    }

    let prompt = fields.get("prompt").map(value_text).unwrap_or_default();
    context.insert("question", &prompt);

    let options: Vec<(String, String)> = match fields.get("options") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), value_text(v))).collect(),
        _ => Vec::new(),
    };
    let options_block = options
        .iter()
        .map(|(k, v)| format!("\"{k}\": \"{v}\""))
        .collect::<Vec<_>>()
        .join("\n");
    let options_lines = options
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n");
    context.insert("options_block", &options_block);
    context.insert("options_lines", &options_lines);
    if matches!(fields.get("options"), Some(Value::Object(_))) {
        context.insert("options", &options_lines);
    }

    let hint = match fields.get("explanation") {
        Some(Value::Array(parts)) => parts.iter().map(value_text).collect::<Vec<_>>().join("\n"),
        Some(other) => value_text(other),
        None => String::new(),
    };
    context.insert("hint", &hint);
    if matches!(fields.get("explanation"), Some(Value::Array(_))) {
        context.insert("explanation", &hint);
    }

    context
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Splits rendered text on image markers. Empty text segments are dropped.
fn split_markers(
    rendered: &str,
    example: Option<&Attachment>,
    image: Option<&Attachment>,
) -> Result<Vec<ContentBlock>, TemplateError> {
    let markers = [EXAMPLE_MARKER, ITEM_MARKER, LEGACY_ITEM_MARKER];
    let mut blocks = Vec::new();
    let mut rest = rendered;

    loop {
        let next = markers
            .iter()
            .filter_map(|marker| rest.find(marker).map(|pos| (pos, *marker)))
            .min_by_key(|(pos, _)| *pos);

        let Some((pos, marker)) = next else {
            push_text(&mut blocks, rest);
            break;
        };

        push_text(&mut blocks, &rest[..pos]);
        let (attachment, what) = if marker == EXAMPLE_MARKER {
            (example, "example")
        } else {
            (image, "item")
        };
        let attachment = attachment.ok_or_else(|| TemplateError::MissingImage {
            marker: marker.to_string(),
            what: what.to_string(),
        })?;
        blocks.push(ContentBlock::image(attachment));
        rest = &rest[pos + marker.len()..];
    }

    Ok(blocks)
}

fn push_text(blocks: &mut Vec<ContentBlock>, text: &str) {
    if !text.trim().is_empty() {
        blocks.push(ContentBlock::text(text));
    }
}

fn error_chain(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
