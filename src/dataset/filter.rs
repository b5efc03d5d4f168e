//! Correctness filter between verification and rule extraction.
//!
//! Keeps only the questions whose verified answer matches the reference
//! answer, re-indexes them from zero and optionally copies their images
//! into the output directory under canonical names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use super::item::{read_records, ItemId, ID_FIELD, IMAGE_FIELD};
use crate::error::FilterError;

/// File name of the filtered question set inside the output directory.
pub const FILTERED_QUESTIONS_FILE: &str = "questions.json";

/// Result of a filter run.
#[derive(Debug, Clone, Default)]
pub struct FilterReport {
    /// Questions in the source file.
    pub source_questions: usize,
    /// Verification results whose answer matched.
    pub correct: usize,
    /// Questions written to the filtered file.
    pub written: usize,
    /// Images copied into `<output>/images`.
    pub images_copied: usize,
    /// Images that could not be located.
    pub images_missing: usize,
    /// Path of the filtered JSON file.
    pub output_file: PathBuf,
}

/// A question selected by the filter, with its new identity.
#[derive(Debug, Clone)]
pub struct FilteredQuestion {
    /// The question with `id` (and `image`, if any) rewritten.
    pub question: Value,
    /// Original image reference and new file name, when the question has an image.
    pub image: Option<(String, String)>,
}

fn normalize_answer(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_uppercase(),
        Value::Null => String::new(),
        other => other.to_string().trim().to_uppercase(),
    }
}

/// Returns the ids of verification results whose `answer` equals `correct_answer`.
///
/// Comparison is trimmed and case-insensitive; records lacking either field
/// or an id are ignored. Order follows the results file.
pub fn correct_ids(results: &[Value]) -> Vec<ItemId> {
    results
        .iter()
        .filter_map(|record| {
            let answer = record.get("answer")?;
            let correct = record.get("correct_answer")?;
            let id = record.get(ID_FIELD).and_then(ItemId::from_value)?;
            (normalize_answer(answer) == normalize_answer(correct)).then_some(id)
        })
        .collect()
}

/// Selects and re-indexes the questions with the given ids.
pub fn select_questions(ids: &[ItemId], questions: &[Value]) -> Vec<FilteredQuestion> {
    let by_id: HashMap<ItemId, &Value> = questions
        .iter()
        .filter_map(|q| q.get(ID_FIELD).and_then(ItemId::from_value).map(|id| (id, q)))
        .collect();

    let mut selected = Vec::new();
    for (new_id, original_id) in ids.iter().enumerate() {
        let Some(question) = by_id.get(original_id) else {
            warn!(id = %original_id, "Correct result has no matching question");
            continue;
        };

        let mut question = (*question).clone();
        let mut image = None;
        if let Value::Object(fields) = &mut question {
            fields.insert(ID_FIELD.to_string(), Value::from(new_id as i64));

            if let Some(original) = fields
                .get(IMAGE_FIELD)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
            {
                let ext = Path::new(&original)
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| format!(".{}", e))
                    .unwrap_or_default();
                let new_name = format!("image_{}{}", new_id, ext);
                fields.insert(
                    IMAGE_FIELD.to_string(),
                    Value::String(format!("images/{}", new_name)),
                );
                image = Some((original, new_name));
            }
        }

        selected.push(FilteredQuestion { question, image });
    }
    selected
}

fn locate_image(original: &str, questions_dir: &Path) -> Option<PathBuf> {
    let original_path = PathBuf::from(original);
    let mut candidates = vec![original_path.clone(), questions_dir.join(&original_path)];
    if let Some(name) = original_path.file_name() {
        candidates.push(questions_dir.join("images").join(name));
    }
    candidates.into_iter().find(|p| p.exists())
}

/// Runs the filter end to end.
///
/// Writes `<output_dir>/questions.json` and, when `copy_images` is set,
/// copies each selected image to `<output_dir>/images/image_<new_id>.<ext>`.
pub fn filter_correct(
    results_path: &Path,
    questions_path: &Path,
    output_dir: &Path,
    copy_images: bool,
) -> Result<FilterReport, FilterError> {
    let results = read_records(results_path)?;
    // Image paths stay as written in the source file; they are rewritten below.
    let questions = read_records(questions_path)?;

    let ids = correct_ids(&results);
    info!(correct = ids.len(), "Found correctly predicted puzzles");

    let selected = select_questions(&ids, &questions);
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| FilterError::Write { path, source }
    };

    std::fs::create_dir_all(output_dir).map_err(write_err(output_dir))?;
    let output_file = output_dir.join(FILTERED_QUESTIONS_FILE);
    let filtered: Vec<&Value> = selected.iter().map(|q| &q.question).collect();
    let body = serde_json::to_string_pretty(&filtered)?;
    std::fs::write(&output_file, body).map_err(write_err(&output_file))?;

    let mut report = FilterReport {
        source_questions: questions.len(),
        correct: ids.len(),
        written: selected.len(),
        output_file,
        ..Default::default()
    };

    if copy_images {
        let images_dir = output_dir.join("images");
        std::fs::create_dir_all(&images_dir).map_err(write_err(&images_dir))?;
        let questions_dir = questions_path.parent().unwrap_or_else(|| Path::new(""));

        for (original, new_name) in selected.iter().filter_map(|q| q.image.as_ref()) {
            match locate_image(original, questions_dir) {
                Some(source) => {
                    let dest = images_dir.join(new_name);
                    match std::fs::copy(&source, &dest) {
                        Ok(_) => report.images_copied += 1,
                        Err(e) => {
                            warn!(source = %source.display(), dest = %dest.display(), error = %e, "Failed to copy image");
                            report.images_missing += 1;
                        }
                    }
                }
                None => {
                    warn!(image = %original, "Image file not found after checking multiple locations");
                    report.images_missing += 1;
                }
            }
        }
    }

    info!(
        source = report.source_questions,
        correct = report.correct,
        written = report.written,
        images_copied = report.images_copied,
        output = %report.output_file.display(),
        "Filter complete"
    );
    Ok(report)
}
