//! Paired-tag extraction from free-text model responses.
//!
//! Prompts ask the model to wrap each answer field in `<name>...</name>`.
//! Extraction is lenient: the first complete pair wins, content may span
//! lines, and surrounding whitespace is trimmed.
//!
//! ```
//! use puzzle_forge::utils::tags::extract_tag;
//!
//! let response = "Thinking...\n<answer>\n B \n</answer>";
//! assert_eq!(extract_tag(response, "answer").as_deref(), Some("B"));
//! assert_eq!(extract_tag(response, "reasoning"), None);
//! ```

use regex::Regex;

fn tag_regex(tag: &str) -> Option<Regex> {
    let escaped = regex::escape(tag);
    Regex::new(&format!(r"(?s)<{escaped}>(.*?)</{escaped}>")).ok()
}

/// Returns the trimmed content of the first `<tag>...</tag>` pair.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let re = tag_regex(tag)?;
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Returns the tag content, or the whole trimmed response when the tag is absent.
///
/// The second element reports whether the fallback was used.
pub fn extract_tag_or_raw(text: &str, tag: &str) -> (String, bool) {
    match extract_tag(text, tag) {
        Some(content) => (content, false),
        None => (text.trim().to_string(), true),
    }
}

/// Extracts a bullet list from a tag.
///
/// Each non-empty line becomes one entry with a leading `- ` or `* ` removed.
/// Lines consisting of a bare bullet are skipped.
pub fn extract_list(text: &str, tag: &str) -> Option<Vec<String>> {
    let content = extract_tag(text, tag)?;
    let items = content
        .lines()
        .map(str::trim)
        .map(|line| {
            line.strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .unwrap_or(line)
                .trim()
        })
        .filter(|line| !line.is_empty() && *line != "-" && *line != "*")
        .map(str::to_string)
        .collect();
    Some(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_multiline_tag() {
        let text = "<reasoning>\nline one\nline two\n</reasoning><answer>C</answer>";
        assert_eq!(
            extract_tag(text, "reasoning").as_deref(),
            Some("line one\nline two")
        );
        assert_eq!(extract_tag(text, "answer").as_deref(), Some("C"));
    }

    #[test]
    fn test_first_pair_wins() {
        let text = "<answer>A</answer> later <answer>B</answer>";
        assert_eq!(extract_tag(text, "answer").as_deref(), Some("A"));
    }

    #[test]
    fn test_unclosed_tag_is_absent() {
        assert_eq!(extract_tag("<answer>A", "answer"), None);
    }

    #[test]
    fn test_raw_fallback() {
        let (text, fallback) = extract_tag_or_raw("  just text  ", "translated_explanation");
        assert_eq!(text, "just text");
        assert!(fallback);

        let (text, fallback) =
            extract_tag_or_raw("<translated_explanation>ok</translated_explanation>", "translated_explanation");
        assert_eq!(text, "ok");
        assert!(!fallback);
    }

    #[test]
    fn test_extract_list() {
        let text = "<key_points>\n- first\n-\n* second\n\nthird\n</key_points>";
        assert_eq!(
            extract_list(text, "key_points"),
            Some(vec![
                "first".to_string(),
                "second".to_string(),
                "third".to_string()
            ])
        );
        assert_eq!(extract_list(text, "missing"), None);
    }

    #[test]
    fn test_tag_name_is_escaped() {
        let text = "<a.b>x</a.b><aXb>y</aXb>";
        assert_eq!(extract_tag(text, "a.b").as_deref(), Some("x"));
    }
}
