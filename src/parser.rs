//! Decoding of structured actions out of free-form model text.
//!
//! Model output is treated as an untrusted wire format: decoding yields
//! either the requested shape or a [`ParseFailure`] that the orchestration
//! loop feeds back to the model as corrective guidance.

use std::fmt;

use serde::{de::DeserializeOwned, Serialize};

const EXCERPT_RADIUS: usize = 40;

/// A classified decode failure with a human-readable diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseFailure {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl ParseFailure {
    fn from_json_error(error: &serde_json::Error, source: &str) -> Self {
        let line = error.line();
        let column = error.column();
        if line == 0 {
            return Self {
                message: error.to_string(),
                line: None,
                column: None,
                excerpt: None,
            };
        }

        let offset = byte_offset(source, line, column);
        Self {
            message: error.to_string(),
            line: Some(line),
            column: Some(column),
            excerpt: Some(excerpt_around(source, offset)),
        }
    }

    /// Guidance text handed back to the model after a failed decode.
    pub fn diagnostic(&self) -> String {
        let mut out = format!("Could not parse your response as JSON: {}", self.message);
        if let (Some(line), Some(column)) = (self.line, self.column) {
            out.push_str(&format!(" (line {line}, column {column})"));
        }
        if let Some(excerpt) = &self.excerpt {
            out.push_str(&format!("\nNear: `{excerpt}`"));
        }
        out
    }
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.diagnostic())
    }
}

/// Decode one action object from model text.
///
/// Tries the whole trimmed text when it is delimited like an object, then
/// the first fenced block. The failure reported is the first candidate's;
/// with no candidate at all the whole text is decoded anyway so the failure
/// carries the decoder's position.
pub fn parse_action<T: DeserializeOwned>(text: &str) -> Result<T, ParseFailure> {
    let trimmed = text.trim();
    let fenced = extract_fenced_block(text);

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        let error = match serde_json::from_str::<T>(trimmed) {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        return match fenced.map(serde_json::from_str::<T>) {
            Some(Ok(value)) => Ok(value),
            _ => Err(ParseFailure::from_json_error(&error, trimmed)),
        };
    }

    let candidate = fenced.unwrap_or(trimmed);
    serde_json::from_str::<T>(candidate).map_err(|error| ParseFailure::from_json_error(&error, candidate))
}

/// Contents of the first ``` fenced block, without its language tag.
pub fn extract_fenced_block(content: &str) -> Option<&str> {
    let start = content.find("```")?;
    let after_fence = &content[start + 3..];

    let body = match after_fence.find('\n') {
        Some(newline) => {
            let tag = after_fence[..newline].trim();
            if tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                &after_fence[newline + 1..]
            } else {
                after_fence
            }
        }
        None => after_fence,
    };

    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn byte_offset(source: &str, line: usize, column: usize) -> usize {
    let mut offset = 0;
    for (index, text) in source.split_inclusive('\n').enumerate() {
        if index + 1 == line {
            let within = column.saturating_sub(1).min(text.len());
            return clamp_to_char_boundary(source, offset + within);
        }
        offset += text.len();
    }
    source.len()
}

fn clamp_to_char_boundary(source: &str, mut index: usize) -> usize {
    index = index.min(source.len());
    while !source.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn excerpt_around(source: &str, offset: usize) -> String {
    let start = clamp_to_char_boundary(source, offset.saturating_sub(EXCERPT_RADIUS));
    let end = clamp_to_char_boundary(source, offset + EXCERPT_RADIUS);
    source[start..end].replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::Value;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct ToolOnly {
        tool: String,
    }

    #[test]
    fn decodes_bare_object() {
        let action: ToolOnly = parse_action(r#"  {"tool":"list_columns"}  "#).expect("action");
        assert_eq!(action.tool, "list_columns");
    }

    #[test]
    fn extracts_fenced_block_from_prose() {
        let text = "Sure, here is my next step.\n```json\n{\"tool\": \"run_query\", \"x\": [1, 2]}\n```\nLet me know!";
        assert_eq!(
            extract_fenced_block(text),
            Some("{\"tool\": \"run_query\", \"x\": [1, 2]}")
        );
        let value: Value = parse_action(text).expect("value");
        assert_eq!(value["tool"], "run_query");
        assert_eq!(value["x"][1], 2);
    }

    #[test]
    fn fence_without_language_tag() {
        let text = "prefix ```{\"tool\":\"a\"}``` suffix";
        let action: ToolOnly = parse_action(text).expect("action");
        assert_eq!(action.tool, "a");
    }

    #[test]
    fn brace_wrapped_prose_falls_back_to_the_fence() {
        let text = "{Calling list_columns next.}\n```json\n{\"tool\":\"list_columns\"}\n```\n{end}";
        let action: ToolOnly = parse_action(text).expect("fenced action");
        assert_eq!(action.tool, "list_columns");
    }

    #[test]
    fn brace_wrapped_prose_without_fence_reports_its_own_error() {
        let failure = parse_action::<Value>("{not json at all}").expect_err("not json");
        assert_eq!(failure.line, Some(1));
        assert_eq!(failure.column, Some(2));
    }

    #[test]
    fn prose_reports_line_and_column() {
        let failure = parse_action::<Value>("I think we should look at the latency first.")
            .expect_err("prose is not json");
        assert_eq!(failure.line, Some(1));
        assert!(failure.column.is_some());
        let diagnostic = failure.diagnostic();
        assert!(diagnostic.contains("line 1, column"), "{diagnostic}");
    }

    #[test]
    fn broken_object_points_at_the_error() {
        let text = "{\n  \"tool\": \"run_query\",\n  \"parameters\": {,}\n}";
        let failure = parse_action::<Value>(text).expect_err("invalid json");
        assert_eq!(failure.line, Some(3));
        let excerpt = failure.excerpt.expect("excerpt");
        assert!(excerpt.contains("parameters"), "{excerpt}");
    }

    #[test]
    fn wrong_shape_is_a_parse_failure() {
        let failure = parse_action::<ToolOnly>(r#"{"reasoning":"no tool here"}"#).expect_err("missing field");
        assert!(failure.message.contains("tool"), "{}", failure.message);
    }

    #[test]
    fn excerpt_respects_multibyte_text() {
        let text = "ünïcödé ✓ ".repeat(20);
        let failure = parse_action::<Value>(&text).expect_err("not json");
        assert!(failure.excerpt.is_some());
    }
}
