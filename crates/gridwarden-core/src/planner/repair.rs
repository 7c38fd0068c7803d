//! Bounded JSON repair for planner output
//!
//! Repairs are applied in a fixed order and parsing is retried after each
//! one; the first successful parse wins. Nothing outside this set is tried.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)(?:```|$)").unwrap();
    static ref TRAILING_COMMA: Regex = Regex::new(r",(\s*[}\]])").unwrap();
}

/// One repair applied to planner text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "repair")]
pub enum Repair {
    /// Removed a Markdown code fence
    StrippedCodeFence,
    /// Cut leading/trailing prose around the outer object
    ExtractedObject,
    /// Replaced typographic quotes with ASCII quotes
    NormalizedQuotes,
    /// Removed commas before a closing bracket
    RemovedTrailingCommas,
    /// Closed an unterminated string and open brackets
    ClosedTruncated {
        /// Number of characters appended
        appended: usize,
    },
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repair::StrippedCodeFence => write!(f, "stripped code fence"),
            Repair::ExtractedObject => write!(f, "extracted outer object"),
            Repair::NormalizedQuotes => write!(f, "normalized smart quotes"),
            Repair::RemovedTrailingCommas => write!(f, "removed trailing commas"),
            Repair::ClosedTruncated { appended } => {
                write!(f, "closed truncated structure ({} chars appended)", appended)
            }
        }
    }
}

/// Parse JSON, repairing common model mistakes.
///
/// Returns the value and the repairs that were needed, or the last parse
/// error when nothing helped.
pub fn lenient_json(text: &str) -> Result<(Value, Vec<Repair>), String> {
    let mut current = text.trim().to_string();
    let mut repairs = Vec::new();

    if let Ok(value) = serde_json::from_str(&current) {
        return Ok((value, repairs));
    }

    let steps: [fn(&str) -> Option<(String, Repair)>; 5] = [
        strip_code_fence,
        extract_object,
        normalize_quotes,
        remove_trailing_commas,
        close_truncated,
    ];

    let mut last_error = String::from("empty input");
    for step in steps {
        if let Some((next, repair)) = step(&current) {
            tracing::debug!(repair = %repair, "applied planner JSON repair");
            current = next;
            repairs.push(repair);
        }
        match serde_json::from_str(&current) {
            Ok(value) => return Ok((value, repairs)),
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(last_error)
}

fn strip_code_fence(text: &str) -> Option<(String, Repair)> {
    let inner = CODE_FENCE.captures(text)?.get(1)?.as_str().trim();
    if inner.is_empty() {
        return None;
    }
    Some((inner.to_string(), Repair::StrippedCodeFence))
}

fn extract_object(text: &str) -> Option<(String, Repair)> {
    let start = text.find('{')?;
    let slice = match matching_close(&text[start..]) {
        Some(end) => &text[start..=start + end],
        None => &text[start..],
    };
    if slice.len() == text.len() {
        return None;
    }
    Some((slice.to_string(), Repair::ExtractedObject))
}

fn normalize_quotes(text: &str) -> Option<(String, Repair)> {
    let double = |c: char| matches!(c, '\u{201C}' | '\u{201D}' | '\u{201E}');
    let single = |c: char| matches!(c, '\u{2018}' | '\u{2019}');
    if !text.contains(|c| double(c) || single(c)) {
        return None;
    }
    let fixed = text.replace(double, "\"").replace(single, "'");
    Some((fixed, Repair::NormalizedQuotes))
}

fn remove_trailing_commas(text: &str) -> Option<(String, Repair)> {
    if !TRAILING_COMMA.is_match(text) {
        return None;
    }
    Some((
        TRAILING_COMMA.replace_all(text, "$1").into_owned(),
        Repair::RemovedTrailingCommas,
    ))
}

fn close_truncated(text: &str) -> Option<(String, Repair)> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }
    if stack.is_empty() && !in_string {
        return None;
    }

    let mut fixed = text.to_string();
    if in_string {
        fixed.push('"');
    }
    let trimmed_len = fixed.trim_end().trim_end_matches(',').trim_end().len();
    fixed.truncate(trimmed_len);
    if fixed.ends_with(':') {
        fixed.push_str("null");
    }
    while let Some(close) = stack.pop() {
        fixed.push(close);
    }
    let appended = fixed.len().saturating_sub(text.len());
    Some((fixed, Repair::ClosedTruncated { appended }))
}

/// Byte offset of the bracket closing the one at position 0
fn matching_close(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_json_needs_no_repair() {
        let (value, repairs) = lenient_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value, json!({"a": 1}));
        assert!(repairs.is_empty());
    }

    #[test]
    fn fenced_output_with_prose() {
        let text = "Here is the plan:\n```json\n{\"intent\": \"x\", \"steps\": []}\n```\nDone.";
        let (value, repairs) = lenient_json(text).unwrap();
        assert_eq!(value["intent"], "x");
        assert_eq!(repairs, vec![Repair::StrippedCodeFence]);
    }

    #[test]
    fn smart_quotes_and_trailing_commas() {
        let text = "{\u{201C}steps\u{201D}: [1, 2,],}";
        let (value, repairs) = lenient_json(text).unwrap();
        assert_eq!(value["steps"], json!([1, 2]));
        assert!(repairs.contains(&Repair::NormalizedQuotes));
        assert!(repairs.contains(&Repair::RemovedTrailingCommas));
    }

    #[test]
    fn truncated_output_is_closed() {
        let text = r#"{"intent": "sum", "steps": [{"action": "read_range", "parameters": {"sheet": "Da"#;
        let (value, repairs) = lenient_json(text).unwrap();
        assert_eq!(value["steps"][0]["parameters"]["sheet"], "Da");
        assert!(matches!(repairs.last(), Some(Repair::ClosedTruncated { .. })));
    }

    #[test]
    fn hopeless_text_is_an_error() {
        assert!(lenient_json("I cannot help with that").is_err());
    }
}
