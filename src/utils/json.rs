//! JSON helpers for judge replies and versioned artifacts.
//!
//! Judges are asked for a bare JSON object but frequently wrap it in a
//! markdown fence or surround it with prose. [`extract_json_object`] tries,
//! in order:
//! 1. the whole reply
//! 2. the contents of a ```` ```json ```` (or generic) code fence
//! 3. the first balanced `{ ... }` span that parses

use regex::Regex;
use serde_json::{Map, Value};

/// Extracts the first JSON object from free-form text.
pub fn extract_json_object(content: &str) -> Option<Map<String, Value>> {
    let trimmed = content.trim();

    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
        return Some(map);
    }

    if let Some(block) = extract_code_block(trimmed) {
        if let Some(map) = first_balanced_object(&block) {
            return Some(map);
        }
    }

    first_balanced_object(trimmed)
}

/// Returns the contents of the first ```` ```json ```` or generic code fence.
fn extract_code_block(content: &str) -> Option<String> {
    let re = Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").ok()?;
    let caps = re.captures(content)?;
    Some(caps.get(1)?.as_str().trim().to_string())
}

/// Finds the first `{ ... }` span in `content` that parses as an object.
fn first_balanced_object(content: &str) -> Option<Map<String, Value>> {
    let mut offset = 0;
    while let Some(rel) = content[offset..].find('{') {
        let start = offset + rel;
        if let Some(end) = find_matching_brace(&content[start..]) {
            if let Ok(Value::Object(map)) = serde_json::from_str(&content[start..=start + end]) {
                return Some(map);
            }
        }
        offset = start + 1;
    }
    None
}

/// Returns the index of the brace closing the object that starts `s`.
///
/// String literals and escape sequences are skipped.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Reads the `schema_version` of an artifact; `0` when absent.
pub fn schema_version(value: &Value) -> u64 {
    value
        .get("schema_version")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}
