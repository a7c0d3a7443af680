//! Strips transport metadata the gateway prepends to user text.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

const HEARTBEAT_OK_LINE: &str = "HEARTBEAT_OK";

static METADATA_PREFIX_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(
            r"(?i)^\s*\[(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun)\s+\d{4}-\d{2}-\d{2}\s+\d{1,2}:\d{2}(?::\d{2})?\s+GMT[+-]\d{1,2}(?::?\d{2})?\]\s*",
        )
        .expect("timestamp prefix regex"),
        Regex::new(r"(?i)^\s*\[working directory:[^\]]*\]\s*").expect("cwd prefix regex"),
        Regex::new(r"(?i)^\s*\[message_id:[^\]]*\]\s*").expect("message id prefix regex"),
    ]
});

static UNTRUSTED_METADATA_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^Conversation info \(untrusted metadata\):(?s:.*?)Current time:\s*.*$")
        .expect("untrusted metadata regex")
});

fn strip_line_prefixes(line: &str) -> (Cow<'_, str>, bool) {
    let mut current = Cow::Borrowed(line);
    let mut changed = false;
    loop {
        let mut matched = false;
        for pattern in METADATA_PREFIX_PATTERNS.iter() {
            if let Some(found) = pattern.find(&current) {
                current = Cow::Owned(current[found.end()..].to_string());
                changed = true;
                matched = true;
            }
        }
        if !matched {
            return (current, changed);
        }
    }
}

/// Removes timestamp, working-directory and message-id prefixes, heartbeat lines,
/// and a whole untrusted-metadata block; other text is returned unchanged.
pub fn strip_transport_metadata(text: &str) -> Cow<'_, str> {
    let is_metadata_block = UNTRUSTED_METADATA_BLOCK.is_match(text.trim());
    if !text.contains('[') && !text.contains(HEARTBEAT_OK_LINE) && !is_metadata_block {
        return Cow::Borrowed(text);
    }
    if is_metadata_block {
        return Cow::Owned(String::new());
    }

    let mut cleaned = Vec::new();
    let mut changed = false;
    for raw_line in text.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let (stripped, line_changed) = strip_line_prefixes(line);
        if stripped.trim() == HEARTBEAT_OK_LINE {
            changed = true;
            continue;
        }
        if line_changed {
            changed = true;
            if stripped.trim().is_empty() {
                continue;
            }
        }
        cleaned.push(stripped);
    }
    if !changed {
        return Cow::Borrowed(text);
    }
    let joined = cleaned.join("\n");
    Cow::Owned(joined.trim_matches('\n').to_string())
}

/// Cleans `text` blocks anywhere inside a prompt payload, recursing through `content` arrays.
pub fn sanitize_prompt_payload(payload: &Value) -> Value {
    let mut sanitized = payload.clone();
    sanitize_node(&mut sanitized);
    sanitized
}

fn sanitize_node(node: &mut Value) {
    match node {
        Value::String(text) => {
            if let Cow::Owned(cleaned) = strip_transport_metadata(text) {
                *text = cleaned;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize_node),
        Value::Object(object) => {
            let is_text_block = object.get("type").and_then(Value::as_str) == Some("text");
            if is_text_block {
                if let Some(Value::String(text)) = object.get_mut("text") {
                    if let Cow::Owned(cleaned) = strip_transport_metadata(text) {
                        *text = cleaned;
                    }
                }
            }
            if let Some(content) = object.get_mut("content").filter(|content| content.is_array()) {
                sanitize_node(content);
            }
        }
        _ => {}
    }
}
