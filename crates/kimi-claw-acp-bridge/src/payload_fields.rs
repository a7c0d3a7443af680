//! Lenient accessors for loosely-typed gateway and ACP payloads.

use chrono::{DateTime, NaiveDateTime};
use serde_json::{Map, Value};

use crate::message_filter::strip_transport_metadata;

pub type JsonObject = Map<String, Value>;

pub fn as_object(value: Option<&Value>) -> Option<&JsonObject> {
    value.and_then(Value::as_object)
}

/// Trimmed string value, `None` when missing, non-string or blank.
pub fn trimmed_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

pub fn field_str<'a>(object: &'a JsonObject, key: &str) -> Option<&'a str> {
    trimmed_str(object.get(key))
}

/// First present, non-blank string among `keys`, in order.
pub fn first_field_str<'a>(object: &'a JsonObject, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| field_str(object, key))
}

/// Untrimmed streaming text; whitespace-only deltas are significant.
pub fn text_chunk(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|text| !text.is_empty())
}

/// Text with transport metadata removed, `None` when nothing is left.
pub fn normalize_text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).and_then(normalize_str)
}

pub fn normalize_str(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let cleaned = strip_transport_metadata(text);
    (!cleaned.is_empty()).then(|| cleaned.into_owned())
}

/// Epoch milliseconds from a number or a parseable date string.
pub fn timestamp_value(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|ms| ms.is_finite()).map(|ms| ms as i64)),
        Value::String(raw) => parse_timestamp_str(raw.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(raw: &str) -> Option<i64> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Searches `ts`, `timestamp`, then nested `payload`, `data` and `message` objects.
pub fn payload_timestamp(payload: &JsonObject) -> Option<i64> {
    timestamp_value(payload.get("ts"))
        .or_else(|| timestamp_value(payload.get("timestamp")))
        .or_else(|| {
            ["payload", "data", "message"]
                .iter()
                .filter_map(|key| as_object(payload.get(*key)))
                .find_map(payload_timestamp)
        })
}

/// Two-space indented JSON, matching what clients render for tool arguments.
pub fn pretty_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
