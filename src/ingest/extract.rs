//! Record extraction from heterogeneous scraper output
//!
//! The scraper's output reaches the coordinator in one of three shapes:
//!
//! ```text
//! [ {..}, {..} ]                      array of records      -> as is
//! { "videos": [..] } | { .. }         wrapper / one record  -> unwrapped
//! "log line\n[ {..} ]\nlog line"      text with embedded JSON
//! ```
//!
//! Text goes through a fallback chain. Every step is total: it either yields
//! a batch or hands over to the next step.
//!
//! 1. explicit `__SCRAPER_JSON_START__` / `__SCRAPER_JSON_END__` delimiters
//! 2. balanced region ending at the last closer, scanned backwards
//! 3. balanced region starting at the first opener, scanned forwards

use serde_json::Value;
use thiserror::Error;

/// Marker printed by the scraper before its JSON payload
pub const JSON_START_MARKER: &str = "__SCRAPER_JSON_START__";

/// Marker printed by the scraper after its JSON payload
pub const JSON_END_MARKER: &str = "__SCRAPER_JSON_END__";

/// Object keys that wrap the record array
pub const WRAPPER_KEYS: [&str; 5] = ["videos", "records", "results", "items", "data"];

/// Closers tried by the backward scan before giving up
const MAX_TAIL_CANDIDATES: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("scraper output is empty")]
    Empty,

    #[error("no JSON array or object found in scraper output")]
    NoJsonFound,

    #[error("unsupported payload shape: {0}")]
    UnsupportedShape(&'static str),
}

/// The shapes a raw payload can take
#[derive(Debug)]
pub enum RawPayload<'a> {
    Records(&'a [Value]),
    Object(&'a serde_json::Map<String, Value>),
    Text(&'a str),
}

impl<'a> RawPayload<'a> {
    pub fn classify(raw: &'a Value) -> Result<Self, ExtractionError> {
        match raw {
            Value::Array(items) => Ok(Self::Records(items)),
            Value::Object(map) => Ok(Self::Object(map)),
            Value::String(text) => Ok(Self::Text(text)),
            Value::Null => Err(ExtractionError::Empty),
            Value::Bool(_) => Err(ExtractionError::UnsupportedShape("boolean")),
            Value::Number(_) => Err(ExtractionError::UnsupportedShape("number")),
        }
    }
}

/// Turn raw scraper output into a list of record-like values
pub fn extract_records(raw: &Value) -> Result<Vec<Value>, ExtractionError> {
    match RawPayload::classify(raw)? {
        RawPayload::Records(items) => Ok(items.to_vec()),
        RawPayload::Object(map) => Ok(unwrap_object(map)),
        RawPayload::Text(text) => extract_from_text(text),
    }
}

fn unwrap_object(map: &serde_json::Map<String, Value>) -> Vec<Value> {
    for key in WRAPPER_KEYS {
        if let Some(Value::Array(items)) = map.get(key) {
            return items.clone();
        }
    }
    vec![Value::Object(map.clone())]
}

/// Structured value to records; scalars are not a batch
fn structured_records(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => Some(unwrap_object(&map)),
        _ => None,
    }
}

/// Run the text fallback chain
pub fn extract_from_text(text: &str) -> Result<Vec<Value>, ExtractionError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ExtractionError::Empty);
    }

    let strategies: [fn(&str) -> Option<Value>; 3] =
        [between_markers, balanced_from_tail, balanced_from_head];

    strategies
        .iter()
        .filter_map(|strategy| strategy(text))
        .find_map(structured_records)
        .ok_or(ExtractionError::NoJsonFound)
}

fn between_markers(text: &str) -> Option<Value> {
    let start = text.find(JSON_START_MARKER)? + JSON_START_MARKER.len();
    let len = text[start..].find(JSON_END_MARKER)?;
    serde_json::from_str(text[start..start + len].trim()).ok()
}

fn balanced_from_tail(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let closers = bytes
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, b)| matches!(b, b']' | b'}'))
        .map(|(i, _)| i)
        .take(MAX_TAIL_CANDIDATES);

    for end in closers {
        if let Some(start) = matching_opener(bytes, end) {
            if let Ok(value) = serde_json::from_str(&text[start..=end]) {
                return Some(value);
            }
        }
    }
    None
}

fn balanced_from_head(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|b| matches!(b, b'[' | b'{'))?;
    let end = matching_closer(bytes, start)?;
    serde_json::from_str(&text[start..=end]).ok()
}

fn pair_of(closer: u8) -> u8 {
    if closer == b']' {
        b'['
    } else {
        b'{'
    }
}

/// A quote at `i` is escaped when preceded by an odd run of backslashes
fn is_escaped(bytes: &[u8], i: usize) -> bool {
    bytes[..i].iter().rev().take_while(|b| **b == b'\\').count() % 2 == 1
}

/// Walk backwards from the closer at `end` to its matching opener
fn matching_opener(bytes: &[u8], end: usize) -> Option<usize> {
    let mut stack = vec![bytes[end]];
    let mut in_string = false;
    let mut i = end;

    while i > 0 {
        i -= 1;
        let b = bytes[i];
        if b == b'"' && !is_escaped(bytes, i) {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match b {
            b']' | b'}' => stack.push(b),
            b'[' | b'{' => {
                let closer = stack.pop()?;
                if pair_of(closer) != b {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Walk forwards from the opener at `start` to its matching closer
fn matching_closer(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => stack.push(b),
            b']' | b'}' => {
                if stack.pop()? != pair_of(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
