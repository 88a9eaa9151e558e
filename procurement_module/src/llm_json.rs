//! Lenient decoding of model output into JSON objects and typed fields.

use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum LlmDecodeError {
    #[error("model returned no content")]
    Empty,
    #[error("model output is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("model output is not a json object")]
    NotAnObject,
}

/// Removes a surrounding markdown code fence, with or without a language tag.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches(|ch: char| ch.is_ascii_alphabetic()),
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Decodes model output into a JSON object.
///
/// Falls back to the outermost `{...}` span when the model wraps the object
/// in prose.
pub fn decode_object(raw: &str) -> Result<Map<String, Value>, LlmDecodeError> {
    let text = strip_code_fences(raw);
    if text.is_empty() {
        return Err(LlmDecodeError::Empty);
    }
    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(err) => match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str::<Value>(&text[start..=end])?
            }
            _ => return Err(LlmDecodeError::InvalidJson(err)),
        },
    };
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(LlmDecodeError::NotAnObject),
    }
}

/// A number, or a string holding one (currency symbols and separators allowed).
pub fn number(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => {
            let cleaned: String = text
                .trim()
                .chars()
                .filter(|ch| !matches!(*ch, '$' | ',' | '_') && !ch.is_whitespace())
                .collect();
            let cleaned = cleaned
                .trim_start_matches("USD")
                .trim_end_matches("USD")
                .trim_start_matches("usd")
                .trim_end_matches("usd");
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|number| number.is_finite())
}

pub fn integer(value: Option<&Value>) -> Option<i32> {
    number(value)
        .map(f64::round)
        .filter(|number| *number >= i32::MIN as f64 && *number <= i32::MAX as f64)
        .map(|number| number as i32)
}

/// A non-blank string, trimmed.
pub fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        _ => None,
    }
}

/// An attribute object; anything else becomes empty.
pub fn object(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}
