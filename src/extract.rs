use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid AI response format")]
    InvalidFormat,
    #[error("invalid AI response format: {0}")]
    Schema(#[source] serde_json::Error),
}

fn fenced_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("fenced block pattern is valid")
    })
}

fn array_span() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").expect("array pattern is valid"))
}

fn object_span() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("object pattern is valid"))
}

/// Removes a surrounding markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(captures) = fenced_block().captures(trimmed) {
        if let Some(inner) = captures.get(1) {
            return inner.as_str();
        }
    }
    trimmed
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Finds the first JSON value in a model response.
///
/// The fenced or bare text is parsed strictly first; if that fails, the
/// widest `[...]` span and then the widest `{...}` span are tried.
pub fn extract_json(text: &str) -> Result<Value, ExtractError> {
    let body = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if value.is_array() || value.is_object() {
            return Ok(value);
        }
    }

    for pattern in [array_span(), object_span()] {
        if let Some(span) = pattern.find(text) {
            if let Ok(value) = serde_json::from_str::<Value>(span.as_str()) {
                return Ok(value);
            }
        }
    }

    tracing::warn!(preview = %preview(text), "no JSON payload in AI response");
    Err(ExtractError::InvalidFormat)
}

/// Extracts a list of `T`. A lone object is treated as a one-element list.
pub fn extract_list<T: DeserializeOwned>(text: &str) -> Result<Vec<T>, ExtractError> {
    let value = extract_json(text)?;
    let items = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => return Err(ExtractError::InvalidFormat),
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(ExtractError::Schema))
        .collect()
}

/// Extracts a single `T` from the first JSON object in the response.
pub fn extract_object<T: DeserializeOwned>(text: &str) -> Result<T, ExtractError> {
    let value = match extract_json(text)? {
        Value::Array(mut items) if items.len() == 1 && items[0].is_object() => items.remove(0),
        value @ Value::Object(_) => value,
        Value::Array(_) => {
            let span = object_span().find(text).ok_or(ExtractError::InvalidFormat)?;
            serde_json::from_str(span.as_str()).map_err(|_| ExtractError::InvalidFormat)?
        }
        _ => return Err(ExtractError::InvalidFormat),
    };
    serde_json::from_value(value).map_err(ExtractError::Schema)
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 120;
    let mut out: String = text.chars().take(LIMIT).collect();
    if text.chars().count() > LIMIT {
        out.push_str("...");
    }
    out
}
