//! Strict parsing of completion output
//!
//! Generated text is untrusted. Every structured reply goes through
//! [`parse_structured`]: locate one JSON object (fenced block first, then the
//! first balanced object), deserialize it into a strict type that rejects
//! unknown fields, and let the caller validate ids against the catalog.

use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON object found in completion output")]
    NoStructuredBlock,

    #[error("malformed structured output: {0}")]
    Malformed(String),
}

lazy_static! {
    static ref FENCED_JSON: Regex = Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").unwrap();
}

/// Locate the JSON object embedded in `text`
pub fn extract_json_block(text: &str) -> Option<&str> {
    for cap in FENCED_JSON.captures_iter(text) {
        if let Some(body) = cap.get(1) {
            if let Some(obj) = first_balanced_object(body.as_str()) {
                return Some(obj);
            }
        }
    }
    first_balanced_object(text)
}

/// First `{...}` with balanced braces, honouring string literals
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract and deserialize a structured reply
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T, ParseError> {
    let block = extract_json_block(text).ok_or(ParseError::NoStructuredBlock)?;
    serde_json::from_str(block).map_err(|e| ParseError::Malformed(e.to_string()))
}
