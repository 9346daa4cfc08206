//! Personal identifier guard
//!
//! Replies carrying government identifiers or card numbers never enter the
//! transcript or a completion prompt. The engine stores the redacted text
//! and answers with [`SENSITIVE_INFO_WARNING`] instead of advancing.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const SENSITIVE_INFO_WARNING: &str = "Please don't share sensitive personal identifiers like \
SSN, SIN, passport numbers, or full account numbers. I can help with general tax situations \
without this information.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitiveKind {
    Ssn,
    Sin,
    CardNumber,
    NationalId,
    Passport,
}

impl SensitiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitiveKind::Ssn => "ssn",
            SensitiveKind::Sin => "sin",
            SensitiveKind::CardNumber => "card_number",
            SensitiveKind::NationalId => "national_id",
            SensitiveKind::Passport => "passport",
        }
    }

    fn placeholder(&self) -> &'static str {
        match self {
            SensitiveKind::Ssn => "[SSN-REDACTED]",
            SensitiveKind::Sin => "[SIN-REDACTED]",
            SensitiveKind::CardNumber => "[CARD-REDACTED]",
            SensitiveKind::NationalId => "[ID-REDACTED]",
            SensitiveKind::Passport => "[PASSPORT-REDACTED]",
        }
    }
}

impl std::fmt::Display for SensitiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

lazy_static! {
    // Longer shapes first so a card number is not read as two IDs
    static ref PATTERNS: Vec<(SensitiveKind, Regex)> = vec![
        (SensitiveKind::CardNumber, Regex::new(r"\b\d{4}[\s-]\d{4}[\s-]\d{4}[\s-]\d{4}\b").unwrap()),
        (SensitiveKind::CardNumber, Regex::new(r"\b\d{16}\b").unwrap()),
        (SensitiveKind::Ssn, Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap()),
        (SensitiveKind::Sin, Regex::new(r"\b\d{3}[\s-]\d{3}[\s-]\d{3}\b").unwrap()),
        (SensitiveKind::NationalId, Regex::new(r"\b\d{9}\b").unwrap()),
        // Case-sensitive: passport numbers are printed in capitals
        (SensitiveKind::Passport, Regex::new(r"\b[A-Z]\d{8}[A-Z]?\b").unwrap()),
    ];
}

/// Kinds of identifier found in `text`, sorted and deduplicated
pub fn detect_sensitive(text: &str) -> Vec<SensitiveKind> {
    let mut kinds: Vec<SensitiveKind> = PATTERNS
        .iter()
        .filter(|(_, regex)| regex.is_match(text))
        .map(|(kind, _)| *kind)
        .collect();
    kinds.sort();
    kinds.dedup();
    kinds
}

pub fn contains_sensitive_info(text: &str) -> bool {
    PATTERNS.iter().any(|(_, regex)| regex.is_match(text))
}

/// Replace every identifier with a placeholder naming its kind
pub fn redact(text: &str) -> String {
    let mut redacted = text.to_string();
    for (kind, regex) in PATTERNS.iter() {
        redacted = regex
            .replace_all(&redacted, kind.placeholder())
            .into_owned();
    }
    redacted
}
