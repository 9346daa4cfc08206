//! Question actions
//!
//! Source documents write actions as prose ("Add tag `x`", "Go to Module A").
//! They are parsed once into [`ActionRef`] and resolved against the catalog.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What answering a question affirmatively does
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Action {
    AssignTag(String),
    ActivateModule(String),
}

impl Action {
    pub fn tag(&self) -> Option<&str> {
        match self {
            Action::AssignTag(tag) => Some(tag),
            Action::ActivateModule(_) => None,
        }
    }

    pub fn module(&self) -> Option<&str> {
        match self {
            Action::ActivateModule(module) => Some(module),
            Action::AssignTag(_) => None,
        }
    }
}

/// Parsed but unresolved action reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionRef {
    Tag(String),
    /// A module id or a module alias such as "A"
    Module(String),
}

/// Action as it appears in the JSON catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawAction {
    Text(String),
    Structured(StructuredAction),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredAction {
    #[serde(default)]
    pub assign_tag: Option<String>,
    #[serde(default)]
    pub activate_module: Option<String>,
}

impl std::fmt::Display for RawAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawAction::Text(text) => write!(f, "{}", text),
            RawAction::Structured(s) => write!(
                f,
                "assign_tag={:?} activate_module={:?}",
                s.assign_tag, s.activate_module
            ),
        }
    }
}

lazy_static! {
    static ref BACKTICK_TAG: Regex = Regex::new(r"(?i)add\s+tag\s*`([^`]+)`").unwrap();
    static ref COLON_TAG: Regex = Regex::new(r"(?i)add\s+tag\s*:\s*`?([A-Za-z0-9_\-]+)`?").unwrap();
    static ref GO_TO_MODULE: Regex =
        Regex::new(r"(?i)go\s+to\s+module\s*:?\s*`?([A-Za-z0-9_\-]+)`?").unwrap();
}

impl RawAction {
    /// Parse into a reference, or `None` if the action is not recognised
    pub fn parse(&self) -> Option<ActionRef> {
        match self {
            RawAction::Text(text) => parse_action_text(text),
            RawAction::Structured(s) => match (&s.assign_tag, &s.activate_module) {
                (Some(tag), None) => Some(ActionRef::Tag(tag.trim().to_string())),
                (None, Some(module)) => Some(ActionRef::Module(module.trim().to_string())),
                _ => None,
            },
        }
    }
}

/// Parse a prose action string
pub fn parse_action_text(text: &str) -> Option<ActionRef> {
    if let Some(cap) = BACKTICK_TAG.captures(text) {
        return Some(ActionRef::Tag(cap[1].trim().to_string()));
    }
    if let Some(cap) = COLON_TAG.captures(text) {
        return Some(ActionRef::Tag(cap[1].trim().to_string()));
    }
    if let Some(cap) = GO_TO_MODULE.captures(text) {
        return Some(ActionRef::Module(cap[1].trim().to_string()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_forms() {
        assert_eq!(
            parse_action_text("Add tag `rsu_income`"),
            Some(ActionRef::Tag("rsu_income".to_string()))
        );
        assert_eq!(
            parse_action_text("add tag: us_llc_owner"),
            Some(ActionRef::Tag("us_llc_owner".to_string()))
        );
        assert_eq!(
            parse_action_text("If yes, ADD TAG `fbar_required` and continue"),
            Some(ActionRef::Tag("fbar_required".to_string()))
        );
    }

    #[test]
    fn test_parse_module_forms() {
        assert_eq!(
            parse_action_text("Go to Module A"),
            Some(ActionRef::Module("A".to_string()))
        );
        assert_eq!(
            parse_action_text("go to module residency_elections"),
            Some(ActionRef::Module("residency_elections".to_string()))
        );
    }

    #[test]
    fn test_unrecognised_action() {
        assert_eq!(parse_action_text("Ask a follow-up"), None);
        assert_eq!(parse_action_text(""), None);
    }

    #[test]
    fn test_structured_action() {
        let raw: RawAction = serde_json::from_str(r#"{"assign_tag": "tfsa_holder"}"#).unwrap();
        assert_eq!(raw.parse(), Some(ActionRef::Tag("tfsa_holder".to_string())));

        let both: RawAction =
            serde_json::from_str(r#"{"assign_tag": "a", "activate_module": "b"}"#).unwrap();
        assert_eq!(both.parse(), None);
    }
}
