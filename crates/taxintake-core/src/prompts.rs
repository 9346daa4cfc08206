//! Prompt builders for delegated decisions
//!
//! Each builder returns a `(system, user)` pair. Replies are parsed by
//! [`crate::parser::parse_structured`], so every prompt asks for exactly one
//! JSON object with a fixed set of fields.

use std::fmt::Write as _;

use crate::kb::{KnowledgeBase, Question, TagDefinition};
use crate::state::ConversationState;

const ROLE: &str = "You are a careful cross-border tax intake assistant. You classify facts \
about a client's U.S./Canada tax situation. You never give tax advice and you never invent \
facts the client did not state.";

const JSON_ONLY: &str = "Respond with a single JSON object and nothing else. Do not add fields \
beyond the ones requested.";

pub type Prompt = (String, String);

fn system(task: &str) -> String {
    format!("{}\n\n{}\n\n{}", ROLE, task, JSON_ONLY)
}

fn tag_line(tag: &TagDefinition) -> String {
    format!("- {}: {} ({})", tag.id, tag.display_name(), tag.description)
}

/// Does the answer to `question` affirm any of its reachable tags?
pub fn targeted_tag(
    question: &Question,
    candidates: &[&TagDefinition],
    answer: &str,
    history: &str,
) -> Prompt {
    let sys = system(
        "Decide which of the candidate tags the client's answer confirms. Only confirm a tag \
         when the answer clearly affirms it. If the answer is unclear, confirm nothing and set \
         needs_clarification to true with a short follow-up question.",
    );

    let mut user = String::new();
    let _ = writeln!(user, "Question asked: {}", question.prompt);
    let _ = writeln!(user, "Client answer: {}", answer);
    let _ = writeln!(user, "\nCandidate tags:");
    for tag in candidates {
        let _ = writeln!(user, "{}", tag_line(tag));
    }
    let _ = writeln!(user, "\nRecent conversation:\n{}", history);
    let _ = write!(
        user,
        "\nJSON format: {{\"tags\": [{{\"tag\": \"<candidate id>\", \"confidence\": \"high|medium|low\", \
         \"reasoning\": \"...\"}}], \"needs_clarification\": false, \"clarification_prompt\": null}}"
    );
    (sys, user)
}

/// Scan free text against the whole catalog
pub fn broad_scan(kb: &KnowledgeBase, state: &ConversationState, utterance: &str, history: &str) -> Prompt {
    let sys = system(
        "Identify every tax-relevant fact in the client's message that matches a tag in the \
         catalog. Mark a fact explicit only when the client states it directly; mark it implicit \
         when it is merely suggested. Skip tags already assigned.",
    );

    let mut user = String::new();
    let _ = writeln!(user, "Client message: {}", utterance);
    let _ = writeln!(user, "\nAlready assigned: {}", join_or_none(state.assigned_tags().iter()));
    let _ = writeln!(user, "\nTag catalog:");
    for tag in kb.tags() {
        let _ = writeln!(user, "{}", tag_line(tag));
    }
    let _ = writeln!(user, "\nRecent conversation:\n{}", history);
    let _ = write!(
        user,
        "\nJSON format: {{\"facts\": [{{\"tag\": \"<catalog id>\", \"confidence\": \"high|medium|low\", \
         \"explicit\": true, \"evidence\": \"<quote from the message>\"}}]}}"
    );
    (sys, user)
}

/// Reconcile a corrective restatement with the current tags
pub fn correction(
    kb: &KnowledgeBase,
    state: &ConversationState,
    utterance: &str,
    history: &str,
) -> Prompt {
    let sys = system(
        "The client is correcting something they said earlier. Work out which currently \
         assigned tags are now wrong and which catalog tags the correction establishes. \
         Leave everything else untouched.",
    );

    let mut user = String::new();
    let _ = writeln!(user, "Correction: {}", utterance);
    let _ = writeln!(user, "\nCurrently assigned tags:");
    if state.assigned_tags().is_empty() {
        let _ = writeln!(user, "(none)");
    }
    for id in state.assigned_tags() {
        match kb.tag(id) {
            Some(tag) => {
                let _ = writeln!(user, "{}", tag_line(tag));
            }
            None => {
                let _ = writeln!(user, "- {}", id);
            }
        }
    }
    let _ = writeln!(user, "\nTag catalog:");
    for tag in kb.tags() {
        let _ = writeln!(user, "{}", tag_line(tag));
    }
    let _ = writeln!(user, "\nRecent conversation:\n{}", history);
    let _ = write!(
        user,
        "\nJSON format: {{\"tagsToRemove\": [], \"tagsToAdd\": [], \"reasoning\": \"...\", \
         \"confidence\": \"high|medium|low\"}}"
    );
    (sys, user)
}

/// Pick the most useful next question among open candidates
pub fn rank_questions(candidates: &[&Question], summary: &str, history: &str) -> Prompt {
    let sys = system(
        "Choose the single most informative next question for this client from the candidate \
         list. Prefer questions whose answer is not already known from the conversation.",
    );

    let mut user = String::new();
    let _ = writeln!(user, "Case summary: {}", summary);
    let _ = writeln!(user, "\nCandidate questions:");
    for q in candidates {
        let _ = writeln!(user, "- {}: {}", q.id, q.prompt);
    }
    let _ = writeln!(user, "\nRecent conversation:\n{}", history);
    let _ = write!(user, "\nJSON format: {{\"question_id\": \"<candidate id>\"}}");
    (sys, user)
}

/// Is the question already answered or clearly irrelevant?
pub fn skip_question(question: &Question, history: &str) -> Prompt {
    let sys = system(
        "Decide whether asking the question below would be redundant because the conversation \
         already answers it, or irrelevant because the client's facts rule it out. When in \
         doubt, do not skip.",
    );

    let mut user = String::new();
    let _ = writeln!(user, "Question: {}", question.prompt);
    let _ = writeln!(user, "\nConversation so far:\n{}", history);
    let _ = write!(
        user,
        "\nJSON format: {{\"skip\": false, \"confidence\": \"high|medium|low\", \"reasoning\": \"...\"}}"
    );
    (sys, user)
}

/// Holistic narrative over the combined situation
pub fn report_narrative(tags: &[&TagDefinition], form_lines: &[String]) -> Prompt {
    let sys = system(
        "Write a short holistic summary of the client's combined cross-border situation for a \
         tax specialist, then practical recommendations and next steps. Describe how the facts \
         interact; do not list each fact in isolation. Do not add or remove forms.",
    );

    let mut user = String::new();
    let _ = writeln!(user, "Client facts:");
    for tag in tags {
        let _ = writeln!(user, "{} Why it matters: {}", tag_line(tag), tag.why);
    }
    let _ = writeln!(user, "\nForms already identified:");
    for line in form_lines {
        let _ = writeln!(user, "- {}", line);
    }
    let _ = write!(
        user,
        "\nJSON format: {{\"analysis_summary\": \"...\", \"recommendations\": [\"...\"], \
         \"next_steps\": [\"...\"]}}"
    );
    (sys, user)
}

/// Short case summary used by delegated selection
pub fn case_summary(kb: &KnowledgeBase, state: &ConversationState) -> String {
    let names: Vec<&str> = state
        .assigned_tags()
        .iter()
        .map(|id| kb.tag(id).map(|t| t.display_name()).unwrap_or(id.as_str()))
        .collect();
    format!(
        "{} messages so far; confirmed facts: {}; completed modules: {}",
        state.message_count(),
        if names.is_empty() {
            "none".to_string()
        } else {
            names.join(", ")
        },
        join_or_none(state.completed_modules().iter())
    )
}

fn join_or_none<'a>(items: impl Iterator<Item = &'a String>) -> String {
    let joined = items.map(String::as_str).collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "none".to_string()
    } else {
        joined
    }
}
