//! Corrective restatements
//!
//! A message that starts to take something back ("actually", "wait", ...)
//! is sent to the completion service together with the current tags. The
//! returned payload is applied atomically: removals only touch assigned tags,
//! additions only known and absent ones, so applying the same payload twice
//! changes nothing the second time.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::completion::ResilientCompletion;
use crate::kb::KnowledgeBase;
use crate::parser::parse_structured;
use crate::prompts;
use crate::state::{Confidence, ConversationState, CorrectionRecord, Provenance, TagMethod};

lazy_static! {
    static ref CORRECTION_TRIGGER: Regex = Regex::new(
        r"(?i)\b(actually|wait|i meant|i mean|that's wrong|that is wrong|that's not right|that's incorrect|correction|i misspoke|let me correct|not quite|scratch that|i was wrong|i made a mistake)\b"
    )
    .unwrap();
}

/// Whether an utterance looks like it corrects an earlier answer
pub fn detect_correction(utterance: &str) -> bool {
    CORRECTION_TRIGGER.is_match(&utterance.replace('\u{2019}', "'"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CorrectionPayload {
    #[serde(default)]
    pub tags_to_remove: Vec<String>,
    #[serde(default)]
    pub tags_to_add: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    pub confidence: Confidence,
}

/// Tags actually changed by one application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrectionOutcome {
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

impl CorrectionOutcome {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CorrectionHandler {
    history_window: usize,
}

impl Default for CorrectionHandler {
    fn default() -> Self {
        Self::new(10)
    }
}

impl CorrectionHandler {
    pub fn new(history_window: usize) -> Self {
        Self { history_window }
    }

    /// Ask the completion service how to reconcile `utterance`
    pub async fn request(
        &self,
        completion: &ResilientCompletion,
        kb: &KnowledgeBase,
        state: &ConversationState,
        utterance: &str,
    ) -> Option<CorrectionPayload> {
        let history = state.conversation_context(self.history_window);
        let (system, user) = prompts::correction(kb, state, utterance, &history);

        let reply = match completion.complete(&system, &user).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Correction analysis unavailable: {}", e);
                return None;
            }
        };
        match parse_structured::<CorrectionPayload>(&reply.content) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!("Rejected correction reply: {}", e);
                None
            }
        }
    }

    /// Apply a parsed payload; low confidence changes nothing
    pub fn apply(
        &self,
        kb: &KnowledgeBase,
        state: &mut ConversationState,
        utterance: &str,
        payload: &CorrectionPayload,
    ) -> CorrectionOutcome {
        let mut outcome = CorrectionOutcome::default();
        if payload.confidence == Confidence::Low {
            tracing::debug!("Ignoring low-confidence correction: {}", payload.reasoning);
            return outcome;
        }

        // A tag on both lists is contradictory; leave it alone
        let contested =
            |tag: &String| payload.tags_to_remove.contains(tag) && payload.tags_to_add.contains(tag);

        for tag in payload.tags_to_remove.iter().filter(|t| !contested(t)) {
            if state.remove_tag(tag) {
                outcome.removed.push(tag.clone());
            }
        }

        for tag in payload.tags_to_add.iter().filter(|t| !contested(t)) {
            if !kb.has_tag(tag) {
                tracing::warn!("Correction named unknown tag '{}'", tag);
                continue;
            }
            let provenance = Provenance {
                source_question: None,
                utterance: utterance.to_string(),
                method: TagMethod::Correction,
                reasoning: payload.reasoning.clone(),
                timestamp: Utc::now(),
                turn: state.turn(),
            };
            if state.assign_tag(tag, payload.confidence, provenance) {
                outcome.added.push(tag.clone());
            }
        }

        if !outcome.is_empty() {
            tracing::info!(
                "Correction applied: removed {:?}, added {:?}",
                outcome.removed,
                outcome.added
            );
            state.record_correction(CorrectionRecord {
                utterance: utterance.to_string(),
                tags_removed: outcome.removed.clone(),
                tags_added: outcome.added.clone(),
                reasoning: payload.reasoning.clone(),
                turn_index: state.turn(),
            });
        }
        outcome
    }
}
