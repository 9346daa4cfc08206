//! Fact extraction from free-text replies
//!
//! Two passes run per user message:
//!
//! - **Targeted**: does the answer affirm the tag of the question just asked?
//!   Delegated to the completion service when enabled, with every returned
//!   tag checked against [`KnowledgeBase::reachable_tags`]. Keyword
//!   affirmation is the fallback.
//! - **Broad**: scan the message against the whole tag catalog. Explicit,
//!   high-confidence facts are assigned at once; the rest wait in the state
//!   as pending facts until a targeted question confirms them.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::affirmation::{Affirmation, AffirmationDetector};
use crate::completion::ResilientCompletion;
use crate::kb::{Action, KnowledgeBase, Question, TagDefinition};
use crate::parser::parse_structured;
use crate::prompts;
use crate::state::{Confidence, ConversationState, PendingFact, Provenance, TagMethod};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetedReply {
    #[serde(default)]
    tags: Vec<TargetedTag>,
    #[serde(default)]
    needs_clarification: bool,
    #[serde(default)]
    clarification_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetedTag {
    tag: String,
    confidence: Confidence,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BroadReply {
    #[serde(default)]
    facts: Vec<BroadFact>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BroadFact {
    tag: String,
    confidence: Confidence,
    #[serde(default)]
    explicit: bool,
    #[serde(default)]
    evidence: String,
}

/// What one message contributed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Tags newly assigned, in assignment order
    pub assigned: Vec<String>,
    /// Facts queued for later verification
    pub queued: Vec<String>,
    pub needs_clarification: bool,
    pub clarification_prompt: Option<String>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.queued.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FactExtractor {
    affirmation: Arc<dyn AffirmationDetector>,
    delegated: bool,
    broad: bool,
    history_window: usize,
}

impl FactExtractor {
    pub fn new(affirmation: Arc<dyn AffirmationDetector>) -> Self {
        Self {
            affirmation,
            delegated: true,
            broad: true,
            history_window: 10,
        }
    }

    pub fn with_delegated(mut self, enabled: bool) -> Self {
        self.delegated = enabled;
        self
    }

    pub fn with_broad(mut self, enabled: bool) -> Self {
        self.broad = enabled;
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    /// Run both passes over `utterance` and apply the results to `state`
    pub async fn extract(
        &self,
        state: &mut ConversationState,
        kb: &KnowledgeBase,
        completion: &ResilientCompletion,
        utterance: &str,
        preceding: Option<&Question>,
    ) -> Extraction {
        let mut extraction = Extraction::default();

        if let Some(question) = preceding {
            self.targeted(state, kb, completion, utterance, question, &mut extraction)
                .await;
        }
        if self.broad {
            self.broad_pass(state, kb, completion, utterance, &mut extraction)
                .await;
        }

        if !extraction.is_empty() {
            tracing::debug!(
                "Extraction: assigned {:?}, queued {:?}",
                extraction.assigned,
                extraction.queued
            );
        }
        extraction
    }

    async fn targeted(
        &self,
        state: &mut ConversationState,
        kb: &KnowledgeBase,
        completion: &ResilientCompletion,
        utterance: &str,
        question: &Question,
        out: &mut Extraction,
    ) {
        let Action::AssignTag(tag) = &question.action else {
            return;
        };

        let verdict = self.affirmation.classify(utterance);
        if self.delegated {
            if let Some(reply) = self.delegated_targeted(state, kb, completion, utterance, question).await {
                self.apply_targeted(state, kb, utterance, question, reply, out);
                if verdict == Affirmation::Deny && !state.has_tag(tag) {
                    state.discard_fact(tag);
                }
                return;
            }
        }

        match verdict {
            Affirmation::Affirm => {
                let provenance = Provenance {
                    source_question: Some(question.id.clone()),
                    utterance: utterance.to_string(),
                    method: TagMethod::KeywordAffirmation,
                    reasoning: format!("affirmative answer to '{}'", question.prompt),
                    timestamp: Utc::now(),
                    turn: state.turn(),
                };
                if state.assign_tag(tag, Confidence::High, provenance) {
                    out.assigned.push(tag.clone());
                }
            }
            Affirmation::Deny => state.discard_fact(tag),
            Affirmation::Ambiguous => {}
        }
    }

    async fn delegated_targeted(
        &self,
        state: &ConversationState,
        kb: &KnowledgeBase,
        completion: &ResilientCompletion,
        utterance: &str,
        question: &Question,
    ) -> Option<TargetedReply> {
        let reachable = kb.reachable_tags(&question.id);
        let candidates: Vec<&TagDefinition> = reachable.iter().filter_map(|t| kb.tag(t)).collect();
        let history = state.conversation_context(self.history_window);
        let (system, user) = prompts::targeted_tag(question, &candidates, utterance, &history);

        let reply = match completion.complete(&system, &user).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("Targeted extraction for {} falling back: {}", question.id, e);
                return None;
            }
        };
        match parse_structured::<TargetedReply>(&reply.content) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Rejected targeted reply for {}: {}", question.id, e);
                None
            }
        }
    }

    fn apply_targeted(
        &self,
        state: &mut ConversationState,
        kb: &KnowledgeBase,
        utterance: &str,
        question: &Question,
        reply: TargetedReply,
        out: &mut Extraction,
    ) {
        let reachable = kb.reachable_tags(&question.id);
        for decision in reply.tags {
            if !reachable.contains(&decision.tag) {
                tracing::warn!(
                    "Discarding tag '{}' not reachable from question {}",
                    decision.tag,
                    question.id
                );
                continue;
            }
            tracing::debug!(
                "Targeted decision {} ({:?}): {}",
                decision.tag,
                decision.confidence,
                decision.reasoning
            );
            if decision.confidence == Confidence::Low {
                let fact = PendingFact {
                    tag: decision.tag.clone(),
                    confidence: decision.confidence,
                    explicit: false,
                    evidence: utterance.to_string(),
                    turn: state.turn(),
                };
                if state.queue_fact(fact) {
                    out.queued.push(decision.tag);
                }
                continue;
            }
            let provenance = Provenance {
                source_question: Some(question.id.clone()),
                utterance: utterance.to_string(),
                method: TagMethod::DelegatedTargeted,
                reasoning: decision.reasoning,
                timestamp: Utc::now(),
                turn: state.turn(),
            };
            if state.assign_tag(&decision.tag, decision.confidence, provenance) {
                out.assigned.push(decision.tag);
            }
        }

        if reply.needs_clarification && out.assigned.is_empty() {
            out.needs_clarification = true;
            out.clarification_prompt = reply
                .clarification_prompt
                .filter(|p| !p.trim().is_empty());
        }
    }

    async fn broad_pass(
        &self,
        state: &mut ConversationState,
        kb: &KnowledgeBase,
        completion: &ResilientCompletion,
        utterance: &str,
        out: &mut Extraction,
    ) {
        let history = state.conversation_context(self.history_window);
        let (system, user) = prompts::broad_scan(kb, state, utterance, &history);

        let reply = match completion.complete(&system, &user).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("Broad extraction unavailable: {}", e);
                return;
            }
        };
        let parsed = match parse_structured::<BroadReply>(&reply.content) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Rejected broad extraction reply: {}", e);
                return;
            }
        };

        for fact in parsed.facts {
            if !kb.has_tag(&fact.tag) {
                tracing::warn!("Discarding unknown tag '{}' from broad extraction", fact.tag);
                continue;
            }
            if state.has_tag(&fact.tag) {
                continue;
            }

            if fact.explicit && fact.confidence == Confidence::High {
                let provenance = Provenance {
                    source_question: None,
                    utterance: utterance.to_string(),
                    method: TagMethod::BroadExtraction,
                    reasoning: fact.evidence,
                    timestamp: Utc::now(),
                    turn: state.turn(),
                };
                if state.assign_tag(&fact.tag, fact.confidence, provenance) {
                    out.assigned.push(fact.tag);
                }
            } else {
                let tag = fact.tag.clone();
                let pending = PendingFact {
                    tag: fact.tag,
                    confidence: fact.confidence,
                    explicit: fact.explicit,
                    evidence: fact.evidence,
                    turn: state.turn(),
                };
                if state.queue_fact(pending) {
                    out.queued.push(tag);
                }
            }
        }
    }
}
