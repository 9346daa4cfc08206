//! Module routing and skip decisions
//!
//! Gating answers activate modules; only one module is active at a time and
//! later triggers queue behind it. Skipping always defaults to "ask": a rule
//! or a delegated decision must positively show a question is irrelevant.

use serde::Deserialize;
use std::sync::Arc;

use crate::affirmation::{Affirmation, AffirmationDetector};
use crate::completion::ResilientCompletion;
use crate::kb::{Action, KnowledgeBase, Question};
use crate::parser::parse_structured;
use crate::prompts;
use crate::state::{Confidence, ConversationState, ModuleActivation};

/// What the router did with a gating answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Activated(String),
    Queued(String),
    Skipped(String),
    /// Answer neither confirmed nor denied the module
    Ambiguous(String),
    /// Question activates nothing, or the module was already settled
    Unchanged,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SkipDecision {
    skip: bool,
    confidence: Confidence,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Clone)]
pub struct ModuleRouter {
    affirmation: Arc<dyn AffirmationDetector>,
}

impl ModuleRouter {
    pub fn new(affirmation: Arc<dyn AffirmationDetector>) -> Self {
        Self { affirmation }
    }

    pub fn affirmation(&self) -> &Arc<dyn AffirmationDetector> {
        &self.affirmation
    }

    /// Apply the answer to an `ActivateModule` question
    pub fn activate_if_triggered(
        &self,
        state: &mut ConversationState,
        answer: &str,
        question: &Question,
    ) -> RouteOutcome {
        let Action::ActivateModule(module) = &question.action else {
            return RouteOutcome::Unchanged;
        };

        match self.affirmation.classify(answer) {
            Affirmation::Affirm => match state.request_module(module) {
                ModuleActivation::Activated => {
                    tracing::debug!("Module {} activated by {}", module, question.id);
                    RouteOutcome::Activated(module.clone())
                }
                ModuleActivation::Queued => {
                    tracing::debug!("Module {} queued by {}", module, question.id);
                    RouteOutcome::Queued(module.clone())
                }
                ModuleActivation::Ignored => RouteOutcome::Unchanged,
            },
            Affirmation::Deny => {
                if state.skip_module(module, format!("denied at {}", question.id)) {
                    tracing::debug!("Module {} skipped after denial", module);
                    RouteOutcome::Skipped(module.clone())
                } else {
                    RouteOutcome::Unchanged
                }
            }
            Affirmation::Ambiguous => {
                tracing::debug!(
                    "Ambiguous answer to {}; module {} not triggered",
                    question.id,
                    module
                );
                RouteOutcome::Ambiguous(module.clone())
            }
        }
    }

    /// Rule-based skip: only for facts the state already settles
    pub fn skip_reason(
        &self,
        kb: &KnowledgeBase,
        state: &ConversationState,
        question: &Question,
    ) -> Option<String> {
        match &question.action {
            Action::AssignTag(tag) if state.has_tag(tag) => {
                Some(format!("tag '{}' already assigned", tag))
            }
            Action::ActivateModule(module) if state.is_module_settled(module) => {
                Some(format!("module '{}' already settled", module))
            }
            Action::ActivateModule(module)
                if state.active_module() == Some(module.as_str())
                    || state.queued_modules().any(|m| m == module) =>
            {
                Some(format!("module '{}' already triggered", module))
            }
            Action::ActivateModule(module) if module_fully_known(kb, state, module) => {
                Some(format!("every fact in module '{}' already known", module))
            }
            _ => None,
        }
    }

    /// Ask the completion service whether a question is redundant
    ///
    /// Only a parsed, high-confidence "skip" counts. Failures and anything
    /// less certain return `None`, meaning the question is asked.
    pub async fn delegated_skip_reason(
        &self,
        completion: &ResilientCompletion,
        state: &ConversationState,
        question: &Question,
        history_window: usize,
    ) -> Option<String> {
        let history = state.conversation_context(history_window);
        let (system, user) = prompts::skip_question(question, &history);

        let reply = match completion.complete(&system, &user).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("Skip check for {} unavailable: {}", question.id, e);
                return None;
            }
        };

        match parse_structured::<SkipDecision>(&reply.content) {
            Ok(decision) if decision.skip && decision.confidence == Confidence::High => {
                Some(format!("delegated: {}", decision.reasoning))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Rejected skip decision for {}: {}", question.id, e);
                None
            }
        }
    }
}

/// Whether the tags `kb` would assign inside `module` are all already known
pub fn module_fully_known(kb: &KnowledgeBase, state: &ConversationState, module: &str) -> bool {
    let Some(module) = kb.module(module) else {
        return false;
    };
    let mut questions = kb.module_questions(module).peekable();
    questions.peek().is_some()
        && questions.all(|q| q.action.tag().map(|t| state.has_tag(t)).unwrap_or(false))
}
