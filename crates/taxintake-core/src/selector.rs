//! Next-question selection
//!
//! Scans the active module in order, then the queue of triggered modules,
//! then the root gating questions. A question that was asked or skipped is
//! never offered again. Returning `None` means the question bank is
//! exhausted and the conversation is ready for forms analysis.

use serde::Deserialize;

use crate::completion::ResilientCompletion;
use crate::kb::{KnowledgeBase, Question};
use crate::parser::parse_structured;
use crate::prompts;
use crate::router::ModuleRouter;
use crate::state::ConversationState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// First open question in knowledge base order
    Deterministic,
    /// Completion service ranks the open questions; deterministic fallback
    Delegated,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RankedChoice {
    question_id: String,
}

#[derive(Debug, Clone)]
pub struct QuestionSelector {
    strategy: SelectionStrategy,
    delegated_skipping: bool,
    min_questions_before_skipping: usize,
    history_window: usize,
}

impl QuestionSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            delegated_skipping: false,
            min_questions_before_skipping: 5,
            history_window: 10,
        }
    }

    pub fn with_delegated_skipping(mut self, enabled: bool, min_asked: usize) -> Self {
        self.delegated_skipping = enabled;
        self.min_questions_before_skipping = min_asked;
        self
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Pick the next question, settling exhausted modules on the way
    pub async fn select_next<'a>(
        &self,
        state: &mut ConversationState,
        kb: &'a KnowledgeBase,
        router: &ModuleRouter,
        completion: &ResilientCompletion,
    ) -> Option<&'a Question> {
        loop {
            if let Some(module_id) = state.active_module().map(str::to_string) {
                let candidates = match kb.module(&module_id) {
                    Some(module) => open_questions(state, kb.module_questions(module)),
                    None => Vec::new(),
                };
                if let Some(question) = self
                    .first_askable(state, kb, router, completion, candidates)
                    .await
                {
                    return Some(question);
                }
                tracing::debug!("Module {} exhausted", module_id);
                state.complete_active_module();
                state.activate_next_queued();
                continue;
            }

            if state.activate_next_queued().is_some() {
                continue;
            }

            let candidates = open_questions(state, kb.gating());
            return self
                .first_askable(state, kb, router, completion, candidates)
                .await;
        }
    }

    /// Apply skip predicates and strategy to an ordered candidate list
    async fn first_askable<'a>(
        &self,
        state: &mut ConversationState,
        kb: &KnowledgeBase,
        router: &ModuleRouter,
        completion: &ResilientCompletion,
        candidates: Vec<&'a Question>,
    ) -> Option<&'a Question> {
        let mut remaining = Vec::new();
        for question in candidates {
            if let Some(reason) = router.skip_reason(kb, state, question) {
                state.skip_question(&question.id, reason);
            } else {
                remaining.push(question);
            }
        }

        if self.strategy == SelectionStrategy::Delegated && remaining.len() > 1 {
            if let Some(pick) = self.ranked_choice(state, kb, completion, &remaining).await {
                if let Some(pos) = remaining.iter().position(|q| q.id == pick) {
                    let chosen = remaining.remove(pos);
                    remaining.insert(0, chosen);
                }
            }
        }

        for question in remaining {
            if self.delegated_skip_allowed(state) {
                if let Some(reason) = router
                    .delegated_skip_reason(completion, state, question, self.history_window)
                    .await
                {
                    state.skip_question(&question.id, reason);
                    continue;
                }
            }
            // open_questions already filters these out
            if !state.is_question_open(&question.id) {
                tracing::warn!("Selector offered closed question {}; skipping", question.id);
                continue;
            }
            return Some(question);
        }
        None
    }

    fn delegated_skip_allowed(&self, state: &ConversationState) -> bool {
        self.delegated_skipping
            && state.asked_questions().len() >= self.min_questions_before_skipping
    }

    /// Ask the service to rank; `None` unless the reply names an open candidate
    async fn ranked_choice(
        &self,
        state: &ConversationState,
        kb: &KnowledgeBase,
        completion: &ResilientCompletion,
        candidates: &[&Question],
    ) -> Option<String> {
        let summary = prompts::case_summary(kb, state);
        let history = state.conversation_context(self.history_window);
        let (system, user) = prompts::rank_questions(candidates, &summary, &history);

        let reply = completion.complete(&system, &user).await.ok()?;
        match parse_structured::<RankedChoice>(&reply.content) {
            Ok(choice) if candidates.iter().any(|q| q.id == choice.question_id) => {
                Some(choice.question_id)
            }
            Ok(choice) => {
                tracing::warn!(
                    "Ranking named unknown or closed question '{}'; using catalog order",
                    choice.question_id
                );
                None
            }
            Err(e) => {
                tracing::warn!("Rejected ranking reply: {}", e);
                None
            }
        }
    }
}

fn open_questions<'a>(
    state: &ConversationState,
    questions: impl Iterator<Item = &'a Question>,
) -> Vec<&'a Question> {
    questions.filter(|q| state.is_question_open(&q.id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affirmation::KeywordAffirmation;
    use crate::kb::fixtures;
    use std::sync::Arc;

    fn router() -> ModuleRouter {
        ModuleRouter::new(Arc::new(KeywordAffirmation::new()))
    }

    #[tokio::test]
    async fn test_gating_scan_in_order() {
        let kb = fixtures::kb();
        let mut state = ConversationState::new();
        let selector = QuestionSelector::new(SelectionStrategy::Deterministic);
        let completion = ResilientCompletion::unavailable();

        let next = selector
            .select_next(&mut state, &kb, &router(), &completion)
            .await;
        assert_eq!(next.map(|q| q.id.as_str()), Some("g_us"));

        state.mark_asked("g_us").unwrap();
        let next = selector
            .select_next(&mut state, &kb, &router(), &completion)
            .await;
        assert_eq!(next.map(|q| q.id.as_str()), Some("g_biz"));
    }

    #[tokio::test]
    async fn test_active_module_first_then_completion() {
        let kb = fixtures::kb();
        let mut state = ConversationState::new();
        let selector = QuestionSelector::new(SelectionStrategy::Deterministic);
        let completion = ResilientCompletion::unavailable();

        state.mark_asked("g_us").unwrap();
        state.request_module("residency");

        let next = selector
            .select_next(&mut state, &kb, &router(), &completion)
            .await;
        assert_eq!(next.map(|q| q.id.as_str()), Some("r_canada"));

        state.mark_asked("r_canada").unwrap();
        state.mark_asked("r_filing").unwrap();
        let next = selector
            .select_next(&mut state, &kb, &router(), &completion)
            .await;
        assert_eq!(next.map(|q| q.id.as_str()), Some("g_biz"));
        assert!(state.completed_modules().contains("residency"));
        assert_eq!(state.active_module(), None);
    }

    #[tokio::test]
    async fn test_queued_module_served_after_active() {
        let kb = fixtures::kb();
        let mut state = ConversationState::new();
        let selector = QuestionSelector::new(SelectionStrategy::Deterministic);
        let completion = ResilientCompletion::unavailable();

        state.mark_asked("g_us").unwrap();
        state.mark_asked("g_biz").unwrap();
        state.request_module("residency");
        state.request_module("business");
        state.mark_asked("r_canada").unwrap();
        state.mark_asked("r_filing").unwrap();

        let next = selector
            .select_next(&mut state, &kb, &router(), &completion)
            .await;
        assert_eq!(next.map(|q| q.id.as_str()), Some("b_corp"));
        assert_eq!(state.active_module(), Some("business"));
    }

    #[tokio::test]
    async fn test_exhaustion_returns_none() {
        let kb = fixtures::kb();
        let mut state = ConversationState::new();
        let selector = QuestionSelector::new(SelectionStrategy::Delegated);
        let completion = ResilientCompletion::unavailable();

        state.mark_asked("g_us").unwrap();
        state.mark_asked("g_biz").unwrap();
        assert!(selector
            .select_next(&mut state, &kb, &router(), &completion)
            .await
            .is_none());
    }
}
