//! Phase transitions and loop prevention
//!
//! `intake -> forms_analysis -> completed`, forward only. Sufficiency is
//! judged only at a node boundary (no module in progress); the hard message
//! cap applies at any point and guarantees termination.

use crate::config::TransitionThresholds;
use crate::kb::Question;
use crate::report::Report;
use crate::state::{ConversationState, Phase, TransitionReason};
use crate::Result;

pub const FORCE_DECLINED: &str =
    "No tags assigned yet. Please continue the conversation to gather more information.";

/// Why a force request was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceDecision {
    Transition(TransitionReason),
    Declined(&'static str),
    /// The report already exists
    AlreadyCompleted,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseController {
    thresholds: TransitionThresholds,
}

impl PhaseController {
    pub fn new(thresholds: TransitionThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &TransitionThresholds {
        &self.thresholds
    }

    /// Cap reached once one more assistant message would meet `max_messages`
    ///
    /// Checked after the user message is stored, so a closing report is the
    /// only reply that can land on or past the cap.
    pub fn hard_cap(&self, state: &ConversationState) -> Option<TransitionReason> {
        let messages = state.message_count();
        (messages + 1 >= self.thresholds.max_messages)
            .then_some(TransitionReason::HardCap { messages })
    }

    /// Decide whether intake should end, given the question selected next
    pub fn evaluate(
        &self,
        state: &ConversationState,
        next: Option<&Question>,
    ) -> Option<TransitionReason> {
        if state.phase() != Phase::Intake {
            return None;
        }
        if let Some(reason) = self.hard_cap(state) {
            return Some(reason);
        }

        let Some(next) = next else {
            return Some(TransitionReason::QuestionsExhausted);
        };

        // Never cut a module short
        if state.active_module().is_some() || !next.is_gating() {
            return None;
        }

        let tags = state.assigned_tags().len();
        let messages = state.message_count();
        if tags >= self.thresholds.min_tags && messages >= self.thresholds.min_messages {
            return Some(TransitionReason::Sufficient { tags, messages });
        }
        None
    }

    /// Explicit transition request; needs at least one tag
    pub fn force(&self, state: &ConversationState) -> ForceDecision {
        match state.phase() {
            Phase::Completed => ForceDecision::AlreadyCompleted,
            _ if state.assigned_tags().is_empty() => ForceDecision::Declined(FORCE_DECLINED),
            _ => ForceDecision::Transition(TransitionReason::Forced),
        }
    }

    pub fn enter_forms_analysis(
        &self,
        state: &mut ConversationState,
        reason: TransitionReason,
    ) -> Result<()> {
        tracing::info!("Transitioning to forms analysis: {}", reason);
        state.mark_transition(reason);
        state.advance_phase(Phase::FormsAnalysis)
    }

    /// Store the report and close the conversation
    pub fn complete(&self, state: &mut ConversationState, report: Report) -> Result<()> {
        state.set_report(report);
        state.advance_phase(Phase::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::fixtures;
    use crate::state::{Confidence, Provenance, Role, TagMethod};

    fn controller(min_tags: usize, min_messages: usize, max_messages: usize) -> PhaseController {
        PhaseController::new(TransitionThresholds {
            min_tags,
            min_messages,
            max_messages,
        })
    }

    fn tag(state: &mut ConversationState, id: &str) {
        state.assign_tag(
            id,
            Confidence::High,
            Provenance {
                source_question: None,
                utterance: "yes".to_string(),
                method: TagMethod::KeywordAffirmation,
                reasoning: String::new(),
                timestamp: chrono::Utc::now(),
                turn: 0,
            },
        );
    }

    #[test]
    fn test_both_thresholds_required() {
        let kb = fixtures::kb();
        let gating = kb.question("g_biz");
        let pc = controller(1, 4, 100);
        let mut state = ConversationState::new();

        tag(&mut state, "us_in_canada");
        assert_eq!(pc.evaluate(&state, gating), None);

        for _ in 0..4 {
            state.push_message(Role::User, "hi");
        }
        assert_eq!(
            pc.evaluate(&state, gating),
            Some(TransitionReason::Sufficient { tags: 1, messages: 4 })
        );
    }

    #[test]
    fn test_not_mid_module() {
        let kb = fixtures::kb();
        let pc = controller(0, 0, 100);
        let mut state = ConversationState::new();
        state.request_module("residency");
        assert_eq!(pc.evaluate(&state, kb.question("r_canada")), None);
        assert_eq!(
            pc.evaluate(&state, None),
            Some(TransitionReason::QuestionsExhausted)
        );
    }

    #[test]
    fn test_hard_cap_applies_mid_module() {
        let kb = fixtures::kb();
        let pc = controller(10, 10, 2);
        let mut state = ConversationState::new();
        state.request_module("residency");
        state.push_message(Role::User, "a");
        state.push_message(Role::Assistant, "b");
        assert_eq!(
            pc.evaluate(&state, kb.question("r_canada")),
            Some(TransitionReason::HardCap { messages: 2 })
        );
    }

    #[test]
    fn test_hard_cap_leaves_room_only_for_the_report() {
        let pc = controller(10, 10, 6);
        let mut state = ConversationState::new();
        for i in 0..4 {
            state.push_message(if i % 2 == 0 { Role::User } else { Role::Assistant }, "x");
        }
        assert_eq!(pc.hard_cap(&state), None);

        state.push_message(Role::User, "x");
        assert_eq!(pc.hard_cap(&state), Some(TransitionReason::HardCap { messages: 5 }));
    }

    #[test]
    fn test_force_requires_a_tag() {
        let pc = PhaseController::default();
        let mut state = ConversationState::new();
        assert_eq!(pc.force(&state), ForceDecision::Declined(FORCE_DECLINED));
        tag(&mut state, "us_in_canada");
        assert_eq!(pc.force(&state), ForceDecision::Transition(TransitionReason::Forced));

        pc.enter_forms_analysis(&mut state, TransitionReason::Forced).unwrap();
        pc.complete(&mut state, Report::no_tags()).unwrap();
        assert_eq!(pc.force(&state), ForceDecision::AlreadyCompleted);
        assert!(state.should_transition());
    }
}
