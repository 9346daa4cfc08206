//! Turn orchestration
//!
//! [`IntakeEngine::turn`] is the only way state advances. It clones the
//! committed state into a draft, runs correction, extraction, routing,
//! selection and the phase gate over the draft, checks invariants and
//! returns the new state. The caller replaces its copy only on success, so
//! a failed or cancelled turn leaves nothing half-applied.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::affirmation::{AffirmationDetector, KeywordAffirmation};
use crate::completion::{CompletionService, ResilientCompletion};
use crate::config::{EngineConfig, FeatureFlags};
use crate::correction::{detect_correction, CorrectionHandler, CorrectionOutcome};
use crate::extractor::FactExtractor;
use crate::kb::{Action, KnowledgeBase};
use crate::phase::{ForceDecision, PhaseController};
use crate::report::Report;
use crate::privacy::{self, SensitiveKind};
use crate::router::{ModuleRouter, RouteOutcome};
use crate::selector::{QuestionSelector, SelectionStrategy};
use crate::state::{ConversationState, Phase, Role, TransitionReason};
use crate::synthesizer::FormsSynthesizer;
use crate::Result;

pub const DEFAULT_OPENING: &str = "I need help with my cross-border tax situation.";

pub const RETRY_MESSAGE: &str =
    "I apologize, but I'm having trouble processing your request. Could you please try again?";

const COMPLETED_FOLLOW_UP: &str = "Your intake is complete and your analysis is above. \
For changes to your situation, please start a new session or raise them with your tax professional.";

pub fn default_quick_replies() -> Vec<String> {
    ["Yes", "No", "Not sure"].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnInput {
    Message(String),
    ForceTransition,
}

/// Output of one turn, in the shape the surrounding application consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub assistant_text: String,
    pub quick_reply_options: Vec<String>,
    pub phase: Phase,
    pub assigned_tags: Vec<String>,
    pub transitioned: bool,
    pub report: Option<Report>,
}

impl TurnResult {
    fn from_state(state: &ConversationState, assistant_text: String) -> Self {
        let quick_reply_options = if state.phase() == Phase::Intake {
            default_quick_replies()
        } else {
            Vec::new()
        };
        Self {
            assistant_text,
            quick_reply_options,
            phase: state.phase(),
            assigned_tags: state.assigned_tags().iter().cloned().collect(),
            transitioned: false,
            report: None,
        }
    }

    /// Neutral reply for a turn that could not be completed
    pub fn retry(state: &ConversationState) -> Self {
        Self::from_state(state, RETRY_MESSAGE.to_string())
    }
}

/// The intake workflow over one knowledge base
#[derive(Debug, Clone)]
pub struct IntakeEngine {
    kb: Arc<KnowledgeBase>,
    config: EngineConfig,
    completion: ResilientCompletion,
    router: ModuleRouter,
    selector: QuestionSelector,
    extractor: FactExtractor,
    corrections: CorrectionHandler,
    phase: PhaseController,
    synthesizer: FormsSynthesizer,
}

impl IntakeEngine {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        config: EngineConfig,
        service: Arc<dyn CompletionService>,
    ) -> Self {
        let completion = ResilientCompletion::new(service, config.completion.clone());
        Self::assemble(kb, config, completion, Arc::new(KeywordAffirmation::new()))
    }

    /// Rules only: no completion service, every delegated feature off
    pub fn offline(kb: Arc<KnowledgeBase>, config: EngineConfig) -> Self {
        let config = config.with_features(FeatureFlags::offline());
        let completion = ResilientCompletion::unavailable();
        Self::assemble(kb, config, completion, Arc::new(KeywordAffirmation::new()))
    }

    /// Swap the affirmation detector used by routing and fallback extraction
    pub fn with_affirmation(self, detector: Arc<dyn AffirmationDetector>) -> Self {
        Self::assemble(self.kb, self.config, self.completion, detector)
    }

    fn assemble(
        kb: Arc<KnowledgeBase>,
        config: EngineConfig,
        completion: ResilientCompletion,
        detector: Arc<dyn AffirmationDetector>,
    ) -> Self {
        let features = &config.features;
        let strategy = if features.delegated_selection {
            SelectionStrategy::Delegated
        } else {
            SelectionStrategy::Deterministic
        };
        let selector = QuestionSelector::new(strategy)
            .with_delegated_skipping(
                features.delegated_skipping,
                config.min_questions_before_skipping,
            )
            .with_history_window(config.history_window);
        let extractor = FactExtractor::new(detector.clone())
            .with_delegated(features.delegated_tag_assignment)
            .with_broad(features.broad_extraction)
            .with_history_window(config.history_window);

        Self {
            router: ModuleRouter::new(detector),
            selector,
            extractor,
            corrections: CorrectionHandler::new(config.history_window),
            phase: PhaseController::new(config.thresholds.clone()),
            synthesizer: FormsSynthesizer::new(features.narrative_synthesis),
            kb,
            config,
            completion,
        }
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn completion(&self) -> &ResilientCompletion {
        &self.completion
    }

    /// Advance `state` by one turn without touching it
    pub async fn turn(
        &self,
        state: &ConversationState,
        input: TurnInput,
    ) -> Result<(ConversationState, TurnResult)> {
        let mut draft = state.clone();
        draft.begin_turn();

        let result = match input {
            TurnInput::Message(text) => self.on_message(&mut draft, &text).await?,
            TurnInput::ForceTransition => self.on_force(&mut draft).await?,
        };

        draft.commit()?;
        tracing::debug!(
            "Turn {} committed: phase {}, {} tags, version {}",
            draft.turn(),
            draft.phase(),
            draft.assigned_tags().len(),
            draft.version()
        );
        Ok((draft, result))
    }

    async fn on_message(&self, draft: &mut ConversationState, text: &str) -> Result<TurnResult> {
        let text = if text.trim().is_empty() {
            DEFAULT_OPENING
        } else {
            text.trim()
        };

        let sensitive = privacy::detect_sensitive(text);
        if !sensitive.is_empty() {
            return self.reject_sensitive(draft, text, &sensitive).await;
        }
        draft.push_message(Role::User, text);

        if draft.phase() != Phase::Intake {
            return self.after_completion(draft).await;
        }

        let kb = self.kb.as_ref();
        let preceding = draft
            .take_pending_question()
            .and_then(|id| kb.question(&id));

        let mut notes = Vec::new();
        if self.config.features.correction_handling && detect_correction(text) {
            if let Some(payload) = self
                .corrections
                .request(&self.completion, kb, draft, text)
                .await
            {
                let outcome = self.corrections.apply(kb, draft, text, &payload);
                if let Some(note) = acknowledge(kb, &outcome) {
                    notes.push(note);
                }
            }
        }

        let extraction = self
            .extractor
            .extract(draft, kb, &self.completion, text, preceding)
            .await;

        let mut clarification = None;
        if let Some(question) = preceding {
            if matches!(question.action, Action::ActivateModule(_)) {
                let outcome = self.router.activate_if_triggered(draft, text, question);
                tracing::debug!("Routing after {}: {:?}", question.id, outcome);
                if let RouteOutcome::Ambiguous(_) = outcome {
                    clarification = Some(confirm_prompt(&question.prompt));
                }
            }
        }
        if extraction.needs_clarification && clarification.is_none() {
            clarification = extraction.clarification_prompt;
        }

        if let Some(reason) = self.phase.hard_cap(draft) {
            return self.finish(draft, reason, notes).await;
        }

        if let (Some(question), Some(prompt)) = (preceding, clarification) {
            if draft.request_clarification(&question.id) {
                notes.push(prompt);
                return Ok(self.reply(draft, notes));
            }
            tracing::debug!("Already clarified {}; moving on", question.id);
        }

        let next = self
            .selector
            .select_next(draft, kb, &self.router, &self.completion)
            .await;

        if let Some(reason) = self.phase.evaluate(draft, next) {
            return self.finish(draft, reason, notes).await;
        }

        match next {
            Some(question) => {
                if let Err(e) = draft.mark_asked(&question.id) {
                    tracing::warn!("Refusing to repeat question {}: {}", question.id, e);
                    return Err(e);
                }
                notes.push(question.prompt.clone());
                Ok(self.reply(draft, notes))
            }
            None => self.finish(draft, TransitionReason::QuestionsExhausted, notes).await,
        }
    }

    /// Store the redacted reply and warn; the pending question stays open
    async fn reject_sensitive(
        &self,
        draft: &mut ConversationState,
        text: &str,
        kinds: &[SensitiveKind],
    ) -> Result<TurnResult> {
        tracing::warn!(
            "Rejected a reply containing {}",
            kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
        );
        draft.record_sensitive_input(kinds.iter().map(|k| k.to_string()).collect());
        draft.push_message(Role::User, privacy::redact(text));

        let notes = vec![privacy::SENSITIVE_INFO_WARNING.to_string()];
        match draft.phase() {
            Phase::Intake => {
                if let Some(reason) = self.phase.hard_cap(draft) {
                    return self.finish(draft, reason, notes).await;
                }
                Ok(self.reply(draft, notes))
            }
            _ => {
                let mut result = self.reply(draft, notes);
                result.report = draft.report().cloned();
                Ok(result)
            }
        }
    }

    async fn on_force(&self, draft: &mut ConversationState) -> Result<TurnResult> {
        match self.phase.force(draft) {
            ForceDecision::Declined(text) => {
                tracing::info!("Force transition declined: no tags assigned");
                Ok(TurnResult::from_state(draft, text.to_string()))
            }
            ForceDecision::AlreadyCompleted => {
                let mut result = TurnResult::from_state(
                    draft,
                    "Your analysis is already complete.".to_string(),
                );
                result.report = draft.report().cloned();
                Ok(result)
            }
            ForceDecision::Transition(reason) => self.finish(draft, reason, Vec::new()).await,
        }
    }

    /// Leave intake: synthesize, store the report, close the conversation
    async fn finish(
        &self,
        draft: &mut ConversationState,
        reason: TransitionReason,
        mut notes: Vec<String>,
    ) -> Result<TurnResult> {
        self.phase.enter_forms_analysis(draft, reason.clone())?;
        let report = self
            .synthesizer
            .synthesize(draft.assigned_tags(), &self.kb, &self.completion)
            .await;
        self.phase.complete(draft, report.clone())?;

        notes.push(format!(
            "Thank you. I have what I need to prepare your analysis ({}).",
            reason
        ));
        notes.push(report.to_markdown());
        let text = notes.join("\n\n");
        draft.push_message(Role::Assistant, text.clone());

        let mut result = TurnResult::from_state(draft, text);
        result.transitioned = true;
        result.report = Some(report);
        Ok(result)
    }

    async fn after_completion(&self, draft: &mut ConversationState) -> Result<TurnResult> {
        if draft.phase() == Phase::FormsAnalysis {
            let reason = draft
                .transition_reason()
                .cloned()
                .unwrap_or(TransitionReason::QuestionsExhausted);
            let report = self
                .synthesizer
                .synthesize(draft.assigned_tags(), &self.kb, &self.completion)
                .await;
            tracing::warn!("Completing analysis left unfinished ({})", reason);
            self.phase.complete(draft, report)?;
        }
        draft.push_message(Role::Assistant, COMPLETED_FOLLOW_UP);
        let mut result = TurnResult::from_state(draft, COMPLETED_FOLLOW_UP.to_string());
        result.report = draft.report().cloned();
        Ok(result)
    }

    fn reply(&self, draft: &mut ConversationState, notes: Vec<String>) -> TurnResult {
        let text = notes.join("\n\n");
        draft.push_message(Role::Assistant, text.clone());
        TurnResult::from_state(draft, text)
    }
}

fn confirm_prompt(prompt: &str) -> String {
    format!("Just to confirm: {} A simple yes or no is fine.", prompt)
}

fn acknowledge(kb: &KnowledgeBase, outcome: &CorrectionOutcome) -> Option<String> {
    if outcome.is_empty() {
        return None;
    }
    let name = |id: &String| {
        kb.tag(id)
            .map(|t| t.display_name().to_string())
            .unwrap_or_else(|| id.clone())
    };
    let mut parts = Vec::new();
    if !outcome.removed.is_empty() {
        parts.push(format!(
            "removed {}",
            outcome.removed.iter().map(name).collect::<Vec<_>>().join(", ")
        ));
    }
    if !outcome.added.is_empty() {
        parts.push(format!(
            "noted {}",
            outcome.added.iter().map(name).collect::<Vec<_>>().join(", ")
        ));
    }
    Some(format!("Thanks for the correction. I have {}.", parts.join(" and ")))
}
