//! Conversation state aggregate
//!
//! One [`ConversationState`] per session. It is advanced exactly once per
//! turn: the engine clones it into a draft, mutates the draft through the
//! methods below, checks invariants and only then replaces the committed
//! value. Mutators enforce the local invariants (no question asked twice,
//! tag maps kept in lockstep, forward-only phase) so a draft cannot drift
//! into an inconsistent shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use uuid::Uuid;

use crate::report::Report;
use crate::{IntakeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    FormsAnalysis,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::FormsAnalysis => "forms_analysis",
            Phase::Completed => "completed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// How a tag came to be assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMethod {
    /// Keyword affirmation of the question just asked
    KeywordAffirmation,
    /// Completion service judged the answer to the question just asked
    DelegatedTargeted,
    /// Explicit fact found in free text, independent of the question
    BroadExtraction,
    /// Added by a corrective restatement
    Correction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_question: Option<String>,
    pub utterance: String,
    pub method: TagMethod,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
    pub turn: usize,
}

/// Fact seen in free text but not yet trusted enough to assign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFact {
    pub tag: String,
    pub confidence: Confidence,
    pub explicit: bool,
    pub evidence: String,
    pub turn: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub utterance: String,
    pub tags_removed: Vec<String>,
    pub tags_added: Vec<String>,
    pub reasoning: String,
    pub turn_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionReason {
    /// Both tag and length thresholds met
    Sufficient { tags: usize, messages: usize },
    /// Nothing left to ask
    QuestionsExhausted,
    /// Explicit request from the caller
    Forced,
    /// Hard conversation length cap reached
    HardCap { messages: usize },
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionReason::Sufficient { tags, messages } => {
                write!(f, "sufficient information ({} tags, {} messages)", tags, messages)
            }
            TransitionReason::QuestionsExhausted => write!(f, "all questions covered"),
            TransitionReason::Forced => write!(f, "forced by request"),
            TransitionReason::HardCap { messages } => {
                write!(f, "conversation length cap reached ({} messages)", messages)
            }
        }
    }
}

/// Result of asking to activate a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleActivation {
    Activated,
    Queued,
    /// Already active, queued, completed or skipped
    Ignored,
}

/// Append-only audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AuditEvent {
    TagAssigned {
        tag: String,
        confidence: Confidence,
        method: TagMethod,
    },
    TagRemoved {
        tag: String,
    },
    FactQueued {
        tag: String,
        confidence: Confidence,
    },
    ModuleActivated {
        module: String,
    },
    ModuleQueued {
        module: String,
    },
    ModuleCompleted {
        module: String,
    },
    ModuleSkipped {
        module: String,
        reason: String,
    },
    QuestionAsked {
        question: String,
    },
    QuestionSkipped {
        question: String,
        reason: String,
    },
    CorrectionApplied {
        removed: Vec<String>,
        added: Vec<String>,
    },
    PhaseChanged {
        from: Phase,
        to: Phase,
    },
    SensitiveInputRejected {
        kinds: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub turn: usize,
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
}

/// Per-session conversation aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    version: u64,
    turn: usize,
    messages: Vec<Message>,
    phase: Phase,

    active_module: Option<String>,
    module_queue: VecDeque<String>,
    completed_modules: BTreeSet<String>,
    skipped_modules: BTreeSet<String>,

    asked_questions: Vec<String>,
    skipped_questions: BTreeSet<String>,
    /// Question whose answer the next user message is expected to carry
    pending_question: Option<String>,
    clarified_questions: BTreeSet<String>,

    assigned_tags: BTreeSet<String>,
    tag_confidence: BTreeMap<String, Confidence>,
    tag_provenance: BTreeMap<String, Provenance>,
    pending_facts: Vec<PendingFact>,
    corrections: Vec<CorrectionRecord>,

    should_transition: bool,
    transition_reason: Option<TransitionReason>,
    report: Option<Report>,

    audit: Vec<AuditRecord>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: 0,
            turn: 0,
            messages: Vec::new(),
            phase: Phase::Intake,
            active_module: None,
            module_queue: VecDeque::new(),
            completed_modules: BTreeSet::new(),
            skipped_modules: BTreeSet::new(),
            asked_questions: Vec::new(),
            skipped_questions: BTreeSet::new(),
            pending_question: None,
            clarified_questions: BTreeSet::new(),
            assigned_tags: BTreeSet::new(),
            tag_confidence: BTreeMap::new(),
            tag_provenance: BTreeMap::new(),
            pending_facts: Vec::new(),
            corrections: Vec::new(),
            should_transition: false,
            transition_reason: None,
            report: None,
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    // -- turn bookkeeping ---------------------------------------------------

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn turn(&self) -> usize {
        self.turn
    }

    pub(crate) fn begin_turn(&mut self) {
        self.turn += 1;
    }

    /// Seal a draft: bump the version after a successful invariant check
    pub(crate) fn commit(&mut self) -> Result<()> {
        self.check_invariants()?;
        self.version += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn record(&mut self, event: AuditEvent) {
        self.audit.push(AuditRecord {
            turn: self.turn,
            timestamp: Utc::now(),
            event,
        });
    }

    pub fn audit(&self) -> &[AuditRecord] {
        &self.audit
    }

    // -- messages -----------------------------------------------------------

    pub fn push_message(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(Message {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Last `window` messages rendered as "Role: content" lines
    pub fn conversation_context(&self, window: usize) -> String {
        let start = self.messages.len().saturating_sub(window);
        self.messages[start..]
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                format!("{}: {}", role, m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All user messages joined, for rule-based relevance checks
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    // -- phase --------------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move the phase forward; moving backwards is an invariant violation
    pub(crate) fn advance_phase(&mut self, to: Phase) -> Result<()> {
        if to < self.phase {
            return Err(IntakeError::InvariantViolation(format!(
                "phase cannot move from {} back to {}",
                self.phase, to
            )));
        }
        if to != self.phase {
            let from = self.phase;
            self.phase = to;
            self.record(AuditEvent::PhaseChanged { from, to });
        }
        Ok(())
    }

    pub fn should_transition(&self) -> bool {
        self.should_transition
    }

    pub fn transition_reason(&self) -> Option<&TransitionReason> {
        self.transition_reason.as_ref()
    }

    pub(crate) fn mark_transition(&mut self, reason: TransitionReason) {
        self.should_transition = true;
        self.transition_reason = Some(reason);
    }

    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    pub(crate) fn set_report(&mut self, report: Report) {
        self.report = Some(report);
    }

    // -- modules ------------------------------------------------------------

    pub fn active_module(&self) -> Option<&str> {
        self.active_module.as_deref()
    }

    pub fn completed_modules(&self) -> &BTreeSet<String> {
        &self.completed_modules
    }

    pub fn skipped_modules(&self) -> &BTreeSet<String> {
        &self.skipped_modules
    }

    pub fn queued_modules(&self) -> impl Iterator<Item = &String> {
        self.module_queue.iter()
    }

    /// Completed or skipped; never becomes active again
    pub fn is_module_settled(&self, module: &str) -> bool {
        self.completed_modules.contains(module) || self.skipped_modules.contains(module)
    }

    /// Activate `module`, or queue it behind the active one
    pub(crate) fn request_module(&mut self, module: &str) -> ModuleActivation {
        if self.is_module_settled(module)
            || self.active_module.as_deref() == Some(module)
            || self.module_queue.iter().any(|m| m == module)
        {
            return ModuleActivation::Ignored;
        }
        if self.active_module.is_none() {
            self.active_module = Some(module.to_string());
            self.record(AuditEvent::ModuleActivated {
                module: module.to_string(),
            });
            ModuleActivation::Activated
        } else {
            self.module_queue.push_back(module.to_string());
            self.record(AuditEvent::ModuleQueued {
                module: module.to_string(),
            });
            ModuleActivation::Queued
        }
    }

    /// Mark the active module completed and clear it
    pub(crate) fn complete_active_module(&mut self) -> Option<String> {
        let module = self.active_module.take()?;
        self.completed_modules.insert(module.clone());
        self.record(AuditEvent::ModuleCompleted {
            module: module.clone(),
        });
        Some(module)
    }

    /// Activate the first queued module that is still open
    pub(crate) fn activate_next_queued(&mut self) -> Option<String> {
        if self.active_module.is_some() {
            return None;
        }
        while let Some(next) = self.module_queue.pop_front() {
            if self.is_module_settled(&next) {
                continue;
            }
            self.active_module = Some(next.clone());
            self.record(AuditEvent::ModuleActivated {
                module: next.clone(),
            });
            return Some(next);
        }
        None
    }

    /// Skip a module that was never activated; returns false otherwise
    pub(crate) fn skip_module(&mut self, module: &str, reason: impl Into<String>) -> bool {
        if self.is_module_settled(module) || self.active_module.as_deref() == Some(module) {
            return false;
        }
        self.module_queue.retain(|m| m != module);
        self.skipped_modules.insert(module.to_string());
        self.record(AuditEvent::ModuleSkipped {
            module: module.to_string(),
            reason: reason.into(),
        });
        true
    }

    // -- questions ----------------------------------------------------------

    pub fn asked_questions(&self) -> &[String] {
        &self.asked_questions
    }

    pub fn skipped_questions(&self) -> &BTreeSet<String> {
        &self.skipped_questions
    }

    pub fn has_asked(&self, question: &str) -> bool {
        self.asked_questions.iter().any(|q| q == question)
    }

    /// Neither asked nor skipped
    pub fn is_question_open(&self, question: &str) -> bool {
        !self.has_asked(question) && !self.skipped_questions.contains(question)
    }

    /// Record that a question is being asked; asking twice is refused
    pub(crate) fn mark_asked(&mut self, question: &str) -> Result<()> {
        if !self.is_question_open(question) {
            return Err(IntakeError::InvariantViolation(format!(
                "question '{}' was already asked or skipped",
                question
            )));
        }
        self.asked_questions.push(question.to_string());
        self.pending_question = Some(question.to_string());
        self.record(AuditEvent::QuestionAsked {
            question: question.to_string(),
        });
        Ok(())
    }

    /// Skip an open question; returns false if it was already asked or skipped
    pub(crate) fn skip_question(&mut self, question: &str, reason: impl Into<String>) -> bool {
        if !self.is_question_open(question) {
            return false;
        }
        self.skipped_questions.insert(question.to_string());
        self.record(AuditEvent::QuestionSkipped {
            question: question.to_string(),
            reason: reason.into(),
        });
        true
    }

    pub fn pending_question(&self) -> Option<&str> {
        self.pending_question.as_deref()
    }

    pub(crate) fn take_pending_question(&mut self) -> Option<String> {
        self.pending_question.take()
    }

    /// Keep an asked question pending for one follow-up; once per question
    pub(crate) fn request_clarification(&mut self, question: &str) -> bool {
        if !self.has_asked(question) || !self.clarified_questions.insert(question.to_string()) {
            return false;
        }
        self.pending_question = Some(question.to_string());
        true
    }

    // -- tags ---------------------------------------------------------------

    pub fn assigned_tags(&self) -> &BTreeSet<String> {
        &self.assigned_tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.assigned_tags.contains(tag)
    }

    pub fn tag_confidence(&self) -> &BTreeMap<String, Confidence> {
        &self.tag_confidence
    }

    pub fn tag_provenance(&self) -> &BTreeMap<String, Provenance> {
        &self.tag_provenance
    }

    /// Assign a tag with its confidence and provenance together
    ///
    /// Returns false when the tag is already present or the conversation has
    /// completed; an existing tag is never re-added or overwritten.
    pub(crate) fn assign_tag(
        &mut self,
        tag: &str,
        confidence: Confidence,
        provenance: Provenance,
    ) -> bool {
        if self.phase == Phase::Completed || self.assigned_tags.contains(tag) {
            return false;
        }
        let method = provenance.method;
        self.assigned_tags.insert(tag.to_string());
        self.tag_confidence.insert(tag.to_string(), confidence);
        self.tag_provenance.insert(tag.to_string(), provenance);
        self.pending_facts.retain(|f| f.tag != tag);
        self.record(AuditEvent::TagAssigned {
            tag: tag.to_string(),
            confidence,
            method,
        });
        true
    }

    /// Remove a tag from all three tag maps at once
    pub(crate) fn remove_tag(&mut self, tag: &str) -> bool {
        if self.phase == Phase::Completed || !self.assigned_tags.remove(tag) {
            return false;
        }
        self.tag_confidence.remove(tag);
        self.tag_provenance.remove(tag);
        self.record(AuditEvent::TagRemoved {
            tag: tag.to_string(),
        });
        true
    }

    pub fn pending_facts(&self) -> &[PendingFact] {
        &self.pending_facts
    }

    /// Queue an unverified fact; ignored if already assigned or queued
    pub(crate) fn queue_fact(&mut self, fact: PendingFact) -> bool {
        if self.assigned_tags.contains(&fact.tag)
            || self.pending_facts.iter().any(|f| f.tag == fact.tag)
        {
            return false;
        }
        self.record(AuditEvent::FactQueued {
            tag: fact.tag.clone(),
            confidence: fact.confidence,
        });
        self.pending_facts.push(fact);
        true
    }

    /// Drop a queued fact, e.g. after the client denied it
    pub(crate) fn discard_fact(&mut self, tag: &str) {
        self.pending_facts.retain(|f| f.tag != tag);
    }

    pub fn corrections(&self) -> &[CorrectionRecord] {
        &self.corrections
    }

    pub(crate) fn record_correction(&mut self, record: CorrectionRecord) {
        self.record(AuditEvent::CorrectionApplied {
            removed: record.tags_removed.clone(),
            added: record.tags_added.clone(),
        });
        self.corrections.push(record);
    }

    pub(crate) fn record_sensitive_input(&mut self, kinds: Vec<String>) {
        self.record(AuditEvent::SensitiveInputRejected { kinds });
    }

    // -- invariants ---------------------------------------------------------

    /// Check every cross-field invariant of the aggregate
    pub fn check_invariants(&self) -> Result<()> {
        let conf: BTreeSet<&String> = self.tag_confidence.keys().collect();
        let prov: BTreeSet<&String> = self.tag_provenance.keys().collect();
        let tags: BTreeSet<&String> = self.assigned_tags.iter().collect();
        if tags != conf || tags != prov {
            return Err(IntakeError::InvariantViolation(
                "assigned tags, confidence and provenance keys differ".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for q in &self.asked_questions {
            if !seen.insert(q) {
                return Err(IntakeError::InvariantViolation(format!(
                    "question '{}' asked more than once",
                    q
                )));
            }
            if self.skipped_questions.contains(q) {
                return Err(IntakeError::InvariantViolation(format!(
                    "question '{}' is both asked and skipped",
                    q
                )));
            }
        }

        if let Some(active) = &self.active_module {
            if self.is_module_settled(active) {
                return Err(IntakeError::InvariantViolation(format!(
                    "module '{}' is active but already settled",
                    active
                )));
            }
        }
        if let Some(m) = self.completed_modules.intersection(&self.skipped_modules).next() {
            return Err(IntakeError::InvariantViolation(format!(
                "module '{}' is both completed and skipped",
                m
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance(method: TagMethod) -> Provenance {
        Provenance {
            source_question: Some("q1".to_string()),
            utterance: "yes".to_string(),
            method,
            reasoning: "affirmed".to_string(),
            timestamp: Utc::now(),
            turn: 1,
        }
    }

    #[test]
    fn test_new_state() {
        let state = ConversationState::new();
        assert_eq!(state.phase(), Phase::Intake);
        assert_eq!(state.message_count(), 0);
        assert!(state.assigned_tags().is_empty());
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_assign_and_remove_keep_maps_in_lockstep() {
        let mut state = ConversationState::new();
        assert!(state.assign_tag("t1", Confidence::High, provenance(TagMethod::KeywordAffirmation)));
        assert!(!state.assign_tag("t1", Confidence::Low, provenance(TagMethod::BroadExtraction)));
        assert_eq!(state.tag_confidence()["t1"], Confidence::High);
        assert!(state.check_invariants().is_ok());

        assert!(state.remove_tag("t1"));
        assert!(!state.remove_tag("t1"));
        assert!(state.tag_confidence().is_empty());
        assert!(state.tag_provenance().is_empty());
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_question_asked_once() {
        let mut state = ConversationState::new();
        state.mark_asked("q1").unwrap();
        assert!(matches!(state.mark_asked("q1"), Err(IntakeError::InvariantViolation(_))));
        assert!(!state.skip_question("q1", "late"));
        assert!(state.skip_question("q2", "irrelevant"));
        assert!(state.mark_asked("q2").is_err());
        assert_eq!(state.pending_question(), Some("q1"));
    }

    #[test]
    fn test_clarification_only_once() {
        let mut state = ConversationState::new();
        assert!(!state.request_clarification("q1"));
        state.mark_asked("q1").unwrap();
        state.take_pending_question();
        assert!(state.request_clarification("q1"));
        assert_eq!(state.pending_question(), Some("q1"));
        state.take_pending_question();
        assert!(!state.request_clarification("q1"));
        assert_eq!(state.pending_question(), None);
    }

    #[test]
    fn test_phase_is_forward_only() {
        let mut state = ConversationState::new();
        state.advance_phase(Phase::FormsAnalysis).unwrap();
        state.advance_phase(Phase::Completed).unwrap();
        assert!(state.advance_phase(Phase::Intake).is_err());
        assert_eq!(state.phase(), Phase::Completed);
    }

    #[test]
    fn test_no_tag_mutation_after_completion() {
        let mut state = ConversationState::new();
        state.assign_tag("t1", Confidence::High, provenance(TagMethod::KeywordAffirmation));
        state.advance_phase(Phase::Completed).unwrap();
        assert!(!state.assign_tag("t2", Confidence::High, provenance(TagMethod::Correction)));
        assert!(!state.remove_tag("t1"));
        assert_eq!(state.assigned_tags().len(), 1);
    }

    #[test]
    fn test_module_queue_is_fifo_and_never_reactivates() {
        let mut state = ConversationState::new();
        assert_eq!(state.request_module("a"), ModuleActivation::Activated);
        assert_eq!(state.request_module("b"), ModuleActivation::Queued);
        assert_eq!(state.request_module("c"), ModuleActivation::Queued);
        assert_eq!(state.request_module("b"), ModuleActivation::Ignored);

        assert_eq!(state.complete_active_module().as_deref(), Some("a"));
        assert!(state.skip_module("b", "denied"));
        assert_eq!(state.activate_next_queued().as_deref(), Some("c"));
        assert_eq!(state.request_module("a"), ModuleActivation::Ignored);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_conversation_context_window() {
        let mut state = ConversationState::new();
        for i in 0..12 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            state.push_message(role, format!("m{}", i));
        }
        let ctx = state.conversation_context(3);
        assert_eq!(ctx, "Assistant: m9\nUser: m10\nAssistant: m11");
    }

    #[test]
    fn test_pending_fact_promoted_on_assign() {
        let mut state = ConversationState::new();
        assert!(state.queue_fact(PendingFact {
            tag: "t1".to_string(),
            confidence: Confidence::Medium,
            explicit: false,
            evidence: "maybe".to_string(),
            turn: 1,
        }));
        assert_eq!(state.pending_facts().len(), 1);
        state.assign_tag("t1", Confidence::High, provenance(TagMethod::KeywordAffirmation));
        assert!(state.pending_facts().is_empty());
    }

    #[test]
    fn test_commit_bumps_version() {
        let mut state = ConversationState::new();
        state.commit().unwrap();
        state.commit().unwrap();
        assert_eq!(state.version(), 2);
    }

    #[test]
    fn test_audit_serializes_with_type_tag() {
        let mut state = ConversationState::new();
        state.request_module("residency_elections");
        let json = serde_json::to_value(&state.audit()[0]).unwrap();
        assert_eq!(json["event"]["type"], "ModuleActivated");
        assert_eq!(json["event"]["data"]["module"], "residency_elections");
    }
}
