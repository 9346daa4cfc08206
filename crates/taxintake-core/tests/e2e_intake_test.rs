//! E2E Test: intake conversations
//!
//! Drives whole sessions through the public API with scripted and failing
//! completion services.

mod common;

use common::*;
use std::sync::Arc;
use taxintake_core::privacy::SENSITIVE_INFO_WARNING;
use taxintake_core::state::{AuditEvent, TagMethod, TransitionReason};
use taxintake_core::{
    synthesize, EngineConfig, FeatureFlags, IntakeEngine, IntakeError, Phase, SessionId,
    SessionManager,
};

fn offline_sessions() -> SessionManager {
    let engine = IntakeEngine::offline(sample_kb(), EngineConfig::default());
    SessionManager::new(Arc::new(engine))
}

fn sessions_with(service: Arc<dyn taxintake_core::CompletionService>, config: EngineConfig) -> SessionManager {
    let engine = IntakeEngine::new(sample_kb(), config, service);
    SessionManager::new(Arc::new(engine))
}

/// Gating "Yes" opens residency; its tags only come from its own questions
#[tokio::test]
async fn e2e_gating_yes_activates_residency_module() {
    let sessions = offline_sessions();

    let (id, first) = sessions.start_turn(None, "Hi, I need some help").await.unwrap();
    assert_eq!(
        first.assistant_text,
        "Are you a U.S. citizen or U.S. green-card holder?"
    );

    let second = sessions.continue_turn(&id, "Yes").await.unwrap();
    let summary = sessions.get_summary(&id).await.unwrap();
    assert_eq!(summary.active_module.as_deref(), Some("residency_elections"));
    assert_eq!(second.assistant_text, "Do you currently live in Canada?");
    assert!(second.assigned_tags.is_empty());

    let third = sessions.continue_turn(&id, "Yes, in Ottawa").await.unwrap();
    assert_eq!(third.assigned_tags, vec!["us_person_in_canada"]);

    let state = sessions.get_state(&id).await.unwrap();
    let prov = &state.tag_provenance()["us_person_in_canada"];
    assert_eq!(prov.source_question.as_deref(), Some("res_lives_in_canada"));
    assert_eq!(prov.method, TagMethod::KeywordAffirmation);
}

/// A rich opening statement yields several tags before any question
#[tokio::test]
async fn e2e_broad_pass_on_first_message() {
    let service = Arc::new(ScriptedCompletion::new().on(
        BROAD,
        r#"```json
        {"facts": [
            {"tag": "us_person_worldwide_filing", "confidence": "high", "explicit": true, "evidence": "I'm a US citizen"},
            {"tag": "rsu_income", "confidence": "high", "explicit": true, "evidence": "RSU from a US employer"},
            {"tag": "us_person_in_canada", "confidence": "high", "explicit": true, "evidence": "living in Canada"},
            {"tag": "remote_foreign_employer", "confidence": "medium", "explicit": false, "evidence": "US employer"}
        ]}
        ```"#,
    ));
    let config = fast_config().with_features(FeatureFlags {
        delegated_skipping: false,
        narrative_synthesis: false,
        ..FeatureFlags::default()
    });
    let sessions = sessions_with(service, config);

    let (id, result) = sessions
        .start_turn(
            None,
            "I'm a US citizen and I received RSU from a US employer while living in Canada",
        )
        .await
        .unwrap();

    assert!(result.assigned_tags.len() >= 2);
    let state = sessions.get_state(&id).await.unwrap();
    for tag in state.assigned_tags() {
        let prov = &state.tag_provenance()[tag];
        assert_eq!(prov.method, TagMethod::BroadExtraction);
        assert_eq!(prov.source_question, None);
    }
    let pending: Vec<_> = state.pending_facts().iter().map(|f| f.tag.as_str()).collect();
    assert_eq!(pending, vec!["remote_foreign_employer"]);
    assert_eq!(state.asked_questions().len(), 1);
}

#[tokio::test]
async fn e2e_shared_form_listed_once() {
    let kb = sample_kb();
    let tags: Vec<String> = vec!["rsu_income".into(), "us_person_in_canada".into()];
    let report = synthesize(&tags, &kb);

    let form_1040: Vec<_> = report
        .required_forms
        .iter()
        .filter(|f| f.form == "Form 1040" && f.jurisdiction == "us")
        .collect();
    assert_eq!(form_1040.len(), 1);
    assert!(form_1040[0].rationale.contains("rsu_income"));
    assert!(form_1040[0].rationale.contains("us_person_in_canada"));

    let mut keys: Vec<_> = report
        .required_forms
        .iter()
        .map(|f| (f.form.clone(), f.jurisdiction.clone()))
        .collect();
    let total = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), total);
}

#[tokio::test]
async fn e2e_force_transition_without_tags_declined() {
    let sessions = offline_sessions();
    let (id, _) = sessions.start_turn(None, "Hello").await.unwrap();

    let result = sessions.force_transition(&id).await.unwrap();
    assert!(!result.transitioned);
    assert!(result.report.is_none());
    assert_eq!(
        result.assistant_text,
        "No tags assigned yet. Please continue the conversation to gather more information."
    );
    assert_eq!(sessions.get_summary(&id).await.unwrap().phase, Phase::Intake);
}

#[tokio::test]
async fn e2e_force_transition_with_tags_produces_report() {
    let sessions = offline_sessions();
    let (id, _) = sessions.start_turn(None, "Hello").await.unwrap();
    sessions.continue_turn(&id, "Yes").await.unwrap();
    sessions.continue_turn(&id, "Yes").await.unwrap();

    let result = sessions.force_transition(&id).await.unwrap();
    assert!(result.transitioned);
    assert_eq!(result.phase, Phase::Completed);
    let report = result.report.unwrap();
    assert!(report.required_forms.iter().any(|f| f.form == "T1 General"));

    // A second force returns the stored report without transitioning again
    let again = sessions.force_transition(&id).await.unwrap();
    assert!(!again.transitioned);
    assert_eq!(again.report, Some(report));

    let after = sessions.continue_turn(&id, "One more thing").await.unwrap();
    assert_eq!(after.phase, Phase::Completed);
    assert!(after.quick_reply_options.is_empty());
    assert_eq!(after.assigned_tags, vec!["us_person_in_canada"]);
}

/// Every reply affirms, every completion call fails: the hard cap still ends intake
#[tokio::test]
async fn e2e_terminates_when_service_always_fails() {
    let service = Arc::new(FailingCompletion::default());
    let mut config = fast_config().with_max_messages(30);
    config.thresholds.min_tags = 1_000;
    let sessions = sessions_with(service.clone(), config);

    let (id, mut result) = sessions.start_turn(None, "Hello").await.unwrap();
    let mut turns = 1;
    while result.phase == Phase::Intake {
        assert!(turns <= 15, "intake did not terminate");
        result = sessions.continue_turn(&id, "Yes").await.unwrap();
        turns += 1;
    }

    assert!(result.transitioned);
    let report = result.report.unwrap();
    assert!(report.fallback);
    assert_eq!(report.estimated_complexity, taxintake_core::Complexity::High);

    let state = sessions.get_state(&id).await.unwrap();
    assert!(matches!(
        state.transition_reason(),
        Some(TransitionReason::HardCap { .. })
    ));
    assert!(!state.assigned_tags().is_empty());
    assert!(service.calls() > 0);
}

/// The closing report is the only message allowed to reach the cap
#[tokio::test]
async fn e2e_hard_cap_closes_before_exceeding_limit() {
    let mut config = EngineConfig::default().with_max_messages(6);
    config.thresholds.min_tags = 1_000;
    let engine = IntakeEngine::offline(sample_kb(), config);
    let sessions = SessionManager::new(Arc::new(engine));

    let (id, mut result) = sessions.start_turn(None, "Hello").await.unwrap();
    let mut counts = vec![sessions.get_state(&id).await.unwrap().message_count()];
    while result.phase == Phase::Intake {
        result = sessions.continue_turn(&id, "Yes").await.unwrap();
        counts.push(sessions.get_state(&id).await.unwrap().message_count());
    }

    assert_eq!(counts, vec![2, 4, 6]);
    let state = sessions.get_state(&id).await.unwrap();
    assert!(state.message_count() <= 7);
    assert_eq!(
        state.transition_reason(),
        Some(&TransitionReason::HardCap { messages: 5 })
    );
}

/// Identifiers never reach the transcript; the same question stays open
#[tokio::test]
async fn e2e_sensitive_identifier_rejected() {
    let service = Arc::new(FailingCompletion::default());
    let sessions = sessions_with(service.clone(), fast_config());

    let (id, _) = sessions.start_turn(None, "Hello").await.unwrap();
    let calls_before = service.calls();
    let result = sessions
        .continue_turn(&id, "Sure, my SIN is 123 456 789 if you need it")
        .await
        .unwrap();

    assert_eq!(result.assistant_text, SENSITIVE_INFO_WARNING);
    assert_eq!(result.phase, Phase::Intake);
    assert_eq!(service.calls(), calls_before);

    let state = sessions.get_state(&id).await.unwrap();
    assert_eq!(state.pending_question(), Some("us_person_check"));
    assert!(state.assigned_tags().is_empty());
    assert!(state
        .messages()
        .iter()
        .all(|m| !m.content.contains("123 456 789")));
    assert!(state
        .audit()
        .iter()
        .any(|r| r.event == AuditEvent::SensitiveInputRejected { kinds: vec!["sin".to_string()] }));
}

/// "Right now" is not a yes; the gating question is confirmed once, then settled
#[tokio::test]
async fn e2e_unclear_gating_answer_confirmed_before_routing() {
    let sessions = offline_sessions();
    let (id, _) = sessions.start_turn(None, "Hello").await.unwrap();

    let unclear = sessions
        .continue_turn(&id, "Right now I live only in Germany")
        .await
        .unwrap();
    assert_eq!(
        unclear.assistant_text,
        "Just to confirm: Are you a U.S. citizen or U.S. green-card holder? A simple yes or no is fine."
    );
    let summary = sessions.get_summary(&id).await.unwrap();
    assert_eq!(summary.active_module, None);

    sessions.continue_turn(&id, "I do not").await.unwrap();
    let state = sessions.get_state(&id).await.unwrap();
    assert!(state.skipped_modules().contains("residency_elections"));
    assert_eq!(state.active_module(), None);
    assert_eq!(state.pending_question(), Some("employment_check"));
}

#[tokio::test]
async fn e2e_exhaustion_when_everything_denied() {
    let sessions = offline_sessions();
    let (id, mut result) = sessions.start_turn(None, "Hello").await.unwrap();
    while result.phase == Phase::Intake {
        result = sessions.continue_turn(&id, "No").await.unwrap();
    }
    let state = sessions.get_state(&id).await.unwrap();
    assert_eq!(state.asked_questions().len(), 9);
    assert_eq!(state.skipped_modules().len(), 9);
    assert_eq!(
        state.transition_reason(),
        Some(&TransitionReason::QuestionsExhausted)
    );
    assert_eq!(result.report.unwrap(), taxintake_core::Report::no_tags());
}

#[tokio::test]
async fn e2e_correction_applied_once() {
    let service = Arc::new(ScriptedCompletion::new().on(
        CORRECTION,
        r#"{"tagsToRemove": ["us_person_in_canada"], "tagsToAdd": ["part_year_resident"],
            "reasoning": "client moved back to the U.S. this year", "confidence": "high"}"#,
    ));
    let config = fast_config().with_features(FeatureFlags {
        correction_handling: true,
        ..rules_only()
    });
    let sessions = sessions_with(service, config);

    let (id, _) = sessions.start_turn(None, "Hello").await.unwrap();
    sessions.continue_turn(&id, "Yes").await.unwrap();
    sessions.continue_turn(&id, "Yes").await.unwrap();

    let correction = "Actually, I don't live in Canada anymore, I moved back this year";
    let first = sessions.continue_turn(&id, correction).await.unwrap();
    assert!(first.assistant_text.starts_with("Thanks for the correction."));
    assert_eq!(first.assigned_tags, vec!["part_year_resident"]);

    let second = sessions.continue_turn(&id, correction).await.unwrap();
    assert_eq!(second.assigned_tags, first.assigned_tags);
    assert!(!second.assistant_text.starts_with("Thanks for the correction."));

    let state = sessions.get_state(&id).await.unwrap();
    assert_eq!(state.corrections().len(), 1);
    assert_eq!(state.corrections()[0].tags_removed, vec!["us_person_in_canada"]);
    assert!(state.skipped_questions().contains("res_moved_this_year"));
    assert!(state.check_invariants().is_ok());
}

#[tokio::test]
async fn e2e_delegated_selection_and_fallback() {
    let ranked = Arc::new(
        ScriptedCompletion::new().on(RANKING, r#"{"question_id": "equity_check"}"#),
    );
    let features = FeatureFlags {
        delegated_selection: true,
        ..rules_only()
    };
    let sessions = sessions_with(ranked, fast_config().with_features(features.clone()));
    let (_, result) = sessions.start_turn(None, "I have RSUs").await.unwrap();
    assert_eq!(
        result.assistant_text,
        "Do you receive stock options, RSUs, or other equity compensation?"
    );

    let hallucinated = Arc::new(
        ScriptedCompletion::new().on(RANKING, r#"{"question_id": "ask_about_crypto"}"#),
    );
    let sessions = sessions_with(hallucinated, fast_config().with_features(features));
    let (_, result) = sessions.start_turn(None, "Hello").await.unwrap();
    assert_eq!(
        result.assistant_text,
        "Are you a U.S. citizen or U.S. green-card holder?"
    );
}

#[tokio::test]
async fn e2e_hallucinated_targeted_tag_rejected() {
    let service = Arc::new(ScriptedCompletion::new().on(
        TARGETED,
        r#"{"tags": [{"tag": "foreign_trust", "confidence": "high", "reasoning": "?"}]}"#,
    ));
    let config = fast_config().with_features(FeatureFlags {
        delegated_tag_assignment: true,
        ..rules_only()
    });
    let sessions = sessions_with(service, config);

    let (id, _) = sessions.start_turn(None, "Hello").await.unwrap();
    sessions.continue_turn(&id, "Yes").await.unwrap();
    let result = sessions.continue_turn(&id, "Yes I live in Montreal").await.unwrap();
    assert!(result.assigned_tags.is_empty());
}

#[tokio::test]
async fn e2e_unknown_session_not_found() {
    let sessions = offline_sessions();
    let ghost = SessionId::from("session:does-not-exist");
    assert!(matches!(
        sessions.continue_turn(&ghost, "Yes").await,
        Err(IntakeError::SessionNotFound(_))
    ));
    assert!(matches!(
        sessions.force_transition(&ghost).await,
        Err(IntakeError::SessionNotFound(_))
    ));
}

/// Concurrent turns on one session are applied one after another
#[tokio::test]
async fn e2e_concurrent_turns_serialized() {
    let sessions = Arc::new(offline_sessions());
    let (id, _) = sessions.start_turn(None, "Hello").await.unwrap();

    let turns = (0..10).map(|i| {
        let sessions = sessions.clone();
        let id = id.clone();
        let reply = if i % 2 == 0 { "Not sure" } else { "Yes" };
        tokio::spawn(async move { sessions.continue_turn(&id, reply).await })
    });
    for outcome in futures::future::join_all(turns).await {
        outcome.unwrap().unwrap();
    }

    let state = sessions.get_state(&id).await.unwrap();
    assert_eq!(state.message_count(), 22);
    assert_eq!(state.version(), 11);
    assert!(state.check_invariants().is_ok());
}

#[tokio::test]
async fn e2e_independent_sessions() {
    let sessions = offline_sessions();
    let (a, _) = sessions.start_turn(None, "Hello").await.unwrap();
    let (b, _) = sessions.start_turn(None, "Hello").await.unwrap();
    assert_ne!(a, b);

    sessions.continue_turn(&a, "Yes").await.unwrap();
    assert_eq!(sessions.get_summary(&a).await.unwrap().message_count, 4);
    assert_eq!(sessions.get_summary(&b).await.unwrap().message_count, 2);
    assert_eq!(sessions.session_count(), 2);
}
