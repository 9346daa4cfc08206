//! E2E Test: knowledge base loading and validation

mod common;

use common::*;
use taxintake_core::kb::{RawIntake, RawTags, INTAKE_FILE, TAGS_FILE};
use taxintake_core::{IntakeError, KnowledgeBase, KnowledgeBaseError};

#[tokio::test]
async fn e2e_loads_sample_directory() {
    let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/../../knowledge_base");
    let kb = KnowledgeBase::load_dir(dir).await.unwrap();

    let stats = kb.stats();
    assert_eq!(stats.gating_questions, 9);
    assert_eq!(stats.modules, 9);
    assert_eq!(stats.jurisdictions, 2);
    assert!(kb.warnings().is_empty(), "{:?}", kb.warnings());

    let reachable = kb.reachable_tags("equity_check");
    assert!(reachable.contains("rsu_income"));
    assert!(reachable.contains("espp_participant"));
    assert!(!reachable.contains("fbar_required"));
}

#[tokio::test]
async fn e2e_dangling_reference_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let broken = INTAKE_JSON.replace("Add tag `rsu_income`", "Add tag `rsu_incme`");
    tokio::fs::write(dir.path().join(INTAKE_FILE), broken).await.unwrap();
    tokio::fs::write(dir.path().join(TAGS_FILE), TAGS_JSON).await.unwrap();

    let err = KnowledgeBase::load_dir(dir.path()).await.unwrap_err();
    assert!(matches!(
        err,
        IntakeError::KnowledgeBase(KnowledgeBaseError::DanglingTag { ref tag, .. }) if tag == "rsu_incme"
    ));
}

#[tokio::test]
async fn e2e_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = KnowledgeBase::load_dir(dir.path()).await.unwrap_err();
    assert!(matches!(err, IntakeError::Io(_)));
}

#[test]
fn e2e_validation_collects_every_error() {
    let intake = INTAKE_JSON
        .replace("Go to Module I", "Go to Module Z")
        .replace("\"id\": \"eq_espp\"", "\"id\": \"eq_rsu\"");
    let intake: RawIntake = serde_json::from_str(&intake).unwrap();
    let tags: RawTags = serde_json::from_str(TAGS_JSON).unwrap();

    let report = KnowledgeBase::validate(&intake, &tags);
    assert!(!report.is_valid());
    assert!(report
        .errors
        .iter()
        .any(|e| matches!(e, KnowledgeBaseError::DanglingModule { module, .. } if module == "Z")));
    assert!(report
        .errors
        .iter()
        .any(|e| matches!(e, KnowledgeBaseError::DuplicateQuestion { id, .. } if id == "eq_rsu")));
    // reporting_cleanup is now unreachable and delinquent tags unreferenced
    assert!(!report.warnings.is_empty());
    assert!(!report.passes(true));
}
