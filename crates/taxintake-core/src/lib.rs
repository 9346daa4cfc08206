//! TaxIntake Core - Workflow engine for cross-border tax intake consultations
//!
//! The engine interviews a client about their U.S./Canada tax situation,
//! assigns structured tags to the facts it hears, and once it has enough
//! evidence produces a deduplicated forms and compliance report.
//!
//! # Architecture
//!
//! - **Knowledge Base** (`kb`): gating questions, modules and tag definitions,
//!   resolved once into an immutable graph
//! - **Conversation State** (`state`): versioned per-session aggregate with an
//!   append-only audit log
//! - **Question Selector** (`selector`) and **Module Router** (`router`)
//! - **Fact Extractor** (`extractor`) and **Correction Handling** (`correction`)
//! - **Phase Controller** (`phase`) and **Forms Synthesizer** (`synthesizer`)
//! - **Privacy guard** (`privacy`): identifiers are redacted before storage
//! - **Turn engine** (`engine`) and **Session manager** (`session`)
//!
//! Anything that needs natural-language judgement goes through the
//! [`CompletionService`] trait and always has a rule-based fallback.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use taxintake_core::{EngineConfig, IntakeEngine, KnowledgeBase, SessionManager};
//!
//! # #[tokio::main]
//! # async fn main() -> taxintake_core::Result<()> {
//! let intake = r#"{
//!     "gating_questions": { "title": "Gating", "questions": [
//!         { "id": "g1", "question": "Do you live in Canada?", "action": "Add tag `lives_in_canada`" }
//!     ] },
//!     "modules": {}
//! }"#;
//! let tags = r#"{ "tag_definitions": {
//!     "lives_in_canada": { "id": "lives_in_canada", "forms": { "ca": [ { "form": "T1 General", "note": "" } ] } }
//! } }"#;
//!
//! let kb = Arc::new(KnowledgeBase::from_json_str(intake, tags)?);
//! let engine = IntakeEngine::offline(kb, EngineConfig::default());
//! let sessions = SessionManager::new(Arc::new(engine));
//!
//! let (id, first) = sessions.start_turn(None, "Hello").await?;
//! assert_eq!(first.assistant_text, "Do you live in Canada?");
//!
//! let last = sessions.continue_turn(&id, "Yes").await?;
//! assert!(last.transitioned);
//! assert_eq!(last.report.unwrap().required_forms[0].form, "T1 General");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod affirmation;
pub mod completion;
pub mod config;
pub mod correction;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod kb;
pub mod parser;
pub mod phase;
pub mod privacy;
pub mod prompts;
pub mod report;
pub mod router;
pub mod selector;
pub mod session;
pub mod state;
pub mod synthesizer;

pub use affirmation::{Affirmation, AffirmationDetector, KeywordAffirmation};
pub use completion::{
    Completion, CompletionService, CompletionStats, ResilientCompletion, UnavailableCompletion,
};
pub use config::{CompletionSettings, EngineConfig, FeatureFlags, TransitionThresholds};
pub use engine::{IntakeEngine, TurnInput, TurnResult};
pub use error::{CompletionError, IntakeError, KnowledgeBaseError, Result};
pub use kb::{KnowledgeBase, ValidationReport};
pub use privacy::{contains_sensitive_info, redact, SensitiveKind};
pub use report::{Complexity, Priority, Report, RequiredForm};
pub use session::{SessionId, SessionManager, SessionSummary};
pub use state::{Confidence, ConversationState, Phase};
pub use synthesizer::synthesize;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
