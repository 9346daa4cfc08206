//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use taxintake_core::{
    Completion, CompletionError, CompletionService, CompletionSettings, EngineConfig,
    FeatureFlags, KnowledgeBase,
};

pub const INTAKE_JSON: &str = include_str!("../../../../knowledge_base/intake.json");
pub const TAGS_JSON: &str = include_str!("../../../../knowledge_base/tags.json");

/// The sample knowledge base shipped with the repository
pub fn sample_kb() -> Arc<KnowledgeBase> {
    Arc::new(KnowledgeBase::from_json_str(INTAKE_JSON, TAGS_JSON).unwrap())
}

/// Millisecond backoff so failing services do not slow the suite down
pub fn fast_completion() -> CompletionSettings {
    CompletionSettings {
        max_retries: 2,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        timeout_secs: 2,
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_completion(fast_completion())
}

pub fn rules_only() -> FeatureFlags {
    FeatureFlags::offline()
}

/// Replies chosen by the first rule whose needle occurs in the user prompt
#[derive(Debug, Default)]
pub struct ScriptedCompletion {
    rules: Vec<(&'static str, String)>,
    calls: AtomicU32,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, needle: &'static str, reply: impl Into<String>) -> Self {
        self.rules.push((needle, reply.into()));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, _system: &str, user: &str) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rules
            .iter()
            .find(|(needle, _)| user.contains(needle))
            .map(|(_, reply)| Completion::new("scripted", reply.clone()))
            .ok_or_else(|| CompletionError::Provider("no scripted reply".to_string()))
    }
}

/// Every call fails as a provider error, so each one is retried
#[derive(Debug, Default)]
pub struct FailingCompletion {
    calls: AtomicU32,
}

impl FailingCompletion {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionService for FailingCompletion {
    async fn complete(&self, _system: &str, _user: &str) -> Result<Completion, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CompletionError::Provider("503 Service Unavailable".to_string()))
    }
}

// Needles that identify each prompt kind
pub const TARGETED: &str = "Candidate tags:";
pub const BROAD: &str = "Tag catalog:";
pub const CORRECTION: &str = "Correction:";
pub const RANKING: &str = "Candidate questions:";
pub const NARRATIVE: &str = "Forms already identified:";
