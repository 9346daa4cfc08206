//! Session management
//!
//! Sessions are independent; each owns one [`ConversationState`] behind an
//! async mutex so turns on the same session run one at a time while other
//! sessions proceed in parallel. The map itself is only locked long enough
//! to look up or insert a handle.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::{IntakeEngine, TurnInput, TurnResult};
use crate::state::{Confidence, ConversationState, Phase};
use crate::{IntakeError, Result};

/// Unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session:{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only overview of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub phase: Phase,
    pub assigned_tags: Vec<String>,
    pub tag_confidence: BTreeMap<String, Confidence>,
    pub active_module: Option<String>,
    pub completed_modules: Vec<String>,
    pub skipped_modules: Vec<String>,
    pub message_count: usize,
    pub questions_asked: usize,
    pub questions_skipped: usize,
    /// Facts heard but not yet confirmed
    pub pending_facts: Vec<String>,
    pub corrections: usize,
    pub transition_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    fn from_state(session_id: SessionId, state: &ConversationState) -> Self {
        Self {
            session_id,
            phase: state.phase(),
            assigned_tags: state.assigned_tags().iter().cloned().collect(),
            tag_confidence: state.tag_confidence().clone(),
            active_module: state.active_module().map(str::to_string),
            completed_modules: state.completed_modules().iter().cloned().collect(),
            skipped_modules: state.skipped_modules().iter().cloned().collect(),
            message_count: state.message_count(),
            questions_asked: state.asked_questions().len(),
            questions_skipped: state.skipped_questions().len(),
            pending_facts: state.pending_facts().iter().map(|f| f.tag.clone()).collect(),
            corrections: state.corrections().len(),
            transition_reason: state.transition_reason().map(|r| r.to_string()),
            version: state.version(),
            created_at: state.created_at(),
            updated_at: state.updated_at(),
        }
    }
}

type SessionHandle = Arc<Mutex<ConversationState>>;

/// Owns every live session and serialises turns per session
#[derive(Debug)]
pub struct SessionManager {
    engine: Arc<IntakeEngine>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl SessionManager {
    pub fn new(engine: Arc<IntakeEngine>) -> Self {
        Self {
            engine,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<IntakeEngine> {
        &self.engine
    }

    fn handle(&self, id: &SessionId) -> Result<SessionHandle> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| IntakeError::SessionNotFound(id.to_string()))
    }

    /// Open a session (or reuse `session_id` if it exists) and run the first turn
    pub async fn start_turn(
        &self,
        session_id: Option<SessionId>,
        initial_message: &str,
    ) -> Result<(SessionId, TurnResult)> {
        let id = session_id.unwrap_or_default();
        let handle = {
            let mut sessions = self.sessions.write();
            sessions
                .entry(id.clone())
                .or_insert_with(|| {
                    tracing::info!("Session created: {}", id);
                    Arc::new(Mutex::new(ConversationState::new()))
                })
                .clone()
        };
        let result = self
            .run(&id, &handle, TurnInput::Message(initial_message.to_string()))
            .await;
        Ok((id, result))
    }

    pub async fn continue_turn(&self, session_id: &SessionId, message: &str) -> Result<TurnResult> {
        let handle = self.handle(session_id)?;
        Ok(self
            .run(session_id, &handle, TurnInput::Message(message.to_string()))
            .await)
    }

    /// Leave intake now; declined while no tag is assigned
    pub async fn force_transition(&self, session_id: &SessionId) -> Result<TurnResult> {
        let handle = self.handle(session_id)?;
        Ok(self.run(session_id, &handle, TurnInput::ForceTransition).await)
    }

    pub async fn get_summary(&self, session_id: &SessionId) -> Result<SessionSummary> {
        let handle = self.handle(session_id)?;
        let state = handle.lock().await;
        Ok(SessionSummary::from_state(session_id.clone(), &state))
    }

    /// Full state clone for audit
    pub async fn get_state(&self, session_id: &SessionId) -> Result<ConversationState> {
        let handle = self.handle(session_id)?;
        let state = handle.lock().await;
        Ok(state.clone())
    }

    pub fn end_session(&self, session_id: &SessionId) -> Result<()> {
        self.sessions
            .write()
            .remove(session_id)
            .map(|_| tracing::info!("Session ended: {}", session_id))
            .ok_or_else(|| IntakeError::SessionNotFound(session_id.to_string()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Run one turn under the session lock; commit by assignment
    async fn run(&self, id: &SessionId, handle: &SessionHandle, input: TurnInput) -> TurnResult {
        let mut state = handle.lock().await;
        match self.engine.turn(&state, input).await {
            Ok((next, result)) => {
                if result.transitioned {
                    tracing::info!(
                        "Session {} completed with {} tags",
                        id,
                        next.assigned_tags().len()
                    );
                }
                *state = next;
                result
            }
            Err(e) => {
                tracing::warn!("Turn failed for session {}; state unchanged: {}", id, e);
                TurnResult::retry(&state)
            }
        }
    }
}
