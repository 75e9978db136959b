//! Boundary to the agent/session collaborator plus the in-memory session table.
//!
//! Nothing here inspects conversation content: the subsystem only needs a
//! session's identity, its completed history, its execution flag and its
//! event stream.

pub mod event_log;
pub mod history;
pub mod local;
#[cfg(test)]
pub mod testing;

use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

pub use event_log::ExecutionEventLog;
pub use history::{DisplayLine, ExecutionEvent, Movement};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub movement_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Execution(ExecutionEvent),
    MovementComplete,
    MovementError { error: String },
    SessionUpdate(SessionInfo),
}

#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> &str;
    fn info(&self) -> SessionInfo;
    /// Completed movements only; the turn in progress is not part of history.
    fn history(&self) -> Vec<Movement>;
    fn is_executing(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
    /// Starts executing `prompt`. Returns once the turn has begun.
    async fn execute(&self, prompt: String) -> Result<(), AppError>;
    fn cancel(&self);
    async fn respond_to_approval(&self, approved: bool) -> Result<(), AppError>;
}

pub trait SessionEngine: Send + Sync {
    fn create(&self, working_dir: &Path) -> Result<Arc<dyn Session>, AppError>;
    fn resume_from_history(&self, working_dir: &Path, session_id: &str) -> Result<Arc<dyn Session>, AppError>;
}

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.contains_key(session_id)
    }

    /// Returns false when a session with that id was already resident; the
    /// resident one is kept.
    pub fn insert(&self, session: Arc<dyn Session>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(session.id()) {
            return false;
        }
        sessions.insert(session.id().to_string(), session);
        true
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(session_id)
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }
}
