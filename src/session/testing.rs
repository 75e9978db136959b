//! In-memory session collaborator used by unit tests.

use super::history::{ExecutionEvent, Movement, MovementStatus};
use super::{Session, SessionEngine, SessionEvent, SessionInfo};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub struct FakeSession {
    id: String,
    created_at: DateTime<Utc>,
    history: Mutex<Vec<Movement>>,
    executing: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    pub prompts: Mutex<Vec<String>>,
    pub cancelled: AtomicBool,
    pub approvals: Mutex<Vec<bool>>,
}

impl FakeSession {
    pub fn new(id: &str) -> Self {
        Self::with_history(id, Vec::new())
    }

    pub fn with_history(id: &str, history: Vec<Movement>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            id: id.to_string(),
            created_at: Utc::now(),
            history: Mutex::new(history),
            executing: AtomicBool::new(false),
            events,
            prompts: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            approvals: Mutex::new(Vec::new()),
        }
    }

    pub fn set_executing(&self, executing: bool) {
        self.executing.store(executing, Ordering::SeqCst);
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn push_history(&self, movement: Movement) {
        self.history.lock().unwrap().push(movement);
    }
}

#[async_trait]
impl Session for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            working_dir: "/fake".to_string(),
            created_at: self.created_at,
            movement_count: self.history.lock().unwrap().len(),
        }
    }

    fn history(&self) -> Vec<Movement> {
        self.history.lock().unwrap().clone()
    }

    fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn execute(&self, prompt: String) -> Result<(), AppError> {
        if self.is_executing() {
            return Err(AppError::SessionBusy(self.id.clone()));
        }
        self.prompts.lock().unwrap().push(prompt.clone());
        self.set_executing(true);
        self.emit(SessionEvent::Execution(ExecutionEvent::movement_start(prompt)));
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    async fn respond_to_approval(&self, approved: bool) -> Result<(), AppError> {
        self.approvals.lock().unwrap().push(approved);
        Ok(())
    }
}

/// Engine whose "disk" is a map of session id -> stored movements.
#[derive(Default)]
pub struct FakeEngine {
    pub created: AtomicUsize,
    pub resumed: AtomicUsize,
    disk: Mutex<HashMap<String, Vec<Movement>>>,
    sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_history(&self, session_id: &str, movements: Vec<Movement>) {
        self.disk.lock().unwrap().insert(session_id.to_string(), movements);
    }

    pub fn session(&self, session_id: &str) -> Arc<FakeSession> {
        self.sessions.lock().unwrap()[session_id].clone()
    }
}

impl SessionEngine for FakeEngine {
    fn create(&self, _working_dir: &Path) -> Result<Arc<dyn Session>, AppError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(FakeSession::new(&format!("session-{}", n)));
        self.sessions.lock().unwrap().insert(session.id.clone(), session.clone());
        Ok(session)
    }

    fn resume_from_history(&self, _working_dir: &Path, session_id: &str) -> Result<Arc<dyn Session>, AppError> {
        let history = self.disk.lock().unwrap().get(session_id).cloned().ok_or_else(|| {
            AppError::RehydrationFailed {
                session_id: session_id.to_string(),
                reason: "no history on disk".to_string(),
            }
        })?;
        self.resumed.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(FakeSession::with_history(session_id, history));
        self.sessions.lock().unwrap().insert(session_id.to_string(), session.clone());
        Ok(session)
    }
}

pub fn completed_movement(prompt: &str, outputs: &[&str]) -> Movement {
    let mut events = vec![ExecutionEvent::movement_start(prompt)];
    events.extend(outputs.iter().map(|o| ExecutionEvent::output(*o)));
    Movement {
        id: uuid::Uuid::new_v4().to_string(),
        prompt: prompt.to_string(),
        events,
        status: MovementStatus::Completed,
        error: None,
        started_at: Utc::now(),
        completed_at: Utc::now(),
    }
}
