//! Bundled session engine: runs a configured agent command per prompt and
//! keeps each session's movements in `sessions/<id>.json`.

use super::history::{ExecutionEvent, Movement, MovementStatus};
use super::{Session, SessionEngine, SessionEvent, SessionInfo};
use crate::config::Config;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio as StdProcessStdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex as TokioMutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryDocument {
    session_id: String,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    movements: Vec<Movement>,
}

#[derive(Debug, Clone)]
pub struct LocalSessionEngine {
    history_dir: PathBuf,
    agent_command: Option<String>,
}

impl LocalSessionEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            history_dir: config.session_history_dir(),
            agent_command: config.agent_command.clone(),
        }
    }

    fn history_path(&self, session_id: &str) -> PathBuf {
        self.history_dir.join(format!("{}.json", session_id))
    }
}

/// Session ids name files under the history directory, so only plain
/// slugs are accepted.
fn validate_session_id(session_id: &str) -> Result<(), AppError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidInputArgument(format!("Invalid session id: {:?}", session_id)))
    }
}

impl SessionEngine for LocalSessionEngine {
    #[instrument(skip(self))]
    fn create(&self, working_dir: &Path) -> Result<Arc<dyn Session>, AppError> {
        let session_id = Uuid::new_v4().to_string();
        let document = HistoryDocument {
            session_id: session_id.clone(),
            working_dir: working_dir.to_path_buf(),
            created_at: Utc::now(),
            movements: Vec::new(),
        };
        let session = LocalSession::from_document(document, self.history_path(&session_id), self.agent_command.clone());
        session.inner.save_history()?;
        info!(session_id = %session_id, "Created session");
        Ok(Arc::new(session))
    }

    #[instrument(skip(self))]
    fn resume_from_history(&self, working_dir: &Path, session_id: &str) -> Result<Arc<dyn Session>, AppError> {
        validate_session_id(session_id)?;
        let path = self.history_path(session_id);
        let raw = std::fs::read_to_string(&path).map_err(|e| AppError::RehydrationFailed {
            session_id: session_id.to_string(),
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        let document: HistoryDocument = serde_json::from_str(&raw).map_err(|e| AppError::RehydrationFailed {
            session_id: session_id.to_string(),
            reason: format!("corrupt history: {}", e),
        })?;
        if document.session_id != session_id {
            return Err(AppError::RehydrationFailed {
                session_id: session_id.to_string(),
                reason: format!("history file belongs to session {}", document.session_id),
            });
        }
        if document.working_dir != working_dir {
            warn!(
                session_id,
                recorded = %document.working_dir.display(),
                requested = %working_dir.display(),
                "Rehydrating session recorded under a different working directory"
            );
        }
        debug!(session_id, movements = document.movements.len(), "Rehydrated session from disk");
        Ok(Arc::new(LocalSession::from_document(document, path, self.agent_command.clone())))
    }
}

struct SessionInner {
    id: String,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
    history_path: PathBuf,
    agent_command: Option<String>,
    history: Mutex<Vec<Movement>>,
    executing: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    stdin: TokioMutex<Option<ChildStdin>>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl SessionInner {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            working_dir: self.working_dir.display().to_string(),
            created_at: self.created_at,
            movement_count: self.history.lock().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine: nobody is listening to this session right now.
        let _ = self.events.send(event);
    }

    fn save_history(&self) -> Result<(), AppError> {
        let document = HistoryDocument {
            session_id: self.id.clone(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            movements: self.history.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        };
        if let Some(parent) = self.history_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.history_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_string_pretty(&document)?)?;
        std::fs::rename(&tmp_path, &self.history_path)?;
        Ok(())
    }
}

pub struct LocalSession {
    inner: Arc<SessionInner>,
}

impl LocalSession {
    fn from_document(document: HistoryDocument, history_path: PathBuf, agent_command: Option<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                id: document.session_id,
                working_dir: document.working_dir,
                created_at: document.created_at,
                history_path,
                agent_command,
                history: Mutex::new(document.movements),
                executing: AtomicBool::new(false),
                events,
                stdin: TokioMutex::new(None),
                cancel_tx: Mutex::new(None),
            }),
        }
    }
}

fn agent_invocation(agent_command: &str) -> TokioCommand {
    let mut cmd = if cfg!(windows) {
        let mut cmd = TokioCommand::new("cmd");
        cmd.arg("/C").arg(format!("{} \"%TABDOCK_PROMPT%\"", agent_command));
        cmd
    } else {
        let mut cmd = TokioCommand::new("sh");
        cmd.arg("-c").arg(format!("{} \"$TABDOCK_PROMPT\"", agent_command));
        cmd
    };
    cmd.stdin(StdProcessStdio::piped());
    cmd.stdout(StdProcessStdio::piped());
    cmd.stderr(StdProcessStdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

/// Agents may emit typed events as JSON objects, one per line. Anything
/// else is plain output.
fn parse_agent_line(line: &str) -> ExecutionEvent {
    if line.trim_start().starts_with('{') {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(line) {
            let text = obj.get("text").and_then(Value::as_str).unwrap_or_default();
            match obj.get("type").and_then(Value::as_str) {
                Some("thinking") => return ExecutionEvent::thinking(text),
                Some("output") => return ExecutionEvent::output(text),
                Some("toolUse") => {
                    let tool = obj.get("tool").and_then(Value::as_str).unwrap_or("unknown");
                    let input = obj.get("input").cloned().unwrap_or(Value::Null);
                    return ExecutionEvent::tool_use(tool, input);
                }
                _ => {}
            }
        }
    }
    ExecutionEvent::output(line)
}

#[async_trait]
impl Session for LocalSession {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn info(&self) -> SessionInfo {
        self.inner.info()
    }

    fn history(&self) -> Vec<Movement> {
        self.inner.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn is_executing(&self) -> bool {
        self.inner.executing.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    #[instrument(skip(self, prompt), fields(session_id = %self.inner.id))]
    async fn execute(&self, prompt: String) -> Result<(), AppError> {
        let agent_command = self
            .inner
            .agent_command
            .clone()
            .ok_or_else(|| AppError::ConfigError(anyhow::anyhow!("AGENT_COMMAND is not set")))?;
        if self
            .inner
            .executing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::SessionBusy(self.inner.id.clone()));
        }

        let mut cmd = agent_invocation(&agent_command);
        cmd.env("TABDOCK_PROMPT", &prompt);
        cmd.current_dir(&self.inner.working_dir);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.inner.executing.store(false, Ordering::SeqCst);
                error!(error = %e, "Failed to spawn agent command");
                return Err(AppError::ProcessError(format!("Failed to spawn agent command '{}': {}", agent_command, e)));
            }
        };
        debug!(pid = ?child.id(), "Agent command started");

        *self.inner.stdin.lock().await = child.stdin.take();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *self.inner.cancel_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel_tx);

        let started = ExecutionEvent::movement_start(prompt.clone());
        self.inner.emit(SessionEvent::Execution(started.clone()));

        tokio::spawn(run_turn(self.inner.clone(), prompt, started, child, cancel_rx));
        Ok(())
    }

    fn cancel(&self) {
        let cancel_tx = self.inner.cancel_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        match cancel_tx {
            Some(tx) => {
                let _ = tx.send(());
                info!(session_id = %self.inner.id, "Cancellation requested");
            }
            None => debug!(session_id = %self.inner.id, "Cancel requested with nothing executing"),
        }
    }

    async fn respond_to_approval(&self, approved: bool) -> Result<(), AppError> {
        let mut stdin_guard = self.inner.stdin.lock().await;
        let stdin = stdin_guard
            .as_mut()
            .ok_or_else(|| AppError::ProcessError(format!("Session {} is not executing", self.inner.id)))?;
        let answer: &[u8] = if approved { b"y\n" } else { b"n\n" };
        stdin.write_all(answer).await?;
        stdin.flush().await?;
        Ok(())
    }
}

async fn run_turn(
    inner: Arc<SessionInner>,
    prompt: String,
    started: ExecutionEvent,
    mut child: Child,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ExecutionEvent>();

    let stdout_task = child.stdout.take().map(|stdout| {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let _ = tx.send(parse_agent_line(&line));
            }
        })
    });
    let stderr_task = child.stderr.take().map(|stderr| {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let _ = tx.send(ExecutionEvent::output(format!("[stderr] {}", line)));
            }
        })
    });
    drop(event_tx);

    let started_at = started.timestamp;
    let mut events = vec![started];
    let mut cancel_seen = false;
    let mut cancelled = false;
    loop {
        tokio::select! {
            next = event_rx.recv() => match next {
                Some(event) => {
                    events.push(event.clone());
                    inner.emit(SessionEvent::Execution(event));
                }
                None => break,
            },
            signal = &mut cancel_rx, if !cancel_seen => {
                cancel_seen = true;
                if signal.is_ok() {
                    cancelled = true;
                    if let Err(e) = child.start_kill() {
                        warn!(session_id = %inner.id, error = %e, "Failed to kill agent command");
                    }
                }
            }
        }
    }

    let status = child.wait().await;
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let (movement_status, error) = match status {
        _ if cancelled => (MovementStatus::Cancelled, Some("cancelled".to_string())),
        Ok(status) if status.success() => (MovementStatus::Completed, None),
        Ok(status) => (
            MovementStatus::Failed,
            Some(format!("Agent exited with code {:?}", status.code())),
        ),
        Err(e) => (MovementStatus::Failed, Some(format!("Failed to wait for agent: {}", e))),
    };

    let movement = Movement {
        id: Uuid::new_v4().to_string(),
        prompt,
        events,
        status: movement_status,
        error: error.clone(),
        started_at,
        completed_at: Utc::now(),
    };
    inner.history.lock().unwrap_or_else(|e| e.into_inner()).push(movement);
    if let Err(e) = inner.save_history() {
        error!(session_id = %inner.id, error = %e, "Failed to persist session history");
    }

    *inner.stdin.lock().await = None;
    inner.cancel_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    inner.executing.store(false, Ordering::SeqCst);

    info!(session_id = %inner.id, status = ?movement_status, "Movement finished");
    inner.emit(SessionEvent::SessionUpdate(inner.info()));
    match error {
        None => inner.emit(SessionEvent::MovementComplete),
        Some(error) => inner.emit(SessionEvent::MovementError { error }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::history::ExecutionEventKind;
    use std::time::Duration;
    use tempfile::tempdir;

    fn engine_for(dir: &Path, agent: Option<&str>) -> LocalSessionEngine {
        let mut config = Config::for_working_dir(dir);
        config.agent_command = agent.map(str::to_string);
        LocalSessionEngine::new(&config)
    }

    async fn wait_for_end(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(event @ (SessionEvent::MovementComplete | SessionEvent::MovementError { .. })) => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        })
        .await
        .expect("movement did not finish")
    }

    #[test]
    fn agent_lines_become_typed_events() {
        assert_eq!(parse_agent_line(r#"{"type":"thinking","text":"hmm"}"#).kind, ExecutionEventKind::Thinking);
        let tool = parse_agent_line(r#"{"type":"toolUse","tool":"grep","input":{"q":"x"}}"#);
        assert_eq!(tool.kind, ExecutionEventKind::ToolUse);
        assert_eq!(tool.tool(), "grep");
        let plain = parse_agent_line("{ not json");
        assert_eq!(plain.kind, ExecutionEventKind::Output);
        assert_eq!(plain.text(), "{ not json");
    }

    #[tokio::test]
    async fn execute_records_movement_and_survives_rehydration() {
        let dir = tempdir().unwrap();
        let engine = engine_for(dir.path(), Some("echo"));
        let session = engine.create(dir.path()).unwrap();
        let mut rx = session.subscribe();

        session.execute("hello".to_string()).await.unwrap();
        assert_eq!(wait_for_end(&mut rx).await, SessionEvent::MovementComplete);
        assert!(!session.is_executing());

        let history = session.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].events.iter().any(|e| e.text() == "hello"));

        let resumed = engine.resume_from_history(dir.path(), session.id()).unwrap();
        assert_eq!(resumed.history(), history);
    }

    #[tokio::test]
    async fn execute_without_agent_is_a_config_error() {
        let dir = tempdir().unwrap();
        let engine = engine_for(dir.path(), None);
        let session = engine.create(dir.path()).unwrap();
        let err = session.execute("hi".to_string()).await.unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(!session.is_executing());
    }

    #[tokio::test]
    async fn cancel_marks_movement_cancelled() {
        let dir = tempdir().unwrap();
        let engine = engine_for(dir.path(), Some("exec sleep 30 #"));
        let session = engine.create(dir.path()).unwrap();
        let mut rx = session.subscribe();
        session.execute("ignored".to_string()).await.unwrap();
        session.cancel();
        assert_eq!(
            wait_for_end(&mut rx).await,
            SessionEvent::MovementError { error: "cancelled".to_string() }
        );
        assert_eq!(session.history()[0].status, MovementStatus::Cancelled);
    }

    #[test]
    fn session_ids_cannot_escape_history_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("x.json"), "{}").unwrap();
        let engine = engine_for(dir.path(), None);
        for id in ["../x", "..", "a/b", "", "s.json"] {
            assert!(
                matches!(
                    engine.resume_from_history(dir.path(), id),
                    Err(AppError::InvalidInputArgument(_))
                ),
                "{id} was accepted"
            );
        }
        assert!(validate_session_id(&Uuid::new_v4().to_string()).is_ok());
    }

    #[test]
    fn missing_or_corrupt_history_fails_rehydration() {
        let dir = tempdir().unwrap();
        let engine = engine_for(dir.path(), None);
        assert!(matches!(
            engine.resume_from_history(dir.path(), "nope"),
            Err(AppError::RehydrationFailed { .. })
        ));
        std::fs::create_dir_all(dir.path().join(".tabdock/sessions")).unwrap();
        std::fs::write(dir.path().join(".tabdock/sessions/bad.json"), "[]").unwrap();
        assert!(matches!(
            engine.resume_from_history(dir.path(), "bad"),
            Err(AppError::RehydrationFailed { .. })
        ));
    }
}
