//! Ephemeral terminals: pseudo-terminal children owned by this server
//! process. They outlive client connections but not the server.

use super::scrollback::Scrollback;
use crate::connection::{ConnectionId, OutboundSender};
use crate::error::AppError;
use crate::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

pub struct SpawnRequest {
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

pub trait PtyControl: Send {
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), AppError>;
    fn kill(&mut self) -> Result<(), AppError>;
    fn process_id(&self) -> Option<u32>;
}

/// Blocks until the child exits and yields its exit code.
pub type ExitWaiter = Box<dyn FnOnce() -> Option<i32> + Send>;

pub struct SpawnedPty {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn PtyControl>,
    pub wait: ExitWaiter,
}

pub trait PtyBackend: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, AppError>;
}

fn remediation() -> String {
    if !cfg!(feature = "pty") {
        return "This build has no terminal support. Rebuild tabdock with the `pty` feature enabled.".to_string();
    }
    if cfg!(target_os = "linux") {
        "Make sure /dev/ptmx and /dev/pts are present and writable by the server user (mount devpts; in containers allocate a TTY).".to_string()
    } else if cfg!(target_os = "macos") {
        "Make sure the server process may open /dev/ptmx and that the pseudo-terminal limit (kern.tty.ptmx_max) is not exhausted.".to_string()
    } else if cfg!(windows) {
        "Terminals need ConPTY, available on Windows 10 version 1809 or later.".to_string()
    } else {
        "This platform has no supported pseudo-terminal facility.".to_string()
    }
}

pub fn facility_unavailable(reason: impl Into<String>) -> AppError {
    AppError::FacilityUnavailable {
        reason: reason.into(),
        instructions: remediation(),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBackend;

#[cfg(feature = "pty")]
mod native {
    use super::*;
    use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};

    struct NativeControl {
        master: Box<dyn MasterPty + Send>,
        killer: Box<dyn ChildKiller + Send + Sync>,
        pid: Option<u32>,
    }

    impl PtyControl for NativeControl {
        fn resize(&mut self, cols: u16, rows: u16) -> Result<(), AppError> {
            self.master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| AppError::ProcessError(format!("Failed to resize pty: {}", e)))
        }

        fn kill(&mut self) -> Result<(), AppError> {
            self.killer.kill().map_err(AppError::from)
        }

        fn process_id(&self) -> Option<u32> {
            self.pid
        }
    }

    impl PtyBackend for NativePtyBackend {
        fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, AppError> {
            let pair = native_pty_system()
                .openpty(PtySize {
                    rows: request.rows,
                    cols: request.cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| facility_unavailable(format!("Failed to open pty: {}", e)))?;

            let mut cmd = CommandBuilder::new(&request.shell);
            cmd.cwd(&request.cwd);
            if !cfg!(windows) {
                cmd.env("TERM", "xterm-256color");
                cmd.env("COLORTERM", "truecolor");
            }

            let mut child = pair
                .slave
                .spawn_command(cmd)
                .map_err(|e| AppError::ProcessError(format!("Failed to spawn '{}': {}", request.shell, e)))?;
            drop(pair.slave);

            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| AppError::ProcessError(format!("Failed to clone pty reader: {}", e)))?;
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| AppError::ProcessError(format!("Failed to take pty writer: {}", e)))?;

            let control = NativeControl {
                killer: child.clone_killer(),
                pid: child.process_id(),
                master: pair.master,
            };
            let wait: ExitWaiter = Box::new(move || child.wait().ok().map(|status| status.exit_code() as i32));

            Ok(SpawnedPty {
                reader,
                writer,
                control: Box::new(control),
                wait,
            })
        }
    }
}

#[cfg(not(feature = "pty"))]
impl PtyBackend for NativePtyBackend {
    fn spawn(&self, _request: &SpawnRequest) -> Result<SpawnedPty, AppError> {
        Err(facility_unavailable("pseudo-terminal support is not compiled in"))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyTerminalInfo {
    pub id: String,
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PtyCreated {
    pub is_reconnect: bool,
    pub shell: String,
    pub cwd: PathBuf,
}

/// Scrollback and live subscribers share one lock so a new subscriber's
/// snapshot and the live stream neither overlap nor leave a gap.
#[derive(Default)]
struct OutputState {
    scrollback: Scrollback,
    subscribers: HashMap<ConnectionId, OutboundSender>,
}

struct PtyTerminal {
    id: String,
    shell: String,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
    last_activity_at: Mutex<DateTime<Utc>>,
    size: Mutex<(u16, u16)>,
    output: Mutex<OutputState>,
    writer: Mutex<Box<dyn Write + Send>>,
    control: Mutex<Box<dyn PtyControl>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PtyTerminal {
    fn touch(&self) {
        *lock(&self.last_activity_at) = Utc::now();
    }

    fn publish(&self, text: String) {
        self.touch();
        let mut output = lock(&self.output);
        output.scrollback.push(&text);
        let terminal_id = &self.id;
        output.subscribers.retain(|connection, sink| {
            let delivered = sink
                .send(ServerMessage::TerminalOutput {
                    terminal_id: terminal_id.clone(),
                    output: text.clone(),
                })
                .is_ok();
            if !delivered {
                debug!(terminal_id = %terminal_id, connection, "Dropping closed terminal subscriber");
            }
            delivered
        });
    }

    fn notify_exit(&self, exit_code: Option<i32>) {
        let mut output = lock(&self.output);
        for sink in output.subscribers.values() {
            let _ = sink.send(ServerMessage::TerminalExit {
                terminal_id: self.id.clone(),
                exit_code,
            });
        }
        output.subscribers.clear();
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), AppError> {
        lock(&self.control).resize(cols, rows)?;
        *lock(&self.size) = (cols, rows);
        Ok(())
    }

    fn info(&self) -> PtyTerminalInfo {
        let (cols, rows) = *lock(&self.size);
        PtyTerminalInfo {
            id: self.id.clone(),
            shell: self.shell.clone(),
            cwd: self.cwd.clone(),
            cols,
            rows,
            pid: lock(&self.control).process_id(),
            created_at: self.created_at,
            last_activity_at: *lock(&self.last_activity_at),
        }
    }
}

type TerminalTable = Arc<Mutex<HashMap<String, Arc<PtyTerminal>>>>;

pub struct PtyManager {
    backend: Arc<dyn PtyBackend>,
    terminals: TerminalTable,
}

impl PtyManager {
    pub fn new(backend: Arc<dyn PtyBackend>) -> Self {
        Self {
            backend,
            terminals: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn get(&self, terminal_id: &str) -> Option<Arc<PtyTerminal>> {
        lock(&self.terminals).get(terminal_id).cloned()
    }

    pub fn contains(&self, terminal_id: &str) -> bool {
        lock(&self.terminals).contains_key(terminal_id)
    }

    /// Spawns a shell for `terminal_id`, or, if one is already running under
    /// that id, treats the call as a reconnect: the existing process is
    /// resized and nudged to redraw instead of being replaced.
    #[instrument(skip(self, cwd, shell))]
    pub fn create(
        &self,
        terminal_id: &str,
        cwd: &Path,
        cols: u16,
        rows: u16,
        shell: &str,
    ) -> Result<PtyCreated, AppError> {
        let mut terminals = lock(&self.terminals);
        if let Some(existing) = terminals.get(terminal_id).cloned() {
            drop(terminals);
            self.force_redraw(&existing, cols, rows);
            existing.touch();
            info!("Reconnected to running terminal");
            return Ok(PtyCreated {
                is_reconnect: true,
                shell: existing.shell.clone(),
                cwd: existing.cwd.clone(),
            });
        }

        let request = SpawnRequest {
            shell: shell.to_string(),
            cwd: cwd.to_path_buf(),
            cols,
            rows,
        };
        let spawned = self.backend.spawn(&request)?;
        let now = Utc::now();
        let terminal = Arc::new(PtyTerminal {
            id: terminal_id.to_string(),
            shell: request.shell,
            cwd: request.cwd,
            created_at: now,
            last_activity_at: Mutex::new(now),
            size: Mutex::new((cols, rows)),
            output: Mutex::new(OutputState::default()),
            writer: Mutex::new(spawned.writer),
            control: Mutex::new(spawned.control),
        });
        terminals.insert(terminal_id.to_string(), terminal.clone());
        drop(terminals);

        let table = self.terminals.clone();
        let reader = spawned.reader;
        let wait = spawned.wait;
        let thread_terminal = terminal.clone();
        std::thread::Builder::new()
            .name(format!("pty-{}", terminal_id))
            .spawn(move || pump_output(table, thread_terminal, reader, wait))?;

        info!(pid = ?terminal.info().pid, "Spawned terminal");
        Ok(PtyCreated {
            is_reconnect: false,
            shell: terminal.shell.clone(),
            cwd: terminal.cwd.clone(),
        })
    }

    /// Same-size resizes do not signal the child, so the size is bumped and
    /// restored to guarantee a redraw.
    fn force_redraw(&self, terminal: &PtyTerminal, cols: u16, rows: u16) {
        let current = *lock(&terminal.size);
        if current == (cols, rows) {
            let nudge_rows = if rows > 1 { rows - 1 } else { rows + 1 };
            if let Err(e) = terminal.resize(cols, nudge_rows) {
                warn!(terminal_id = %terminal.id, error = %e, "Failed to nudge terminal size");
            }
        }
        if let Err(e) = terminal.resize(cols, rows) {
            warn!(terminal_id = %terminal.id, error = %e, "Failed to resize terminal on reconnect");
        }
    }

    /// Sends the scrollback to `sink` (when there is any) and adds it as a
    /// live subscriber. Returns the replayed lines, `None` for unknown
    /// terminals.
    pub fn subscribe(&self, terminal_id: &str, connection: ConnectionId, sink: OutboundSender) -> Option<Vec<String>> {
        let terminal = self.get(terminal_id)?;
        let mut output = lock(&terminal.output);
        let lines = output.scrollback.lines();
        if !lines.is_empty() {
            let _ = sink.send(ServerMessage::TerminalScrollback {
                terminal_id: terminal_id.to_string(),
                lines: lines.clone(),
            });
        }
        output.subscribers.insert(connection, sink);
        Some(lines)
    }

    /// Removes one viewer. The process keeps running regardless of how many
    /// viewers remain.
    pub fn unsubscribe(&self, terminal_id: &str, connection: ConnectionId) -> bool {
        match self.get(terminal_id) {
            Some(terminal) => lock(&terminal.output).subscribers.remove(&connection).is_some(),
            None => false,
        }
    }

    pub fn unsubscribe_all(&self, connection: ConnectionId) {
        let terminals: Vec<Arc<PtyTerminal>> = lock(&self.terminals).values().cloned().collect();
        for terminal in terminals {
            lock(&terminal.output).subscribers.remove(&connection);
        }
    }

    pub fn subscriber_count(&self, terminal_id: &str) -> usize {
        self.get(terminal_id)
            .map(|t| lock(&t.output).subscribers.len())
            .unwrap_or(0)
    }

    pub fn write(&self, terminal_id: &str, data: &str) -> bool {
        let Some(terminal) = self.get(terminal_id) else {
            return false;
        };
        let mut writer = lock(&terminal.writer);
        if let Err(e) = writer.write_all(data.as_bytes()).and_then(|_| writer.flush()) {
            warn!(terminal_id, error = %e, "Failed to write to terminal");
            return false;
        }
        terminal.touch();
        true
    }

    pub fn resize(&self, terminal_id: &str, cols: u16, rows: u16) -> bool {
        let Some(terminal) = self.get(terminal_id) else {
            return false;
        };
        match terminal.resize(cols, rows) {
            Ok(()) => true,
            Err(e) => {
                warn!(terminal_id, error = %e, "Failed to resize terminal");
                false
            }
        }
    }

    pub fn scrollback(&self, terminal_id: &str) -> Option<Vec<String>> {
        self.get(terminal_id).map(|t| lock(&t.output).scrollback.lines())
    }

    /// Kills the child and forgets the terminal. The only explicit destructor.
    #[instrument(skip(self))]
    pub fn close(&self, terminal_id: &str) -> bool {
        let Some(terminal) = lock(&self.terminals).remove(terminal_id) else {
            return false;
        };
        lock(&terminal.output).subscribers.clear();
        if let Err(e) = lock(&terminal.control).kill() {
            warn!(error = %e, "Failed to kill terminal process");
        }
        info!("Closed terminal");
        true
    }

    pub fn info(&self, terminal_id: &str) -> Option<PtyTerminalInfo> {
        self.get(terminal_id).map(|t| t.info())
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = lock(&self.terminals).keys().cloned().collect();
        for id in ids {
            self.close(&id);
        }
    }
}

/// Splits off the longest valid UTF-8 prefix, keeping an incomplete trailing
/// sequence for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

fn pump_output(table: TerminalTable, terminal: Arc<PtyTerminal>, mut reader: Box<dyn Read + Send>, wait: ExitWaiter) {
    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut pending);
                if !text.is_empty() {
                    terminal.publish(text);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(terminal_id = %terminal.id, error = %e, "Terminal reader stopped");
                break;
            }
        }
    }

    let exit_code = wait();
    {
        let mut terminals = lock(&table);
        let still_current = terminals
            .get(&terminal.id)
            .map(|t| Arc::ptr_eq(t, &terminal))
            .unwrap_or(false);
        if still_current {
            terminals.remove(&terminal.id);
        }
    }
    info!(terminal_id = %terminal.id, exit_code = ?exit_code, "Terminal process exited");
    terminal.notify_exit(exit_code);
}
