//! Persistent terminals: shells hosted by an external multiplexer so they
//! survive server restarts. Output is mirrored to viewers by polling the
//! pane while at least one viewer is attached.

use super::tmux::{tmux_unavailable, Multiplexer};
use crate::config::Config;
use crate::connection::{ConnectionId, OutboundSender};
use crate::error::AppError;
use crate::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

pub const SESSION_PREFIX: &str = "tabdock-";
const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentTerminalRecord {
    pub terminal_id: String,
    pub multiplexer_session_name: String,
    pub shell: String,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_attached_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PersistentCreated {
    pub is_reconnect: bool,
    pub shell: String,
    pub cwd: PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub pruned: Vec<String>,
    pub orphans: Vec<String>,
}

/// Multiplexer session name for a terminal id. Bytes outside
/// `[A-Za-z0-9-]` are written as `_xx` hex, so distinct ids never share a
/// session and the id can be read back from the name.
pub fn session_name(terminal_id: &str) -> String {
    let mut name = String::from(SESSION_PREFIX);
    for byte in terminal_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{:02x}", byte));
        }
    }
    name
}

/// Inverse of [`session_name`]; `None` for names we did not produce.
pub fn terminal_id_of(session_name: &str) -> Option<String> {
    static ENCODED: OnceLock<Regex> = OnceLock::new();
    let re = ENCODED.get_or_init(|| Regex::new(r"^(?:[A-Za-z0-9-]|_[0-9a-f]{2})+$").expect("static regex"));
    let encoded = session_name.strip_prefix(SESSION_PREFIX)?;
    if !re.is_match(encoded) {
        return None;
    }
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut rest = encoded;
    while let Some(c) = rest.chars().next() {
        if c == '_' {
            bytes.push(u8::from_str_radix(&rest[1..3], 16).ok()?);
            rest = &rest[3..];
        } else {
            bytes.push(c as u8);
            rest = &rest[1..];
        }
    }
    String::from_utf8(bytes).ok()
}

/// Trailing blank rows of the visible pane are noise for diffing.
fn normalize(capture: &str) -> &str {
    capture.trim_end_matches(|c: char| c == '\n' || c == ' ')
}

fn to_terminal(text: &str) -> String {
    text.replace('\n', "\r\n")
}

fn repaint(current: &str) -> String {
    format!("{}{}", CLEAR_SCREEN, to_terminal(current))
}

/// What a viewer that already rendered `last` needs to see `current`.
///
/// When the pane only grew, that is the appended suffix. Once the capture
/// window is full, new lines push the oldest ones off the top; then the
/// suffix follows the part of `last` that is still visible, provided at
/// least half of its lines survived. Anything else is a full repaint.
fn pane_delta(last: Option<&str>, current: &str) -> Option<String> {
    let Some(last) = last.filter(|l| !l.is_empty()) else {
        return Some(repaint(current));
    };
    if last == current {
        return None;
    }
    if let Some(suffix) = current.strip_prefix(last) {
        return Some(to_terminal(suffix));
    }

    let line_starts: Vec<usize> = last.match_indices('\n').map(|(i, _)| i + 1).collect();
    let line_count = line_starts.len() + 1;
    for (dropped, start) in line_starts.iter().enumerate() {
        if (dropped + 1) * 2 > line_count {
            break;
        }
        if let Some(suffix) = current.strip_prefix(&last[*start..]) {
            return (!suffix.is_empty()).then(|| to_terminal(suffix));
        }
    }
    Some(repaint(current))
}

type Subscribers = Arc<Mutex<HashMap<ConnectionId, OutboundSender>>>;

struct Poller {
    /// Last pane content pushed to subscribers.
    mirror: Arc<TokioMutex<Option<String>>>,
    subscribers: Subscribers,
    /// Viewers between reserving their place and joining `subscribers`.
    pending: usize,
    handle: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct PersistentTerminalManager {
    multiplexer: Arc<dyn Multiplexer>,
    binary: String,
    file_path: PathBuf,
    working_dir: PathBuf,
    fallback_shell: String,
    poll_interval: Duration,
    scrollback_lines: usize,
    records: TokioMutex<BTreeMap<String, PersistentTerminalRecord>>,
    orphans: Mutex<BTreeSet<String>>,
    pollers: Mutex<HashMap<String, Poller>>,
}

impl PersistentTerminalManager {
    /// Loads the persisted records and reconciles them with the live
    /// multiplexer sessions.
    pub async fn new(config: &Config, multiplexer: Arc<dyn Multiplexer>) -> Arc<Self> {
        let file_path = config.persistent_terminal_registry_file();
        let records = load_records(&file_path).await;
        let manager = Arc::new(Self {
            multiplexer,
            binary: config.tmux_binary.clone(),
            file_path,
            working_dir: config.working_dir.clone(),
            fallback_shell: config.resolve_shell(None),
            poll_interval: config.tmux_poll_interval.max(MIN_POLL_INTERVAL),
            scrollback_lines: config.persistent_scrollback_lines,
            records: TokioMutex::new(records),
            orphans: Mutex::new(BTreeSet::new()),
            pollers: Mutex::new(HashMap::new()),
        });
        match manager.sync().await {
            Ok(report) => info!(
                pruned = report.pruned.len(),
                orphans = report.orphans.len(),
                "Synchronized persistent terminals"
            ),
            Err(e) => warn!(error = %e, "Could not synchronize persistent terminals"),
        }
        manager
    }

    fn ensure_available(&self) -> Result<(), AppError> {
        if self.multiplexer.is_available() {
            Ok(())
        } else {
            Err(tmux_unavailable(&self.binary))
        }
    }

    /// Drops records whose session is gone and notes our own sessions that
    /// have no record as orphans. `create` with the matching id adopts one.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<SyncReport, AppError> {
        self.ensure_available()?;
        let live = self.multiplexer.list_sessions().await?;
        let mut records = self.records.lock().await;
        let mut report = SyncReport::default();

        records.retain(|terminal_id, record| {
            let alive = live.contains(&record.multiplexer_session_name);
            if !alive {
                report.pruned.push(terminal_id.clone());
            }
            alive
        });

        let orphans: BTreeSet<String> = live
            .iter()
            .filter(|n| n.starts_with(SESSION_PREFIX))
            .filter(|n| !records.values().any(|r| &r.multiplexer_session_name == *n))
            .cloned()
            .collect();
        for name in &orphans {
            info!(session = %name, terminal_id = ?terminal_id_of(name), "Found orphaned multiplexer session");
        }
        report.orphans = orphans.iter().cloned().collect();
        *lock(&self.orphans) = orphans;

        if !report.pruned.is_empty() {
            self.save(&records).await;
        }
        Ok(report)
    }

    /// Creates the terminal, or reconnects when its session is still alive.
    /// A live orphan session with this id's name is adopted.
    #[instrument(skip(self, cwd, shell))]
    pub async fn create(
        &self,
        terminal_id: &str,
        cwd: &Path,
        shell: &str,
        cols: u16,
        rows: u16,
    ) -> Result<PersistentCreated, AppError> {
        self.ensure_available()?;
        let mut records = self.records.lock().await;
        let name = records
            .get(terminal_id)
            .map(|r| r.multiplexer_session_name.clone())
            .unwrap_or_else(|| session_name(terminal_id));

        if self.multiplexer.has_session(&name).await? {
            if let Err(e) = self.multiplexer.resize(&name, cols, rows).await {
                debug!(error = %e, "Resize on reconnect failed");
            }
            let now = Utc::now();
            let record = records
                .entry(terminal_id.to_string())
                .and_modify(|r| r.last_attached_at = now)
                .or_insert_with(|| {
                    info!(session = %name, "Adopting orphaned multiplexer session");
                    PersistentTerminalRecord {
                        terminal_id: terminal_id.to_string(),
                        multiplexer_session_name: name.clone(),
                        shell: shell.to_string(),
                        cwd: cwd.to_path_buf(),
                        created_at: now,
                        last_attached_at: now,
                    }
                })
                .clone();
            lock(&self.orphans).remove(&name);
            self.save(&records).await;
            return Ok(PersistentCreated {
                is_reconnect: true,
                shell: record.shell,
                cwd: record.cwd,
            });
        }

        if records.remove(terminal_id).is_some() {
            warn!("Recorded multiplexer session is gone, starting a fresh one");
        }
        let name = session_name(terminal_id);
        self.multiplexer.new_session(&name, cwd, shell, cols, rows).await?;
        let now = Utc::now();
        records.insert(
            terminal_id.to_string(),
            PersistentTerminalRecord {
                terminal_id: terminal_id.to_string(),
                multiplexer_session_name: name.clone(),
                shell: shell.to_string(),
                cwd: cwd.to_path_buf(),
                created_at: now,
                last_attached_at: now,
            },
        );
        self.save(&records).await;
        info!(session = %name, "Created persistent terminal");
        Ok(PersistentCreated {
            is_reconnect: false,
            shell: shell.to_string(),
            cwd: cwd.to_path_buf(),
        })
    }

    async fn session_of(&self, terminal_id: &str) -> Option<String> {
        self.records
            .lock()
            .await
            .get(terminal_id)
            .map(|r| r.multiplexer_session_name.clone())
    }

    /// Sends the current pane to `sink` as scrollback and adds `connection`
    /// as a viewer. Starts the terminal's poller if none is running.
    #[instrument(skip(self, sink))]
    pub async fn attach(
        self: &Arc<Self>,
        terminal_id: &str,
        connection: ConnectionId,
        sink: OutboundSender,
    ) -> Result<(PersistentAttachment, Vec<String>), AppError> {
        self.ensure_available()?;
        let name = self
            .session_of(terminal_id)
            .await
            .ok_or_else(|| AppError::TerminalNotFound(terminal_id.to_string()))?;

        // Reserve a place first so a concurrent last-viewer detach cannot
        // tear the poller down while this viewer is still joining.
        let (mirror, subscribers) = {
            let mut pollers = lock(&self.pollers);
            let poller = pollers.entry(terminal_id.to_string()).or_insert_with(|| {
                let mirror = Arc::new(TokioMutex::new(None));
                let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
                let handle = tokio::spawn(poll_pane(
                    Arc::downgrade(self),
                    terminal_id.to_string(),
                    name.clone(),
                    mirror.clone(),
                    subscribers.clone(),
                ));
                debug!("Started pane poller");
                Poller {
                    mirror,
                    subscribers,
                    pending: 0,
                    handle,
                }
            });
            poller.pending += 1;
            (poller.mirror.clone(), poller.subscribers.clone())
        };

        // Bring existing viewers up to date before the newcomer joins, so its
        // scrollback and the live stream meet exactly.
        let mut last = mirror.lock().await;
        let capture = match self.multiplexer.capture_pane(&name, self.scrollback_lines).await {
            Ok(capture) => capture,
            Err(e) => {
                drop(last);
                self.settle_viewer(terminal_id, &subscribers, None);
                return Err(e);
            }
        };
        let current = normalize(&capture).to_string();
        if last.is_some() {
            if let Some(delta) = pane_delta(last.as_deref(), &current) {
                fan_out(&subscribers, terminal_id, &delta);
            }
        }
        if !self.settle_viewer(terminal_id, &subscribers, Some((connection, sink.clone()))) {
            debug!("Terminal closed while attaching");
            return Err(AppError::TerminalNotFound(terminal_id.to_string()));
        }
        let scrollback: Vec<String> = if current.is_empty() {
            Vec::new()
        } else {
            current.split('\n').map(str::to_string).collect()
        };
        if !scrollback.is_empty() {
            let _ = sink.send(ServerMessage::TerminalScrollback {
                terminal_id: terminal_id.to_string(),
                lines: scrollback.clone(),
            });
        }
        *last = Some(current);
        drop(last);

        if let Some(record) = self.records.lock().await.get_mut(terminal_id) {
            record.last_attached_at = Utc::now();
        }

        Ok((
            PersistentAttachment {
                terminal_id: terminal_id.to_string(),
                connection,
                manager: self.clone(),
            },
            scrollback,
        ))
    }

    /// Removes one viewer. The last viewer leaving stops the poller; the
    /// multiplexer session keeps running.
    pub fn detach(&self, terminal_id: &str, connection: ConnectionId) {
        let mut pollers = lock(&self.pollers);
        let Some(poller) = pollers.get(terminal_id) else {
            return;
        };
        let now_idle = {
            let mut subscribers = lock(&poller.subscribers);
            subscribers.remove(&connection).is_some() && subscribers.is_empty() && poller.pending == 0
        };
        if now_idle {
            if let Some(poller) = pollers.remove(terminal_id) {
                poller.handle.abort();
                debug!(terminal_id, "Stopped pane poller, no viewers left");
            }
        }
    }

    /// Completes a reservation made by `attach`, adding the viewer when one is
    /// given. Returns false when the poller was torn down in the meantime by
    /// `close` or by its session ending.
    fn settle_viewer(
        &self,
        terminal_id: &str,
        subscribers: &Subscribers,
        viewer: Option<(ConnectionId, OutboundSender)>,
    ) -> bool {
        let mut pollers = lock(&self.pollers);
        let Some(poller) = pollers
            .get_mut(terminal_id)
            .filter(|p| Arc::ptr_eq(&p.subscribers, subscribers))
        else {
            return false;
        };
        poller.pending = poller.pending.saturating_sub(1);
        let idle = {
            let mut current = lock(&poller.subscribers);
            if let Some((connection, sink)) = viewer {
                current.insert(connection, sink);
            }
            current.is_empty() && poller.pending == 0
        };
        if idle {
            if let Some(poller) = pollers.remove(terminal_id) {
                poller.handle.abort();
                debug!(terminal_id, "Stopped pane poller, no viewers left");
            }
        }
        true
    }

    fn stop_poller(&self, terminal_id: &str) {
        if let Some(poller) = lock(&self.pollers).remove(terminal_id) {
            poller.handle.abort();
        }
    }

    pub async fn write(&self, terminal_id: &str, data: &str) -> Result<bool, AppError> {
        let Some(name) = self.session_of(terminal_id).await else {
            return Ok(false);
        };
        self.multiplexer.send_literal(&name, data).await?;
        Ok(true)
    }

    pub async fn resize(&self, terminal_id: &str, cols: u16, rows: u16) -> Result<bool, AppError> {
        let Some(name) = self.session_of(terminal_id).await else {
            return Ok(false);
        };
        self.multiplexer.resize(&name, cols, rows).await?;
        Ok(true)
    }

    pub async fn scrollback(&self, terminal_id: &str, lines: usize) -> Result<Option<Vec<String>>, AppError> {
        let Some(name) = self.session_of(terminal_id).await else {
            return Ok(None);
        };
        let capture = self.multiplexer.capture_pane(&name, lines).await?;
        Ok(Some(normalize(&capture).split('\n').map(str::to_string).collect()))
    }

    /// Stops mirroring, forgets the record and kills the multiplexer session.
    #[instrument(skip(self))]
    pub async fn close(&self, terminal_id: &str) -> Result<bool, AppError> {
        self.stop_poller(terminal_id);
        let removed = {
            let mut records = self.records.lock().await;
            let removed = records.remove(terminal_id);
            if removed.is_some() {
                self.save(&records).await;
            }
            removed
        };
        let Some(record) = removed else {
            return Ok(false);
        };
        if let Err(e) = self.multiplexer.kill_session(&record.multiplexer_session_name).await {
            warn!(error = %e, "Failed to kill multiplexer session, it may already be gone");
        }
        info!("Closed persistent terminal");
        Ok(true)
    }

    pub async fn contains(&self, terminal_id: &str) -> bool {
        self.records.lock().await.contains_key(terminal_id)
    }

    pub async fn list(&self) -> Vec<PersistentTerminalRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Orphans found by the last `sync` that are still alive and unclaimed.
    pub async fn orphans(&self) -> Result<Vec<String>, AppError> {
        self.ensure_available()?;
        let live = self.multiplexer.list_sessions().await?;
        let mut orphans = lock(&self.orphans);
        orphans.retain(|name| live.contains(name));
        Ok(orphans.iter().cloned().collect())
    }

    pub fn active_pollers(&self) -> usize {
        lock(&self.pollers).len()
    }

    pub fn viewer_count(&self, terminal_id: &str) -> usize {
        lock(&self.pollers)
            .get(terminal_id)
            .map(|p| lock(&p.subscribers).len())
            .unwrap_or(0)
    }

    /// Called by a poller that found its session gone.
    async fn forget(&self, terminal_id: &str, subscribers: &Subscribers) {
        {
            let mut pollers = lock(&self.pollers);
            if pollers
                .get(terminal_id)
                .is_some_and(|p| Arc::ptr_eq(&p.subscribers, subscribers))
            {
                pollers.remove(terminal_id);
            }
        }
        let mut records = self.records.lock().await;
        if records.remove(terminal_id).is_some() {
            self.save(&records).await;
        }
    }

    async fn save(&self, records: &BTreeMap<String, PersistentTerminalRecord>) {
        if let Err(e) = save_records(&self.file_path, records).await {
            error!(path = %self.file_path.display(), error = %e, "Failed to persist terminal records");
        }
    }
}

async fn load_records(path: &Path) -> BTreeMap<String, PersistentTerminalRecord> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read terminal records, starting empty");
            return BTreeMap::new();
        }
    };
    match serde_json::from_str::<Vec<PersistentTerminalRecord>>(&raw) {
        Ok(records) => records.into_iter().map(|r| (r.terminal_id.clone(), r)).collect(),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Terminal records are corrupt, starting empty");
            BTreeMap::new()
        }
    }
}

async fn save_records(path: &Path, records: &BTreeMap<String, PersistentTerminalRecord>) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let list: Vec<&PersistentTerminalRecord> = records.values().collect();
    let json = serde_json::to_string_pretty(&list)?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn fan_out(subscribers: &Subscribers, terminal_id: &str, output: &str) {
    lock(subscribers).retain(|_, sink| {
        sink.send(ServerMessage::TerminalOutput {
            terminal_id: terminal_id.to_string(),
            output: output.to_string(),
        })
        .is_ok()
    });
}

async fn poll_pane(
    manager: Weak<PersistentTerminalManager>,
    terminal_id: String,
    name: String,
    mirror: Arc<TokioMutex<Option<String>>>,
    subscribers: Subscribers,
) {
    let Some(period) = manager.upgrade().map(|m| m.poll_interval) else {
        return;
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            break;
        };
        let mut last = mirror.lock().await;
        match manager.multiplexer.capture_pane(&name, manager.scrollback_lines).await {
            Ok(capture) => {
                let current = normalize(&capture);
                if last.as_deref() != Some(current) {
                    if let Some(delta) = pane_delta(last.as_deref(), current) {
                        fan_out(&subscribers, &terminal_id, &delta);
                    }
                    *last = Some(current.to_string());
                }
            }
            Err(e) => {
                if manager.multiplexer.has_session(&name).await.unwrap_or(true) {
                    debug!(terminal_id = %terminal_id, error = %e, "Pane capture failed, retrying");
                    continue;
                }
                info!(terminal_id = %terminal_id, session = %name, "Multiplexer session ended");
                {
                    let mut viewers = lock(&subscribers);
                    for sink in viewers.values() {
                        let _ = sink.send(ServerMessage::TerminalExit {
                            terminal_id: terminal_id.clone(),
                            exit_code: None,
                        });
                    }
                    viewers.clear();
                }
                drop(last);
                manager.forget(&terminal_id, &subscribers).await;
                break;
            }
        }
    }
}

/// A connection's handle on a persistent terminal it is viewing.
pub struct PersistentAttachment {
    terminal_id: String,
    connection: ConnectionId,
    manager: Arc<PersistentTerminalManager>,
}

impl PersistentAttachment {
    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub async fn write(&self, data: &str) -> Result<bool, AppError> {
        self.manager.write(&self.terminal_id, data).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<bool, AppError> {
        self.manager.resize(&self.terminal_id, cols, rows).await
    }

    pub fn detach(&self) {
        self.manager.detach(&self.terminal_id, self.connection);
    }
}
