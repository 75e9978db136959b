//! The one shared service object for a working directory. Constructed once at
//! startup and handed to every connection handler.

use crate::broadcast::{spawn_session_pump, OutputBroadcaster};
use crate::config::Config;
use crate::connection::{Connection, ConnectionRegistry, OutboundSender};
use crate::error::AppError;
use crate::registry::TabRegistry;
use crate::session::{Session, SessionEngine, SessionStore};
use crate::terminal::persistent::PersistentTerminalManager;
use crate::terminal::pty::{PtyBackend, PtyManager};
use crate::terminal::tmux::Multiplexer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

pub struct Workspace {
    pub config: Config,
    pub tabs: Arc<Mutex<TabRegistry>>,
    pub sessions: SessionStore,
    pub connections: ConnectionRegistry,
    pub broadcaster: Arc<OutputBroadcaster>,
    pub engine: Arc<dyn SessionEngine>,
    pub pty: PtyManager,
    pub persistent: Arc<PersistentTerminalManager>,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    next_connection_id: AtomicU64,
}

impl Workspace {
    pub async fn new(
        config: Config,
        engine: Arc<dyn SessionEngine>,
        pty_backend: Arc<dyn PtyBackend>,
        multiplexer: Arc<dyn Multiplexer>,
    ) -> Arc<Self> {
        let tabs = TabRegistry::load(&config.tab_registry_file());
        let persistent = PersistentTerminalManager::new(&config, multiplexer).await;
        info!(working_dir = %config.working_dir.display(), "Workspace ready");
        Arc::new(Self {
            tabs: Arc::new(Mutex::new(tabs)),
            sessions: SessionStore::new(),
            connections: ConnectionRegistry::new(),
            broadcaster: Arc::new(OutputBroadcaster::new()),
            engine,
            pty: PtyManager::new(pty_backend),
            persistent,
            pumps: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn lock_tabs(&self) -> MutexGuard<'_, TabRegistry> {
        self.tabs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Puts a session into the store and starts its event pump. If a session
    /// with the same id is already resident, that one is returned instead.
    pub fn admit(&self, session: Arc<dyn Session>) -> Arc<dyn Session> {
        if self.sessions.insert(session.clone()) {
            let pump = spawn_session_pump(self.broadcaster.clone(), self.tabs.clone(), &session);
            self.pumps
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(session.id().to_string(), pump);
            debug!(session_id = session.id(), "Admitted session");
            return session;
        }
        self.sessions.get(session.id()).unwrap_or(session)
    }

    /// Takes a session out of the store once no tab points at it. A session
    /// that is mid-turn stays resident. Its history remains on disk, so a
    /// later `resumeSession` rehydrates it.
    #[instrument(skip(self))]
    pub fn evict_if_unreferenced(&self, session_id: &str) -> bool {
        let tabs = self.lock_tabs();
        if !tabs.tabs_for_session(session_id).is_empty() {
            return false;
        }
        match self.sessions.get(session_id) {
            Some(session) if session.is_executing() => {
                debug!("Keeping executing session resident");
                return false;
            }
            Some(_) => {}
            None => return false,
        }
        self.sessions.remove(session_id);
        drop(tabs);

        if let Some(pump) = self.pumps.lock().unwrap_or_else(|e| e.into_inner()).remove(session_id) {
            pump.abort();
        }
        self.broadcaster.forget_session(session_id);
        info!("Evicted unreferenced session");
        true
    }

    pub fn pump_count(&self) -> usize {
        self.pumps.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn create_session(&self) -> Result<Arc<dyn Session>, AppError> {
        let session = self.engine.create(&self.config.working_dir)?;
        Ok(self.admit(session))
    }

    pub fn open_connection(&self, sink: OutboundSender) -> Connection {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        self.connections.open(id);
        self.broadcaster.register_connection(id, sink.clone());
        info!(connection = id, "Connection opened");
        Connection::new(id, sink)
    }

    /// Drops everything tied to the socket. Sessions and terminal processes
    /// stay alive for the next connection.
    #[instrument(skip(self, connection), fields(connection = connection.id))]
    pub async fn close_connection(&self, connection: &Connection) {
        self.connections.close(connection.id);
        self.broadcaster.unregister_connection(connection.id);
        self.pty.unsubscribe_all(connection.id);
        connection.detach_all().await;
        info!("Connection closed");
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::session::testing::FakeEngine;
    use crate::terminal::pty::testing::FakePtyBackend;
    use crate::terminal::tmux::testing::FakeMultiplexer;
    use std::path::Path;
    use std::time::Duration;

    pub struct Harness {
        pub workspace: Arc<Workspace>,
        pub engine: Arc<FakeEngine>,
        pub pty: Arc<FakePtyBackend>,
        pub multiplexer: Arc<FakeMultiplexer>,
    }

    pub async fn harness(dir: &Path) -> Harness {
        harness_with_engine(dir, Arc::new(FakeEngine::new())).await
    }

    pub async fn harness_with_engine(dir: &Path, engine: Arc<FakeEngine>) -> Harness {
        let mut config = Config::for_working_dir(dir);
        config.tmux_poll_interval = Duration::from_millis(10);
        config.default_shell = Some("/bin/sh".to_string());
        let pty = Arc::new(FakePtyBackend::default());
        let multiplexer = Arc::new(FakeMultiplexer::default());
        let workspace = Workspace::new(config, engine.clone(), pty.clone(), multiplexer.clone()).await;
        Harness {
            workspace,
            engine,
            pty,
            multiplexer,
        }
    }
}
