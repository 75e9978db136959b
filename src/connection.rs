use crate::protocol::ServerMessage;
use crate::terminal::persistent::PersistentAttachment;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::debug;

pub type ConnectionId = u64;
pub type OutboundSender = mpsc::UnboundedSender<ServerMessage>;

/// One live transport connection. Everything here dies with the socket; the
/// sessions and terminals it was looking at do not.
pub struct Connection {
    pub id: ConnectionId,
    sink: OutboundSender,
    attachments: TokioMutex<HashMap<String, PersistentAttachment>>,
}

impl Connection {
    pub fn new(id: ConnectionId, sink: OutboundSender) -> Self {
        Self {
            id,
            sink,
            attachments: TokioMutex::new(HashMap::new()),
        }
    }

    pub fn send(&self, msg: ServerMessage) -> bool {
        self.sink.send(msg).is_ok()
    }

    pub fn sink(&self) -> OutboundSender {
        self.sink.clone()
    }

    /// Keeps the attachment; an older one for the same terminal is detached.
    pub async fn hold_attachment(&self, attachment: PersistentAttachment) {
        let previous = self
            .attachments
            .lock()
            .await
            .insert(attachment.terminal_id().to_string(), attachment);
        if let Some(previous) = previous {
            previous.detach();
        }
    }

    pub async fn release_attachment(&self, terminal_id: &str) {
        if let Some(attachment) = self.attachments.lock().await.remove(terminal_id) {
            attachment.detach();
        }
    }

    pub async fn is_attached(&self, terminal_id: &str) -> bool {
        self.attachments.lock().await.contains_key(terminal_id)
    }

    pub async fn detach_all(&self) {
        let attachments: Vec<PersistentAttachment> =
            self.attachments.lock().await.drain().map(|(_, a)| a).collect();
        for attachment in attachments {
            attachment.detach();
        }
    }
}

/// Per-connection tab -> session bindings. Memory only.
#[derive(Default)]
pub struct ConnectionRegistry {
    bindings: RwLock<HashMap<ConnectionId, HashMap<String, String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, connection: ConnectionId) {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.entry(connection).or_default();
    }

    /// Discards the connection's bindings. Referenced sessions are untouched.
    pub fn close(&self, connection: ConnectionId) -> HashMap<String, String> {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        let discarded = bindings.remove(&connection).unwrap_or_default();
        debug!(connection, tabs = discarded.len(), "Discarded connection bindings");
        discarded
    }

    pub fn bind(&self, connection: ConnectionId, tab_id: &str, session_id: &str) {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings
            .entry(connection)
            .or_default()
            .insert(tab_id.to_string(), session_id.to_string());
    }

    pub fn session_for(&self, connection: ConnectionId, tab_id: &str) -> Option<String> {
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings.get(&connection).and_then(|tabs| tabs.get(tab_id)).cloned()
    }

    /// Drops `tab_id` from every connection, e.g. after the tab is removed.
    pub fn unbind_everywhere(&self, tab_id: &str) {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        for tabs in bindings.values_mut() {
            tabs.remove(tab_id);
        }
    }
}
