//! Routes outbound messages: unicast to the connections bound to a session,
//! or broadcast to every connection on the working directory.
//!
//! Execution event logs live behind the same lock as the listener table, so
//! recording an event, delivering it and snapshotting it for a reattaching
//! client are mutually ordered.

use crate::connection::{ConnectionId, OutboundSender};
use crate::protocol::ServerMessage;
use crate::registry::TabRegistry;
use crate::session::history::{ExecutionEventKind, Movement};
use crate::session::{ExecutionEvent, ExecutionEventLog, Session, SessionEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Listener {
    connection: ConnectionId,
    tab_id: String,
}

#[derive(Default)]
struct BroadcastState {
    connections: HashMap<ConnectionId, OutboundSender>,
    listeners: HashMap<String, Vec<Listener>>,
    event_logs: HashMap<String, ExecutionEventLog>,
}

impl BroadcastState {
    fn send_to(&self, connection: ConnectionId, msg: ServerMessage) -> bool {
        match self.connections.get(&connection) {
            Some(sink) => sink.send(msg).is_ok(),
            None => false,
        }
    }

    fn remove_listener(&mut self, connection: ConnectionId, tab_id: &str) {
        self.listeners.retain(|_, listeners| {
            listeners.retain(|l| !(l.connection == connection && l.tab_id == tab_id));
            !listeners.is_empty()
        });
    }
}

#[derive(Default)]
pub struct OutputBroadcaster {
    state: Mutex<BroadcastState>,
}

impl OutputBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_connection(&self, connection: ConnectionId, sink: OutboundSender) {
        self.lock().connections.insert(connection, sink);
    }

    pub fn unregister_connection(&self, connection: ConnectionId) {
        let mut state = self.lock();
        state.connections.remove(&connection);
        state.listeners.retain(|_, listeners| {
            listeners.retain(|l| l.connection != connection);
            !listeners.is_empty()
        });
    }

    /// Delivers to every connection on the working directory.
    pub fn broadcast(&self, msg: ServerMessage) {
        let state = self.lock();
        for (connection, sink) in &state.connections {
            if sink.send(msg.clone()).is_err() {
                debug!(connection, "Skipping closed connection during broadcast");
            }
        }
    }

    /// Sends the reattachment payload to `connection` only and makes it a
    /// live listener of `session`, atomically with respect to event delivery.
    ///
    /// `build` receives the completed movements and, while a turn is in
    /// progress as far as delivery is concerned, that turn's events. A turn
    /// the session has already finished but whose tail is still being
    /// delivered appears only as events, never in both places.
    pub fn attach_with_replay(
        &self,
        session: &dyn Session,
        connection: ConnectionId,
        tab_id: &str,
        build: impl FnOnce(Vec<Movement>, Option<Vec<ExecutionEvent>>) -> ServerMessage,
    ) -> bool {
        let mut state = self.lock();
        let mut history = session.history();
        let in_progress = state.event_logs.get(session.id()).map(ExecutionEventLog::snapshot);
        if let Some(events) = &in_progress {
            let start = history.last().and_then(|last| last.events.first());
            if start.is_some() && start == events.first() {
                history.pop();
            }
        }
        let delivered = state.send_to(connection, build(history, in_progress));

        state.remove_listener(connection, tab_id);
        state
            .listeners
            .entry(session.id().to_string())
            .or_default()
            .push(Listener {
                connection,
                tab_id: tab_id.to_string(),
            });
        delivered
    }

    pub fn unbind_tab_everywhere(&self, tab_id: &str) {
        self.lock().listeners.retain(|_, listeners| {
            listeners.retain(|l| l.tab_id != tab_id);
            !listeners.is_empty()
        });
    }

    /// Records the event in the session's log and unicasts it to the
    /// connections bound to that session.
    pub fn deliver_event(&self, session_id: &str, event: &SessionEvent) {
        let mut state = self.lock();
        match event {
            SessionEvent::Execution(execution) => {
                state
                    .event_logs
                    .entry(session_id.to_string())
                    .or_default()
                    .record(execution.clone());
            }
            SessionEvent::MovementComplete | SessionEvent::MovementError { .. } => {
                state.event_logs.remove(session_id);
            }
            SessionEvent::SessionUpdate(_) => {}
        }

        let Some(listeners) = state.listeners.get(session_id) else {
            return;
        };
        for listener in listeners {
            let tab_id = listener.tab_id.clone();
            let msg = match event {
                SessionEvent::Execution(execution) => ServerMessage::from_execution_event(&tab_id, execution),
                SessionEvent::MovementComplete => ServerMessage::MovementComplete { tab_id },
                SessionEvent::MovementError { error } => ServerMessage::MovementError {
                    tab_id,
                    error: error.clone(),
                },
                SessionEvent::SessionUpdate(info) => ServerMessage::SessionUpdate {
                    tab_id,
                    session: info.clone(),
                },
            };
            if !state.send_to(listener.connection, msg) {
                debug!(connection = listener.connection, session_id, "Listener connection is gone");
            }
        }
    }

    /// Drops the session's log and listeners once it leaves the store.
    pub fn forget_session(&self, session_id: &str) {
        let mut state = self.lock();
        state.event_logs.remove(session_id);
        state.listeners.remove(session_id);
    }

    pub fn listener_count(&self, session_id: &str) -> usize {
        self.lock().listeners.get(session_id).map(Vec::len).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }
}

/// Forwards one session's events for as long as the session exists: logs
/// and unicasts them, and broadcasts execution-state transitions.
pub fn spawn_session_pump(
    broadcaster: Arc<OutputBroadcaster>,
    tabs: Arc<Mutex<TabRegistry>>,
    session: &Arc<dyn Session>,
) -> JoinHandle<()> {
    let mut events = session.subscribe();
    let session_id = session.id().to_string();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(session_id = %session_id, skipped, "Session pump lagged, events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            broadcaster.deliver_event(&session_id, &event);

            let is_executing = match &event {
                SessionEvent::Execution(e) if e.kind == ExecutionEventKind::MovementStart => true,
                SessionEvent::MovementComplete | SessionEvent::MovementError { .. } => false,
                _ => continue,
            };
            let changed: Vec<(String, bool)> = {
                let mut registry = tabs.lock().unwrap_or_else(|e| e.into_inner());
                registry
                    .tabs_for_session(&session_id)
                    .into_iter()
                    .map(|tab_id| {
                        if is_executing {
                            registry.touch(&tab_id);
                        } else {
                            registry.mark_unviewed(&tab_id);
                        }
                        let unviewed = registry
                            .get(&tab_id)
                            .map(|t| t.has_unviewed_completion)
                            .unwrap_or(false);
                        (tab_id, unviewed)
                    })
                    .collect()
            };
            for (tab_id, has_unviewed_completion) in changed {
                broadcaster.broadcast(ServerMessage::TabStateChanged {
                    tab_id,
                    is_executing,
                    has_unviewed_completion,
                });
            }
        }
        debug!(session_id = %session_id, "Session pump finished");
    })
}
