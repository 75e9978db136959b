//! Per-message handling. Each inbound message is handled to completion before
//! the next one from the same connection is read.

use crate::connection::Connection;
use crate::error::AppError;
use crate::protocol::{ClientMessage, Resolution, ServerMessage};
use crate::resolver::Resolved;
use crate::service::Workspace;
use crate::session::Session;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Where a failed message's error is reported.
enum Scope {
    Tab(String),
    Terminal(String),
    Workspace,
}

impl Scope {
    fn of(msg: &ClientMessage) -> Self {
        match msg {
            ClientMessage::InitTab { tab_id }
            | ClientMessage::ResumeSession { tab_id, .. }
            | ClientMessage::Execute { tab_id, .. }
            | ClientMessage::Cancel { tab_id }
            | ClientMessage::New { tab_id }
            | ClientMessage::ApprovalResponse { tab_id, .. }
            | ClientMessage::RenameTab { tab_id, .. }
            | ClientMessage::RemoveTab { tab_id }
            | ClientMessage::MarkTabViewed { tab_id } => Scope::Tab(tab_id.clone()),
            ClientMessage::TerminalInit { terminal_id, .. }
            | ClientMessage::TerminalReconnect { terminal_id, .. }
            | ClientMessage::TerminalInitPersistent { terminal_id, .. }
            | ClientMessage::TerminalInput { terminal_id, .. }
            | ClientMessage::TerminalResize { terminal_id, .. }
            | ClientMessage::TerminalClose { terminal_id } => Scope::Terminal(terminal_id.clone()),
            ClientMessage::GetActiveTabs | ClientMessage::CreateTab { .. } | ClientMessage::ReorderTabs { .. } => {
                Scope::Workspace
            }
        }
    }
}

fn ready(terminal_id: &str, shell: &str, cwd: &Path, is_reconnect: bool, persistent: bool) -> ServerMessage {
    ServerMessage::TerminalReady {
        terminal_id: terminal_id.to_string(),
        shell: shell.to_string(),
        cwd: cwd.to_string_lossy().into_owned(),
        is_reconnect,
        persistent,
    }
}

fn validate_size(cols: u16, rows: u16) -> Result<(), AppError> {
    if cols == 0 || rows == 0 {
        return Err(AppError::InvalidInputArgument(format!(
            "Terminal size must be non-zero, got {}x{}",
            cols, rows
        )));
    }
    Ok(())
}

impl Workspace {
    /// Handles one inbound message. Failures are reported to this connection
    /// only and never escape.
    pub async fn dispatch(&self, connection: &Connection, msg: ClientMessage) {
        let scope = Scope::of(&msg);
        if let Err(e) = self.handle(connection, msg).await {
            if e.is_not_found() {
                debug!(connection = connection.id, error = %e, "Message referenced an unknown target");
            } else {
                warn!(connection = connection.id, error = %e, "Message handling failed");
            }
            let report = match scope {
                Scope::Terminal(terminal_id) => ServerMessage::TerminalError {
                    terminal_id,
                    error: e.to_string(),
                    instructions: e.instructions().map(str::to_string),
                },
                Scope::Tab(tab_id) => ServerMessage::error(Some(&tab_id), e.to_string()),
                Scope::Workspace => ServerMessage::error(None, e.to_string()),
            };
            connection.send(report);
        }
    }

    async fn handle(&self, connection: &Connection, msg: ClientMessage) -> Result<(), AppError> {
        match msg {
            ClientMessage::InitTab { tab_id } => {
                let resolved = self.resolve_tab(connection.id, &tab_id)?;
                self.announce_and_replay(connection, &tab_id, resolved);
                Ok(())
            }
            ClientMessage::ResumeSession {
                tab_id,
                historical_session_id,
            } => {
                let resolved = self.resume_session(connection.id, &tab_id, &historical_session_id)?;
                self.announce_and_replay(connection, &tab_id, resolved);
                Ok(())
            }
            ClientMessage::New { tab_id } => {
                let previous = self.lock_tabs().get_tab_session(&tab_id);
                let resolved = self.start_new_session(connection.id, &tab_id)?;
                self.announce_and_replay(connection, &tab_id, resolved);
                if let Some(previous) = previous {
                    self.evict_if_unreferenced(&previous);
                }
                Ok(())
            }
            ClientMessage::Execute { tab_id, prompt } => self.execute(connection, &tab_id, prompt).await,
            ClientMessage::Cancel { tab_id } => {
                let session = self.bound_session(connection, &tab_id)?;
                session.cancel();
                connection.send(ServerMessage::Cancelled { tab_id });
                Ok(())
            }
            ClientMessage::ApprovalResponse { tab_id, approved } => {
                let session = self.bound_session(connection, &tab_id)?;
                session.respond_to_approval(approved).await
            }
            ClientMessage::GetActiveTabs => {
                let tabs = self.lock_tabs().get_all();
                connection.send(ServerMessage::ActiveTabs { tabs });
                Ok(())
            }
            ClientMessage::CreateTab {
                tab_name,
                optimistic_tab_id,
            } => self.create_tab(connection, tab_name, optimistic_tab_id),
            ClientMessage::RenameTab { tab_id, tab_name } => {
                if !self.lock_tabs().update_name(&tab_id, &tab_name) {
                    return Err(AppError::TabNotFound(tab_id));
                }
                self.broadcaster.broadcast(ServerMessage::TabRenamed {
                    tab_id,
                    tab_name: tab_name.trim().to_string(),
                });
                Ok(())
            }
            ClientMessage::ReorderTabs { tab_order } => {
                let tab_order: Vec<String> = {
                    let mut tabs = self.lock_tabs();
                    tabs.reorder(&tab_order);
                    tabs.get_all().into_iter().map(|t| t.tab_id).collect()
                };
                self.broadcaster.broadcast(ServerMessage::TabsReordered { tab_order });
                Ok(())
            }
            ClientMessage::RemoveTab { tab_id } => self.remove_tab(&tab_id),
            ClientMessage::MarkTabViewed { tab_id } => {
                if !self.lock_tabs().mark_viewed(&tab_id) {
                    return Err(AppError::TabNotFound(tab_id));
                }
                self.broadcaster.broadcast(ServerMessage::TabViewed { tab_id });
                Ok(())
            }
            ClientMessage::TerminalInit {
                terminal_id,
                shell,
                cols,
                rows,
            } => {
                validate_size(cols, rows)?;
                self.terminal_init(connection, &terminal_id, shell.as_deref(), cols, rows)
            }
            ClientMessage::TerminalReconnect { terminal_id, cols, rows } => {
                if let (Some(cols), Some(rows)) = (cols, rows) {
                    validate_size(cols, rows)?;
                }
                self.terminal_reconnect(connection, &terminal_id, cols, rows).await
            }
            ClientMessage::TerminalInitPersistent {
                terminal_id,
                shell,
                cols,
                rows,
            } => {
                validate_size(cols, rows)?;
                self.terminal_init_persistent(connection, &terminal_id, shell.as_deref(), cols, rows)
                    .await
            }
            ClientMessage::TerminalInput { terminal_id, input } => {
                if self.pty.write(&terminal_id, &input) || self.persistent.write(&terminal_id, &input).await? {
                    Ok(())
                } else {
                    Err(AppError::TerminalNotFound(terminal_id))
                }
            }
            ClientMessage::TerminalResize {
                terminal_id,
                cols,
                rows,
            } => {
                validate_size(cols, rows)?;
                if self.pty.resize(&terminal_id, cols, rows) || self.persistent.resize(&terminal_id, cols, rows).await? {
                    Ok(())
                } else {
                    Err(AppError::TerminalNotFound(terminal_id))
                }
            }
            ClientMessage::TerminalClose { terminal_id } => self.terminal_close(connection, &terminal_id).await,
        }
    }

    fn bound_session(&self, connection: &Connection, tab_id: &str) -> Result<Arc<dyn Session>, AppError> {
        let session_id = self
            .connections
            .session_for(connection.id, tab_id)
            .ok_or_else(|| AppError::TabNotFound(tab_id.to_string()))?;
        self.sessions
            .get(&session_id)
            .ok_or(AppError::SessionNotFound(session_id))
    }

    fn announce_and_replay(&self, connection: &Connection, tab_id: &str, resolved: Resolved) {
        if let Some(tab) = resolved.registered.clone() {
            self.broadcaster.broadcast(ServerMessage::TabCreated {
                tab,
                optimistic_tab_id: None,
            });
        }
        self.replay_to(connection.id, tab_id, &resolved);
    }

    #[instrument(skip(self, connection, prompt), fields(connection = connection.id))]
    async fn execute(&self, connection: &Connection, tab_id: &str, prompt: String) -> Result<(), AppError> {
        let session = self.bound_session(connection, tab_id)?;
        self.lock_tabs().touch(tab_id);
        session.execute(prompt).await?;
        info!(session_id = session.id(), "Prompt execution started");
        Ok(())
    }

    #[instrument(skip(self, connection), fields(connection = connection.id))]
    fn create_tab(
        &self,
        connection: &Connection,
        tab_name: Option<String>,
        optimistic_tab_id: Option<String>,
    ) -> Result<(), AppError> {
        let tab_id = Uuid::new_v4().to_string();
        let session = self.create_session()?;
        let tab = self.lock_tabs().register_tab(&tab_id, session.id(), tab_name.as_deref());
        self.connections.bind(connection.id, &tab_id, session.id());
        info!(tab_id = %tab_id, session_id = session.id(), "Created tab");

        self.broadcaster.broadcast(ServerMessage::TabCreated {
            tab,
            optimistic_tab_id,
        });
        let resolved = Resolved {
            session,
            resolution: Resolution::New,
            previous_session_id: None,
            registered: None,
        };
        self.replay_to(connection.id, &tab_id, &resolved);
        Ok(())
    }

    /// Forgets the tab everywhere. Its session leaves the store unless
    /// another tab still points at it; the history stays on disk.
    #[instrument(skip(self))]
    fn remove_tab(&self, tab_id: &str) -> Result<(), AppError> {
        let session_id = {
            let mut tabs = self.lock_tabs();
            let session_id = tabs.get_tab_session(tab_id);
            if !tabs.unregister_tab(tab_id) {
                return Err(AppError::TabNotFound(tab_id.to_string()));
            }
            session_id
        };
        self.connections.unbind_everywhere(tab_id);
        self.broadcaster.unbind_tab_everywhere(tab_id);
        self.broadcaster.broadcast(ServerMessage::TabRemoved {
            tab_id: tab_id.to_string(),
        });
        if let Some(session_id) = session_id {
            self.evict_if_unreferenced(&session_id);
        }
        Ok(())
    }

    #[instrument(skip(self, connection, shell), fields(connection = connection.id))]
    fn terminal_init(
        &self,
        connection: &Connection,
        terminal_id: &str,
        shell: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> Result<(), AppError> {
        let shell = self.config.resolve_shell(shell);
        let created = self.pty.create(terminal_id, &self.config.working_dir, cols, rows, &shell)?;
        connection.send(ready(terminal_id, &created.shell, &created.cwd, created.is_reconnect, false));
        self.pty.subscribe(terminal_id, connection.id, connection.sink());
        if !created.is_reconnect {
            self.broadcaster.broadcast(ServerMessage::TerminalCreated {
                terminal_id: terminal_id.to_string(),
                persistent: false,
            });
        }
        Ok(())
    }

    async fn terminal_reconnect(
        &self,
        connection: &Connection,
        terminal_id: &str,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Result<(), AppError> {
        if let Some(info) = self.pty.info(terminal_id) {
            if let (Some(cols), Some(rows)) = (cols, rows) {
                self.pty.resize(terminal_id, cols, rows);
            }
            connection.send(ready(terminal_id, &info.shell, &info.cwd, true, false));
            self.pty.subscribe(terminal_id, connection.id, connection.sink());
            return Ok(());
        }

        let record = self
            .persistent
            .list()
            .await
            .into_iter()
            .find(|r| r.terminal_id == terminal_id)
            .ok_or_else(|| AppError::TerminalNotFound(terminal_id.to_string()))?;
        if let (Some(cols), Some(rows)) = (cols, rows) {
            self.persistent.resize(terminal_id, cols, rows).await?;
        }
        connection.send(ready(terminal_id, &record.shell, &record.cwd, true, true));
        self.attach_persistent(connection, terminal_id).await
    }

    #[instrument(skip(self, connection, shell), fields(connection = connection.id))]
    async fn terminal_init_persistent(
        &self,
        connection: &Connection,
        terminal_id: &str,
        shell: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> Result<(), AppError> {
        let shell = self.config.resolve_shell(shell);
        let created = self
            .persistent
            .create(terminal_id, &self.config.working_dir, &shell, cols, rows)
            .await?;
        connection.send(ready(terminal_id, &created.shell, &created.cwd, created.is_reconnect, true));
        self.attach_persistent(connection, terminal_id).await?;
        if !created.is_reconnect {
            self.broadcaster.broadcast(ServerMessage::TerminalCreated {
                terminal_id: terminal_id.to_string(),
                persistent: true,
            });
        }
        Ok(())
    }

    async fn attach_persistent(&self, connection: &Connection, terminal_id: &str) -> Result<(), AppError> {
        let (attachment, _scrollback) = self
            .persistent
            .attach(terminal_id, connection.id, connection.sink())
            .await?;
        connection.hold_attachment(attachment).await;
        Ok(())
    }

    #[instrument(skip(self, connection), fields(connection = connection.id))]
    async fn terminal_close(&self, connection: &Connection, terminal_id: &str) -> Result<(), AppError> {
        let closed = if self.pty.close(terminal_id) {
            true
        } else {
            connection.release_attachment(terminal_id).await;
            self.persistent.close(terminal_id).await?
        };
        if !closed {
            return Err(AppError::TerminalNotFound(terminal_id.to_string()));
        }
        self.broadcaster.broadcast(ServerMessage::TerminalClosed {
            terminal_id: terminal_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::harness;
    use crate::session::history::{history_lines, lines_of, ExecutionEventKind};
    use crate::session::testing::completed_movement;
    use crate::session::{ExecutionEvent, SessionEvent};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn open(workspace: &Workspace) -> (Connection, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (workspace.open_connection(tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn wait_for(
        rx: &mut UnboundedReceiver<ServerMessage>,
        pred: impl Fn(&ServerMessage) -> bool,
    ) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let msg = rx.recv().await.expect("connection queue closed");
                if pred(&msg) {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    fn created_tab_id(msgs: &[ServerMessage]) -> String {
        msgs.iter()
            .find_map(|m| match m {
                ServerMessage::TabCreated { tab, .. } => Some(tab.tab_id.clone()),
                _ => None,
            })
            .expect("no tabCreated")
    }

    #[tokio::test]
    async fn create_tab_then_reconnect_replays_history() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (first, mut first_rx) = open(ws);
        let (peer, mut peer_rx) = open(ws);

        ws.dispatch(
            &first,
            ClientMessage::CreateTab {
                tab_name: Some("Scratch".to_string()),
                optimistic_tab_id: Some("tmp-1".to_string()),
            },
        )
        .await;

        let msgs = drain(&mut first_rx);
        assert_eq!(msgs.len(), 2);
        let (tab_id, session_id) = match (&msgs[0], &msgs[1]) {
            (
                ServerMessage::TabCreated { tab, optimistic_tab_id },
                ServerMessage::TabInitialized { session, resolution, .. },
            ) => {
                assert_eq!(tab.tab_name, "Scratch");
                assert_eq!(tab.order, 0);
                assert_eq!(optimistic_tab_id.as_deref(), Some("tmp-1"));
                assert_eq!(*resolution, Resolution::New);
                assert_eq!(tab.session_id, session.session_id);
                (tab.tab_id.clone(), session.session_id.clone())
            }
            other => panic!("unexpected messages: {:?}", other),
        };
        let peer_msgs = drain(&mut peer_rx);
        assert_eq!(peer_msgs.len(), 1);
        assert!(matches!(peer_msgs[0], ServerMessage::TabCreated { .. }));

        let fake = h.engine.session(&session_id);
        fake.push_history(completed_movement("hello", &["hi there"]));
        ws.close_connection(&first).await;

        let (again, mut again_rx) = open(ws);
        ws.dispatch(&again, ClientMessage::InitTab { tab_id: tab_id.clone() }).await;
        match drain(&mut again_rx).as_slice() {
            [ServerMessage::TabInitialized {
                tab_name,
                session,
                resolution,
                output_history,
                is_executing,
                execution_events,
                context_lost,
                ..
            }] => {
                assert_eq!(tab_name, "Scratch");
                assert_eq!(session.session_id, session_id);
                assert_eq!(*resolution, Resolution::ReattachedRegistry);
                assert_eq!(output_history, &history_lines(&fake.history()));
                assert_eq!(output_history.len(), 2);
                assert!(!is_executing);
                assert!(execution_events.is_none());
                assert!(!context_lost);
            }
            other => panic!("unexpected messages: {:?}", other),
        }
        assert!(drain(&mut peer_rx).is_empty());
        assert_eq!(h.engine.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mid_turn_reconnect_sees_history_then_live_events_once() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (owner, mut owner_rx) = open(ws);
        ws.dispatch(&owner, ClientMessage::CreateTab { tab_name: None, optimistic_tab_id: None }).await;
        let tab_id = created_tab_id(&drain(&mut owner_rx));
        let session_id = ws.connections.session_for(owner.id, &tab_id).unwrap();
        let fake = h.engine.session(&session_id);
        let m1 = completed_movement("one", &["a"]);
        let m2 = completed_movement("two", &["b", "c"]);
        fake.push_history(m1.clone());
        fake.push_history(m2.clone());

        ws.dispatch(
            &owner,
            ClientMessage::Execute {
                tab_id: tab_id.clone(),
                prompt: "three".to_string(),
            },
        )
        .await;
        fake.emit(SessionEvent::Execution(ExecutionEvent::output("e1")));
        fake.emit(SessionEvent::Execution(ExecutionEvent::output("e2")));
        wait_for(&mut owner_rx, |m| matches!(m, ServerMessage::Output { text, .. } if text == "e2")).await;

        let (viewer, mut viewer_rx) = open(ws);
        ws.dispatch(&viewer, ClientMessage::InitTab { tab_id: tab_id.clone() }).await;
        match wait_for(&mut viewer_rx, |m| matches!(m, ServerMessage::TabInitialized { .. })).await {
            ServerMessage::TabInitialized {
                output_history,
                is_executing,
                execution_events,
                ..
            } => {
                let mut expected = lines_of(&m1);
                expected.extend(lines_of(&m2));
                assert_eq!(output_history, expected);
                assert!(is_executing);
                let events = execution_events.unwrap();
                assert_eq!(events[0].kind, ExecutionEventKind::MovementStart);
                let texts: Vec<&str> = events[1..].iter().map(|e| e.text()).collect();
                assert_eq!(texts, vec!["e1", "e2"]);
            }
            _ => unreachable!(),
        }

        fake.emit(SessionEvent::Execution(ExecutionEvent::output("e3")));
        fake.set_executing(false);
        fake.emit(SessionEvent::MovementComplete);

        let mut live = Vec::new();
        loop {
            let msg = wait_for(&mut viewer_rx, |_| true).await;
            if matches!(msg, ServerMessage::MovementComplete { .. }) {
                break;
            }
            live.push(msg);
        }
        let outputs: Vec<&str> = live
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Output { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(outputs, vec!["e3"]);

        wait_for(&mut owner_rx, |m| {
            matches!(m, ServerMessage::TabStateChanged { is_executing: false, has_unviewed_completion: true, .. })
        })
        .await;
        assert!(ws.lock_tabs().get(&tab_id).unwrap().has_unviewed_completion);
    }

    #[tokio::test]
    async fn tab_output_stays_with_its_tab() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (a, mut a_rx) = open(ws);
        let (b, mut b_rx) = open(ws);
        ws.dispatch(&a, ClientMessage::CreateTab { tab_name: None, optimistic_tab_id: None }).await;
        let tab_a = created_tab_id(&drain(&mut a_rx));
        drain(&mut b_rx);
        ws.dispatch(&b, ClientMessage::CreateTab { tab_name: None, optimistic_tab_id: None }).await;
        let tab_b = created_tab_id(&drain(&mut b_rx));
        drain(&mut a_rx);

        let session_a = ws.connections.session_for(a.id, &tab_a).unwrap();
        h.engine
            .session(&session_a)
            .emit(SessionEvent::Execution(ExecutionEvent::output("private")));
        wait_for(&mut a_rx, |m| matches!(m, ServerMessage::Output { .. })).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(drain(&mut b_rx).is_empty());

        ws.dispatch(&b, ClientMessage::RemoveTab { tab_id: tab_b.clone() }).await;
        assert_eq!(drain(&mut a_rx), vec![ServerMessage::TabRemoved { tab_id: tab_b.clone() }]);
        assert_eq!(drain(&mut b_rx), vec![ServerMessage::TabRemoved { tab_id: tab_b }]);
    }

    #[tokio::test]
    async fn unknown_targets_are_reported_to_the_sender_only() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (a, mut a_rx) = open(ws);
        let (_b, mut b_rx) = open(ws);

        ws.dispatch(
            &a,
            ClientMessage::Execute {
                tab_id: "ghost".to_string(),
                prompt: "hi".to_string(),
            },
        )
        .await;
        ws.dispatch(
            &a,
            ClientMessage::TerminalInput {
                terminal_id: "nope".to_string(),
                input: "ls\n".to_string(),
            },
        )
        .await;
        let msgs = drain(&mut a_rx);
        assert!(matches!(&msgs[0], ServerMessage::Error { tab_id: Some(t), .. } if t == "ghost"));
        assert!(matches!(&msgs[1], ServerMessage::TerminalError { terminal_id, instructions: None, .. } if terminal_id == "nope"));
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn cancel_notifies_immediately() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (a, mut a_rx) = open(ws);
        ws.dispatch(&a, ClientMessage::CreateTab { tab_name: None, optimistic_tab_id: None }).await;
        let tab_id = created_tab_id(&drain(&mut a_rx));
        ws.dispatch(&a, ClientMessage::Cancel { tab_id: tab_id.clone() }).await;
        assert_eq!(drain(&mut a_rx), vec![ServerMessage::Cancelled { tab_id: tab_id.clone() }]);
        let session_id = ws.connections.session_for(a.id, &tab_id).unwrap();
        assert!(h.engine.session(&session_id).cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shared_terminal_survives_one_viewer_leaving() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (a, mut a_rx) = open(ws);
        let (b, mut b_rx) = open(ws);
        let init = |terminal_id: &str| ClientMessage::TerminalInit {
            terminal_id: terminal_id.to_string(),
            shell: None,
            cols: 80,
            rows: 24,
        };

        ws.dispatch(&a, init("term")).await;
        let a_msgs = drain(&mut a_rx);
        assert!(matches!(&a_msgs[0], ServerMessage::TerminalReady { is_reconnect: false, persistent: false, .. }));
        assert!(a_msgs.contains(&ServerMessage::TerminalCreated {
            terminal_id: "term".to_string(),
            persistent: false
        }));
        drain(&mut b_rx);

        ws.dispatch(&b, init("term")).await;
        assert!(matches!(&drain(&mut b_rx)[0], ServerMessage::TerminalReady { is_reconnect: true, .. }));
        assert_eq!(h.pty.spawns.load(Ordering::SeqCst), 1);
        assert!(drain(&mut a_rx).is_empty());

        ws.close_connection(&b).await;
        h.pty.process(0).emit("still here\n");
        wait_for(&mut a_rx, |m| matches!(m, ServerMessage::TerminalOutput { output, .. } if output == "still here\n")).await;
        assert_eq!(ws.pty.subscriber_count("term"), 1);

        ws.dispatch(&a, ClientMessage::TerminalClose { terminal_id: "term".to_string() }).await;
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerMessage::TerminalClosed {
                terminal_id: "term".to_string()
            }]
        );
        assert!(!ws.pty.contains("term"));
    }

    #[tokio::test]
    async fn persistent_terminal_detaches_on_disconnect_and_closes_explicitly() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (a, mut a_rx) = open(ws);
        ws.dispatch(
            &a,
            ClientMessage::TerminalInitPersistent {
                terminal_id: "p1".to_string(),
                shell: None,
                cols: 80,
                rows: 24,
            },
        )
        .await;
        assert!(matches!(&drain(&mut a_rx)[0], ServerMessage::TerminalReady { persistent: true, is_reconnect: false, .. }));
        assert_eq!(ws.persistent.active_pollers(), 1);
        assert!(a.is_attached("p1").await);

        ws.close_connection(&a).await;
        assert_eq!(ws.persistent.active_pollers(), 0);
        assert!(h.multiplexer.pane("tabdock-p1").is_some());

        let (b, mut b_rx) = open(ws);
        ws.dispatch(
            &b,
            ClientMessage::TerminalReconnect {
                terminal_id: "p1".to_string(),
                cols: None,
                rows: None,
            },
        )
        .await;
        assert!(matches!(&drain(&mut b_rx)[0], ServerMessage::TerminalReady { persistent: true, is_reconnect: true, .. }));

        ws.dispatch(&b, ClientMessage::TerminalClose { terminal_id: "p1".to_string() }).await;
        assert!(drain(&mut b_rx).contains(&ServerMessage::TerminalClosed {
            terminal_id: "p1".to_string()
        }));
        assert_eq!(ws.persistent.active_pollers(), 0);
        assert!(h.multiplexer.pane("tabdock-p1").is_none());
    }

    #[tokio::test]
    async fn removing_a_tab_evicts_its_idle_session() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (a, mut a_rx) = open(ws);
        ws.dispatch(&a, ClientMessage::CreateTab { tab_name: None, optimistic_tab_id: None }).await;
        let idle_tab = created_tab_id(&drain(&mut a_rx));
        ws.dispatch(&a, ClientMessage::CreateTab { tab_name: None, optimistic_tab_id: None }).await;
        let busy_tab = created_tab_id(&drain(&mut a_rx));
        let idle = ws.connections.session_for(a.id, &idle_tab).unwrap();
        let busy = ws.connections.session_for(a.id, &busy_tab).unwrap();
        ws.dispatch(
            &a,
            ClientMessage::Execute {
                tab_id: busy_tab.clone(),
                prompt: "long".to_string(),
            },
        )
        .await;
        assert_eq!(ws.pump_count(), 2);

        ws.dispatch(&a, ClientMessage::RemoveTab { tab_id: idle_tab }).await;
        assert!(!ws.sessions.contains(&idle));
        assert_eq!(ws.broadcaster.listener_count(&idle), 0);
        assert_eq!(ws.pump_count(), 1);

        ws.dispatch(&a, ClientMessage::RemoveTab { tab_id: busy_tab }).await;
        assert!(ws.sessions.contains(&busy));
        assert_eq!(ws.pump_count(), 1);
    }

    #[tokio::test]
    async fn new_session_evicts_the_one_it_replaces() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (a, mut a_rx) = open(ws);
        ws.dispatch(&a, ClientMessage::CreateTab { tab_name: None, optimistic_tab_id: None }).await;
        let tab_id = created_tab_id(&drain(&mut a_rx));
        let old = ws.connections.session_for(a.id, &tab_id).unwrap();

        ws.dispatch(&a, ClientMessage::New { tab_id: tab_id.clone() }).await;
        let new = ws.connections.session_for(a.id, &tab_id).unwrap();
        assert_ne!(old, new);
        assert!(!ws.sessions.contains(&old));
        assert!(ws.sessions.contains(&new));
        assert_eq!(ws.sessions.len(), 1);
    }

    #[tokio::test]
    async fn zero_sized_terminal_is_rejected() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let ws = &h.workspace;
        let (a, mut a_rx) = open(ws);
        ws.dispatch(
            &a,
            ClientMessage::TerminalInit {
                terminal_id: "t".to_string(),
                shell: None,
                cols: 0,
                rows: 24,
            },
        )
        .await;
        match drain(&mut a_rx).as_slice() {
            [ServerMessage::TerminalError { terminal_id, error, .. }] => {
                assert_eq!(terminal_id, "t");
                assert!(error.starts_with("Invalid input argument"));
            }
            other => panic!("unexpected messages: {:?}", other),
        }
        assert_eq!(h.pty.spawns.load(Ordering::SeqCst), 0);
        assert!(!ws.pty.contains("t"));
    }
}
