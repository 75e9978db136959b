//! Decides which session a (connection, tab) pair is bound to, and builds the
//! one-time replay sent to that connection.

use crate::connection::ConnectionId;
use crate::error::AppError;
use crate::protocol::{Resolution, ServerMessage};
use crate::registry::{RegisteredTab, TabRegistry};
use crate::service::Workspace;
use crate::session::history::history_lines;
use crate::session::Session;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct Resolved {
    pub session: Arc<dyn Session>,
    pub resolution: Resolution,
    /// Session id the registry pointed at before a failed rehydration.
    pub previous_session_id: Option<String>,
    /// Set when the tab did not exist and was registered by this resolution.
    pub registered: Option<RegisteredTab>,
}

impl Workspace {
    /// Binds `tab_id` on `connection` to a session:
    /// 1. this connection's own binding, if that session is resident;
    /// 2. the registry's session, if resident;
    /// 3. the registry's session rehydrated from its history;
    /// 4. a new session, flagged as a fallback when step 3 failed.
    ///
    /// The registry lock is held throughout so concurrent resolutions of one
    /// tab agree on a single session.
    #[instrument(skip(self))]
    pub fn resolve_tab(&self, connection: ConnectionId, tab_id: &str) -> Result<Resolved, AppError> {
        let mut tabs = self.lock_tabs();
        let registered_id = tabs.get_tab_session(tab_id);

        if let Some(local_id) = self.connections.session_for(connection, tab_id) {
            if let Some(session) = self.sessions.get(&local_id) {
                let mut registered = None;
                if registered_id.as_deref() != Some(local_id.as_str()) {
                    warn!(
                        local = %local_id,
                        registry = ?registered_id,
                        "Connection binding and tab registry disagree, keeping the connection's session"
                    );
                    if registered_id.is_some() {
                        tabs.update_tab_session(tab_id, &local_id);
                    } else {
                        registered = Some(tabs.register_tab(tab_id, &local_id, None));
                    }
                }
                return Ok(self.bind(&mut tabs, connection, tab_id, session, Resolution::ReattachedLocal, None, registered));
            }
        }

        let Some(registered_id) = registered_id else {
            let session = self.create_session()?;
            let tab = tabs.register_tab(tab_id, session.id(), None);
            info!(session_id = session.id(), "Registered unknown tab with a new session");
            return Ok(self.bind(&mut tabs, connection, tab_id, session, Resolution::New, None, Some(tab)));
        };

        if let Some(session) = self.sessions.get(&registered_id) {
            return Ok(self.bind(&mut tabs, connection, tab_id, session, Resolution::ReattachedRegistry, None, None));
        }

        match self.engine.resume_from_history(&self.config.working_dir, &registered_id) {
            Ok(session) => {
                let session = self.admit(session);
                info!(session_id = session.id(), "Rehydrated session from history");
                Ok(self.bind(&mut tabs, connection, tab_id, session, Resolution::RehydratedFromDisk, None, None))
            }
            Err(e) => {
                warn!(session_id = %registered_id, error = %e, "Rehydration failed, starting a fresh session");
                let session = self.create_session()?;
                tabs.update_tab_session(tab_id, session.id());
                Ok(self.bind(
                    &mut tabs,
                    connection,
                    tab_id,
                    session,
                    Resolution::FailedFallback,
                    Some(registered_id),
                    None,
                ))
            }
        }
    }

    /// Points `tab_id` at a specific historical session, rehydrating it when
    /// it is not resident.
    #[instrument(skip(self))]
    pub fn resume_session(
        &self,
        connection: ConnectionId,
        tab_id: &str,
        historical_session_id: &str,
    ) -> Result<Resolved, AppError> {
        let mut tabs = self.lock_tabs();
        let (session, resolution) = match self.sessions.get(historical_session_id) {
            Some(session) => (session, Resolution::ReattachedRegistry),
            None => {
                let session = self
                    .engine
                    .resume_from_history(&self.config.working_dir, historical_session_id)?;
                (self.admit(session), Resolution::RehydratedFromDisk)
            }
        };
        let registered = self.point_tab(&mut tabs, tab_id, session.id());
        Ok(self.bind(&mut tabs, connection, tab_id, session, resolution, None, registered))
    }

    /// Replaces the tab's session with a brand new one.
    #[instrument(skip(self))]
    pub fn start_new_session(&self, connection: ConnectionId, tab_id: &str) -> Result<Resolved, AppError> {
        let mut tabs = self.lock_tabs();
        let session = self.create_session()?;
        let registered = self.point_tab(&mut tabs, tab_id, session.id());
        Ok(self.bind(&mut tabs, connection, tab_id, session, Resolution::New, None, registered))
    }

    fn point_tab(&self, tabs: &mut TabRegistry, tab_id: &str, session_id: &str) -> Option<RegisteredTab> {
        if tabs.update_tab_session(tab_id, session_id) {
            None
        } else {
            Some(tabs.register_tab(tab_id, session_id, None))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn bind(
        &self,
        tabs: &mut TabRegistry,
        connection: ConnectionId,
        tab_id: &str,
        session: Arc<dyn Session>,
        resolution: Resolution,
        previous_session_id: Option<String>,
        registered: Option<RegisteredTab>,
    ) -> Resolved {
        self.connections.bind(connection, tab_id, session.id());
        tabs.touch(tab_id);
        info!(tab_id, session_id = session.id(), ?resolution, "Tab resolved");
        Resolved {
            session,
            resolution,
            previous_session_id,
            registered,
        }
    }

    /// Sends `tabInitialized` to `connection` only and makes it a live
    /// listener of the session. Completed movements become display lines;
    /// the in-progress turn's events follow them while that turn is live.
    pub fn replay_to(&self, connection: ConnectionId, tab_id: &str, resolved: &Resolved) -> bool {
        let tab_name = self
            .lock_tabs()
            .get(tab_id)
            .map(|t| t.tab_name.clone())
            .unwrap_or_default();
        let session = &resolved.session;
        let info = session.info();
        let resolution = resolved.resolution;
        let previous_session_id = resolved.previous_session_id.clone();
        self.broadcaster
            .attach_with_replay(session.as_ref(), connection, tab_id, |history, execution_events| {
                ServerMessage::TabInitialized {
                    tab_id: tab_id.to_string(),
                    tab_name,
                    session: info,
                    resolution,
                    output_history: history_lines(&history),
                    is_executing: execution_events.is_some(),
                    execution_events,
                    previous_session_id,
                    context_lost: resolution == Resolution::FailedFallback,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::Resolution;
    use crate::service::testing::harness;
    use crate::session::testing::completed_movement;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    #[tokio::test]
    async fn repeated_resolution_is_idempotent() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let first = h.workspace.resolve_tab(1, "t1").unwrap();
        assert_eq!(first.resolution, Resolution::New);
        assert!(first.registered.is_some());
        for _ in 0..3 {
            let again = h.workspace.resolve_tab(1, "t1").unwrap();
            assert_eq!(again.session.id(), first.session.id());
            assert_eq!(again.resolution, Resolution::ReattachedLocal);
        }
        // Another connection finds it through the registry.
        let other = h.workspace.resolve_tab(2, "t1").unwrap();
        assert_eq!(other.session.id(), first.session.id());
        assert_eq!(other.resolution, Resolution::ReattachedRegistry);
        assert_eq!(h.engine.created.load(Ordering::SeqCst), 1);
        assert_eq!(h.workspace.sessions.len(), 1);
    }

    #[tokio::test]
    async fn registry_session_is_rehydrated_from_history() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        h.engine.store_history("s-old", vec![completed_movement("hi", &["hello"])]);
        h.workspace.lock_tabs().register_tab("t1", "s-old", None);

        let resolved = h.workspace.resolve_tab(1, "t1").unwrap();
        assert_eq!(resolved.resolution, Resolution::RehydratedFromDisk);
        assert_eq!(resolved.session.id(), "s-old");
        assert!(h.workspace.sessions.contains("s-old"));
        assert_eq!(h.engine.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_rehydration_falls_back_and_keeps_previous_id() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        h.workspace.lock_tabs().register_tab("t1", "s-lost", None);

        let resolved = h.workspace.resolve_tab(1, "t1").unwrap();
        assert_eq!(resolved.resolution, Resolution::FailedFallback);
        assert_eq!(resolved.previous_session_id.as_deref(), Some("s-lost"));
        assert_ne!(resolved.session.id(), "s-lost");
        assert_eq!(
            h.workspace.lock_tabs().get_tab_session("t1").as_deref(),
            Some(resolved.session.id())
        );
    }

    #[tokio::test]
    async fn connection_binding_wins_and_repairs_registry() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        let local = h.workspace.resolve_tab(1, "t1").unwrap();
        let stray = h.workspace.create_session().unwrap();
        h.workspace.lock_tabs().update_tab_session("t1", stray.id());

        let resolved = h.workspace.resolve_tab(1, "t1").unwrap();
        assert_eq!(resolved.resolution, Resolution::ReattachedLocal);
        assert_eq!(resolved.session.id(), local.session.id());
        assert_eq!(
            h.workspace.lock_tabs().get_tab_session("t1").as_deref(),
            Some(local.session.id())
        );
    }

    #[tokio::test]
    async fn resume_unknown_history_is_an_error() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path()).await;
        assert!(h.workspace.resume_session(1, "t1", "missing").is_err());
        assert!(h.workspace.lock_tabs().get("t1").is_none());
    }
}
