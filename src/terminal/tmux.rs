use crate::error::AppError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio as StdProcessStdio;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, error, instrument, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A terminal multiplexer whose sessions live outside this process.
#[async_trait]
pub trait Multiplexer: Send + Sync {
    fn is_available(&self) -> bool;
    async fn list_sessions(&self) -> Result<Vec<String>, AppError>;
    async fn has_session(&self, name: &str) -> Result<bool, AppError>;
    async fn new_session(&self, name: &str, cwd: &Path, shell: &str, cols: u16, rows: u16) -> Result<(), AppError>;
    /// Sends `data` as literal keystrokes, without key-name interpretation.
    async fn send_literal(&self, name: &str, data: &str) -> Result<(), AppError>;
    async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), AppError>;
    /// Visible pane plus up to `history_lines` of history, with escapes kept.
    async fn capture_pane(&self, name: &str, history_lines: usize) -> Result<String, AppError>;
    async fn kill_session(&self, name: &str) -> Result<(), AppError>;
}

pub fn tmux_unavailable(binary: &str) -> AppError {
    AppError::FacilityUnavailable {
        reason: format!("tmux executable '{}' not found", binary),
        instructions: "Install tmux (macOS: `brew install tmux`, Debian/Ubuntu: `sudo apt install tmux`, Fedora: `sudo dnf install tmux`) or point TMUX_BINARY at an existing tmux binary, then restart the server.".to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct Tmux {
    binary: String,
    resolved: Option<PathBuf>,
}

impl Tmux {
    pub fn new(binary: &str) -> Self {
        let resolved = which::which(binary).ok();
        if resolved.is_none() {
            warn!(binary, "tmux not found. Persistent terminals are disabled.");
        }
        Self {
            binary: binary.to_string(),
            resolved,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, AppError> {
        let Some(program) = &self.resolved else {
            return Err(tmux_unavailable(&self.binary));
        };
        let mut cmd = TokioCommand::new(program);
        cmd.args(args);
        cmd.stdin(StdProcessStdio::null());
        cmd.stdout(StdProcessStdio::piped());
        cmd.stderr(StdProcessStdio::piped());
        cmd.kill_on_drop(true);
        debug!("Executing tmux command: {:?}", cmd);

        match timeout(COMMAND_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                error!("Failed to run tmux {:?}: {}", args.first(), e);
                Err(AppError::MultiplexerError(format!("Failed to run tmux: {}", e)))
            }
            Err(_) => Err(AppError::MultiplexerError(format!(
                "tmux {} timed out after {:?}",
                args.first().unwrap_or(&""),
                COMMAND_TIMEOUT
            ))),
        }
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String, AppError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::MultiplexerError(format!(
                "tmux {} failed (status: {:?}): {}",
                args.first().unwrap_or(&""),
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `=` makes tmux match the session name exactly instead of by prefix.
fn exact(name: &str) -> String {
    format!("={}", name)
}

#[async_trait]
impl Multiplexer for Tmux {
    fn is_available(&self) -> bool {
        self.resolved.is_some()
    }

    async fn list_sessions(&self) -> Result<Vec<String>, AppError> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}"]).await?;
        if !output.status.success() {
            // No server running means no sessions.
            debug!(
                "tmux list-sessions returned {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn has_session(&self, name: &str) -> Result<bool, AppError> {
        let output = self.run(&["has-session", "-t", &exact(name)]).await?;
        Ok(output.status.success())
    }

    #[instrument(skip(self, cwd))]
    async fn new_session(&self, name: &str, cwd: &Path, shell: &str, cols: u16, rows: u16) -> Result<(), AppError> {
        let cwd = cwd.to_string_lossy();
        let (cols, rows) = (cols.to_string(), rows.to_string());
        self.run_checked(&["new-session", "-d", "-s", name, "-x", &cols, "-y", &rows, "-c", &cwd, shell])
            .await?;
        // Keep the pane's size under our control rather than the smallest client's.
        if let Err(e) = self
            .run_checked(&["set-option", "-t", &exact(name), "window-size", "manual"])
            .await
        {
            debug!(error = %e, "Could not set manual window-size");
        }
        Ok(())
    }

    async fn send_literal(&self, name: &str, data: &str) -> Result<(), AppError> {
        self.run_checked(&["send-keys", "-t", name, "-l", "--", data]).await.map(|_| ())
    }

    async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), AppError> {
        let (cols, rows) = (cols.to_string(), rows.to_string());
        self.run_checked(&["resize-window", "-t", name, "-x", &cols, "-y", &rows])
            .await
            .map(|_| ())
    }

    async fn capture_pane(&self, name: &str, history_lines: usize) -> Result<String, AppError> {
        let start = format!("-{}", history_lines);
        self.run_checked(&["capture-pane", "-p", "-e", "-J", "-t", name, "-S", &start])
            .await
    }

    #[instrument(skip(self))]
    async fn kill_session(&self, name: &str) -> Result<(), AppError> {
        self.run_checked(&["kill-session", "-t", &exact(name)]).await.map(|_| ())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Default)]
    pub struct FakePane {
        pub cwd: PathBuf,
        pub shell: String,
        pub size: (u16, u16),
        pub content: String,
        pub input: String,
    }

    /// In-memory stand-in for a tmux server.
    #[derive(Default)]
    pub struct FakeMultiplexer {
        pub sessions: Mutex<BTreeMap<String, FakePane>>,
        pub unavailable: bool,
        pub created: Mutex<Vec<String>>,
        pub killed: Mutex<Vec<String>>,
        pub capture_delay: Mutex<Duration>,
    }

    impl FakeMultiplexer {
        pub fn with_sessions(names: &[&str]) -> Self {
            let fake = Self::default();
            for name in names {
                fake.sessions.lock().unwrap().insert(name.to_string(), FakePane::default());
            }
            fake
        }

        pub fn set_content(&self, name: &str, content: &str) {
            if let Some(pane) = self.sessions.lock().unwrap().get_mut(name) {
                pane.content = content.to_string();
            }
        }

        /// Simulates the session dying outside our control.
        pub fn vanish(&self, name: &str) {
            self.sessions.lock().unwrap().remove(name);
        }

        pub fn pane(&self, name: &str) -> Option<FakePane> {
            self.sessions.lock().unwrap().get(name).cloned()
        }

        fn check(&self) -> Result<(), AppError> {
            if self.unavailable {
                return Err(tmux_unavailable("tmux"));
            }
            Ok(())
        }

        fn missing(name: &str) -> AppError {
            AppError::MultiplexerError(format!("can't find session: {}", name))
        }
    }

    #[async_trait]
    impl Multiplexer for FakeMultiplexer {
        fn is_available(&self) -> bool {
            !self.unavailable
        }

        async fn list_sessions(&self) -> Result<Vec<String>, AppError> {
            self.check()?;
            Ok(self.sessions.lock().unwrap().keys().cloned().collect())
        }

        async fn has_session(&self, name: &str) -> Result<bool, AppError> {
            self.check()?;
            Ok(self.sessions.lock().unwrap().contains_key(name))
        }

        async fn new_session(&self, name: &str, cwd: &Path, shell: &str, cols: u16, rows: u16) -> Result<(), AppError> {
            self.check()?;
            self.created.lock().unwrap().push(name.to_string());
            self.sessions.lock().unwrap().insert(
                name.to_string(),
                FakePane {
                    cwd: cwd.to_path_buf(),
                    shell: shell.to_string(),
                    size: (cols, rows),
                    ..Default::default()
                },
            );
            Ok(())
        }

        async fn send_literal(&self, name: &str, data: &str) -> Result<(), AppError> {
            self.check()?;
            let mut sessions = self.sessions.lock().unwrap();
            let pane = sessions.get_mut(name).ok_or_else(|| Self::missing(name))?;
            pane.input.push_str(data);
            Ok(())
        }

        async fn resize(&self, name: &str, cols: u16, rows: u16) -> Result<(), AppError> {
            self.check()?;
            let mut sessions = self.sessions.lock().unwrap();
            let pane = sessions.get_mut(name).ok_or_else(|| Self::missing(name))?;
            pane.size = (cols, rows);
            Ok(())
        }

        async fn capture_pane(&self, name: &str, _history_lines: usize) -> Result<String, AppError> {
            self.check()?;
            let delay = *self.capture_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let sessions = self.sessions.lock().unwrap();
            sessions
                .get(name)
                .map(|p| p.content.clone())
                .ok_or_else(|| Self::missing(name))
        }

        async fn kill_session(&self, name: &str) -> Result<(), AppError> {
            self.check()?;
            self.killed.lock().unwrap().push(name.to_string());
            self.sessions
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Self::missing(name))
        }
    }
}
