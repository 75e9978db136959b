use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub working_dir: PathBuf,
    pub state_dir: PathBuf,
    pub default_shell: Option<String>,
    pub agent_command: Option<String>,
    pub log_level: String,
    pub server_host: String,
    pub server_port: u16,
    pub tmux_binary: String,
    pub tmux_poll_interval: Duration,
    pub persistent_scrollback_lines: usize,
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .with_context(|| format!("Invalid {}", key))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let working_dir = match std::env::var("WORKING_DIR") {
            Ok(dir) if !dir.is_empty() => expand_tilde(&dir),
            _ => std::env::current_dir().context("Failed to read current directory")?,
        };
        let working_dir = dunce::canonicalize(&working_dir)
            .with_context(|| format!("Failed to canonicalize WORKING_DIR: {}", working_dir.display()))?;
        if !working_dir.is_dir() {
            anyhow::bail!("WORKING_DIR is not a valid directory: {:?}", working_dir);
        }

        let mut config = Self::for_working_dir(&working_dir);

        if let Some(state_dir) = std::env::var("STATE_DIR").ok().filter(|s| !s.is_empty()) {
            config.state_dir = expand_tilde(&state_dir);
        }

        config.default_shell = std::env::var("DEFAULT_SHELL").ok().filter(|s| !s.is_empty());
        config.agent_command = std::env::var("AGENT_COMMAND").ok().filter(|s| !s.is_empty());

        config.log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        config.server_host = std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        config.server_port = parse_env("SERVER_PORT", "3030")?;

        config.tmux_binary = std::env::var("TMUX_BINARY").unwrap_or_else(|_| "tmux".to_string());
        let poll_ms: u64 = parse_env("TMUX_POLL_INTERVAL_MS", "100")?;
        anyhow::ensure!(poll_ms > 0, "TMUX_POLL_INTERVAL_MS must be greater than zero");
        config.tmux_poll_interval = Duration::from_millis(poll_ms);
        config.persistent_scrollback_lines = parse_env("PERSISTENT_SCROLLBACK_LINES", "1000")?;

        Ok(config)
    }

    /// Defaults for a working directory, without consulting the environment.
    pub fn for_working_dir(working_dir: &Path) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            state_dir: working_dir.join(".tabdock"),
            default_shell: None,
            agent_command: None,
            log_level: "info".to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: 3030,
            tmux_binary: "tmux".to_string(),
            tmux_poll_interval: Duration::from_millis(100),
            persistent_scrollback_lines: 1000,
        }
    }

    pub fn tab_registry_file(&self) -> PathBuf {
        self.state_dir.join("tabs.json")
    }

    pub fn persistent_terminal_registry_file(&self) -> PathBuf {
        self.state_dir.join("persistent-terminals.json")
    }

    pub fn session_history_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    /// Shell used when a terminal request does not name one.
    pub fn resolve_shell(&self, requested: Option<&str>) -> String {
        if let Some(shell) = requested.filter(|s| !s.is_empty()) {
            return shell.to_string();
        }
        if let Some(shell) = &self.default_shell {
            return shell.clone();
        }
        if cfg!(windows) {
            return "powershell.exe".to_string();
        }
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
    }
}
