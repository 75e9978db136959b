use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Tab not found: {0}")]
    TabNotFound(String),

    #[error("Terminal not found: {0}")]
    TerminalNotFound(String),

    #[error("Session not found for ID: {0}")]
    SessionNotFound(String),

    #[error("Terminal facility unavailable: {reason}")]
    FacilityUnavailable { reason: String, instructions: String },

    #[error("Failed to rehydrate session {session_id}: {reason}")]
    RehydrationFailed { session_id: String, reason: String },

    #[error("Multiplexer command failed: {0}")]
    MultiplexerError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Session is busy: {0}")]
    SessionBusy(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),
}

impl AppError {
    /// Remediation text for errors the user can fix on their host.
    pub fn instructions(&self) -> Option<&str> {
        match self {
            AppError::FacilityUnavailable { instructions, .. } => Some(instructions.as_str()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AppError::TabNotFound(_) | AppError::TerminalNotFound(_) | AppError::SessionNotFound(_)
        )
    }
}
