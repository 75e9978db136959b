//! Messages exchanged with connected clients. Every variant carries exactly
//! the fields it needs; there is no free-form `data` bag.

use crate::registry::RegisteredTab;
use crate::session::history::{ExecutionEvent, ExecutionEventKind};
use crate::session::{DisplayLine, SessionInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    InitTab {
        tab_id: String,
    },
    ResumeSession {
        tab_id: String,
        historical_session_id: String,
    },
    Execute {
        tab_id: String,
        prompt: String,
    },
    Cancel {
        tab_id: String,
    },
    New {
        tab_id: String,
    },
    ApprovalResponse {
        tab_id: String,
        approved: bool,
    },
    TerminalInit {
        terminal_id: String,
        #[serde(default)]
        shell: Option<String>,
        cols: u16,
        rows: u16,
    },
    TerminalReconnect {
        terminal_id: String,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    TerminalInitPersistent {
        terminal_id: String,
        #[serde(default)]
        shell: Option<String>,
        cols: u16,
        rows: u16,
    },
    TerminalInput {
        terminal_id: String,
        input: String,
    },
    TerminalResize {
        terminal_id: String,
        cols: u16,
        rows: u16,
    },
    TerminalClose {
        terminal_id: String,
    },
    GetActiveTabs,
    CreateTab {
        #[serde(default)]
        tab_name: Option<String>,
        #[serde(default)]
        optimistic_tab_id: Option<String>,
    },
    RenameTab {
        tab_id: String,
        tab_name: String,
    },
    ReorderTabs {
        tab_order: Vec<String>,
    },
    RemoveTab {
        tab_id: String,
    },
    MarkTabViewed {
        tab_id: String,
    },
}

/// How a tab was bound to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    ReattachedLocal,
    ReattachedRegistry,
    RehydratedFromDisk,
    New,
    FailedFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    TabInitialized {
        tab_id: String,
        tab_name: String,
        #[serde(flatten)]
        session: SessionInfo,
        resolution: Resolution,
        output_history: Vec<DisplayLine>,
        is_executing: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_events: Option<Vec<ExecutionEvent>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_session_id: Option<String>,
        context_lost: bool,
    },
    ActiveTabs {
        tabs: Vec<RegisteredTab>,
    },
    TabCreated {
        #[serde(flatten)]
        tab: RegisteredTab,
        #[serde(skip_serializing_if = "Option::is_none")]
        optimistic_tab_id: Option<String>,
    },
    TabRemoved {
        tab_id: String,
    },
    TabRenamed {
        tab_id: String,
        tab_name: String,
    },
    TabsReordered {
        tab_order: Vec<String>,
    },
    TabViewed {
        tab_id: String,
    },
    TabStateChanged {
        tab_id: String,
        is_executing: bool,
        has_unviewed_completion: bool,
    },
    Output {
        tab_id: String,
        text: String,
    },
    Thinking {
        tab_id: String,
        text: String,
    },
    ToolUse {
        tab_id: String,
        tool: String,
        input: Value,
    },
    MovementStart {
        tab_id: String,
        prompt: String,
    },
    MovementComplete {
        tab_id: String,
    },
    MovementError {
        tab_id: String,
        error: String,
    },
    SessionUpdate {
        tab_id: String,
        #[serde(flatten)]
        session: SessionInfo,
    },
    Cancelled {
        tab_id: String,
    },
    TerminalReady {
        terminal_id: String,
        shell: String,
        cwd: String,
        is_reconnect: bool,
        persistent: bool,
    },
    TerminalScrollback {
        terminal_id: String,
        lines: Vec<String>,
    },
    TerminalOutput {
        terminal_id: String,
        output: String,
    },
    TerminalExit {
        terminal_id: String,
        exit_code: Option<i32>,
    },
    TerminalError {
        terminal_id: String,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
    TerminalCreated {
        terminal_id: String,
        persistent: bool,
    },
    TerminalClosed {
        terminal_id: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        tab_id: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    /// Live delivery form of an execution event for one tab.
    pub fn from_execution_event(tab_id: &str, event: &ExecutionEvent) -> Self {
        let tab_id = tab_id.to_string();
        match event.kind {
            ExecutionEventKind::Output => ServerMessage::Output {
                tab_id,
                text: event.text().to_string(),
            },
            ExecutionEventKind::Thinking => ServerMessage::Thinking {
                tab_id,
                text: event.text().to_string(),
            },
            ExecutionEventKind::ToolUse => ServerMessage::ToolUse {
                tab_id,
                tool: event.tool().to_string(),
                input: event.tool_input(),
            },
            ExecutionEventKind::MovementStart => ServerMessage::MovementStart {
                tab_id,
                prompt: event.prompt().to_string(),
            },
        }
    }

    pub fn error(tab_id: Option<&str>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            tab_id: tab_id.map(str::to_string),
            message: message.into(),
        }
    }
}
