use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionEventKind {
    Output,
    Thinking,
    ToolUse,
    MovementStart,
}

/// One event produced while a prompt is executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub kind: ExecutionEventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn output(text: impl Into<String>) -> Self {
        Self::new(ExecutionEventKind::Output, json!({ "text": text.into() }))
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self::new(ExecutionEventKind::Thinking, json!({ "text": text.into() }))
    }

    pub fn tool_use(tool: impl Into<String>, input: Value) -> Self {
        Self::new(ExecutionEventKind::ToolUse, json!({ "tool": tool.into(), "input": input }))
    }

    pub fn movement_start(prompt: impl Into<String>) -> Self {
        Self::new(ExecutionEventKind::MovementStart, json!({ "prompt": prompt.into() }))
    }

    fn new(kind: ExecutionEventKind, data: Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn text(&self) -> &str {
        self.data.get("text").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn prompt(&self) -> &str {
        self.data.get("prompt").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn tool(&self) -> &str {
        self.data.get("tool").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn tool_input(&self) -> Value {
        self.data.get("input").cloned().unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MovementStatus {
    Completed,
    Failed,
    Cancelled,
}

/// A completed turn: the prompt and everything it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub id: String,
    pub prompt: String,
    pub events: Vec<ExecutionEvent>,
    pub status: MovementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DisplayKind {
    Prompt,
    Output,
    Thinking,
    ToolUse,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayLine {
    pub kind: DisplayKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Flattens one movement into the lines a client renders for it.
pub fn lines_of(movement: &Movement) -> Vec<DisplayLine> {
    let mut lines = Vec::with_capacity(movement.events.len() + 2);
    lines.push(DisplayLine {
        kind: DisplayKind::Prompt,
        text: movement.prompt.clone(),
        timestamp: movement.started_at,
    });
    for event in &movement.events {
        let (kind, text) = match event.kind {
            ExecutionEventKind::MovementStart => continue,
            ExecutionEventKind::Output => (DisplayKind::Output, event.text().to_string()),
            ExecutionEventKind::Thinking => (DisplayKind::Thinking, event.text().to_string()),
            ExecutionEventKind::ToolUse => (
                DisplayKind::ToolUse,
                format!("{} {}", event.tool(), event.tool_input()),
            ),
        };
        lines.push(DisplayLine {
            kind,
            text,
            timestamp: event.timestamp,
        });
    }
    if movement.status != MovementStatus::Completed {
        let text = movement
            .error
            .clone()
            .unwrap_or_else(|| "cancelled".to_string());
        lines.push(DisplayLine {
            kind: DisplayKind::Error,
            text,
            timestamp: movement.completed_at,
        });
    }
    lines
}

pub fn history_lines(movements: &[Movement]) -> Vec<DisplayLine> {
    movements.iter().flat_map(lines_of).collect()
}
