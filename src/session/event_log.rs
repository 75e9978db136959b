use super::history::{ExecutionEvent, ExecutionEventKind};

/// Transient per-session record of the turn in progress, kept from its
/// movement start until its completion is delivered. A replay aid, never
/// authoritative history.
#[derive(Debug, Default, Clone)]
pub struct ExecutionEventLog {
    events: Vec<ExecutionEvent>,
}

impl ExecutionEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A movement start begins a fresh log.
    pub fn record(&mut self, event: ExecutionEvent) {
        if event.kind == ExecutionEventKind::MovementStart {
            self.events.clear();
        }
        self.events.push(event);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn snapshot(&self) -> Vec<ExecutionEvent> {
        self.events.clone()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
