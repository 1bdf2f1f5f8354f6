//! Progress/log sink. The engine is the only producer; UIs read snapshots.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, info};
use udise_core::{LogEvent, LogKind};

pub const DEFAULT_LOG_CAPACITY: usize = 5_000;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: LogEvent);

    /// Called when a new analysis begins. Sinks may drop earlier events.
    fn start_segment(&self) {}
}

/// Events after a poller's offset. Offsets are absolute and never reused.
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<LogEvent>,
    /// Offset to pass as `since` on the next poll.
    pub next: usize,
    /// Offset of the oldest retained event; a `since` below it missed events.
    pub first: usize,
}

#[derive(Debug, Default)]
struct LogState {
    events: VecDeque<LogEvent>,
    dropped: usize,
}

/// Bounded in-memory event log for the current analysis/run, mirrored to `tracing`.
#[derive(Debug)]
pub struct EventLog {
    state: Mutex<LogState>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retained events, oldest first.
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.state().events.iter().cloned().collect()
    }

    pub fn since(&self, offset: usize) -> EventPage {
        let state = self.state();
        let skip = offset.saturating_sub(state.dropped);
        EventPage {
            events: state.events.iter().skip(skip).cloned().collect(),
            next: state.dropped + state.events.len(),
            first: state.dropped,
        }
    }

    pub fn len(&self) -> usize {
        self.state().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_kind(&self, kind: LogKind) -> usize {
        self.state().events.iter().filter(|e| e.kind == kind).count()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: LogEvent) {
        let code = event.udise_code.as_deref().unwrap_or("-");
        let stage = event.stage.as_deref().unwrap_or("-");
        match event.kind {
            LogKind::Error => error!(udise_code = code, stage, "{}", event.message),
            LogKind::Info | LogKind::Success => {
                info!(kind = ?event.kind, udise_code = code, "{}", event.message)
            }
        }
        let mut state = self.state();
        state.events.push_back(event);
        while state.events.len() > self.capacity {
            state.events.pop_front();
            state.dropped += 1;
        }
    }

    fn start_segment(&self) {
        let mut state = self.state();
        state.dropped += state.events.len();
        state.events.clear();
    }
}
