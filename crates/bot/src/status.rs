//! Process-wide run state and log ring, pushed to observers as events.

use chrono::Local;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub const DEFAULT_LOG_CAPACITY: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BotPhase {
    Stopped,
    Starting,
    Running,
    Restarting,
    Stopping,
}

/// Snapshot of the bot as reported to the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub phase: BotPhase,
    pub last_error: Option<String>,
    pub connected: bool,
    pub last_action: Option<String>,
    pub secret_misconfigured: bool,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            running: false,
            phase: BotPhase::Stopped,
            last_error: None,
            connected: false,
            last_action: None,
            secret_misconfigured: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub ts: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogLine {
    /// `[HH:MM:SS] message`
    pub fn render(&self) -> String {
        format!("[{}] {}", self.ts, self.message)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotEvent {
    /// Sent once to each new observer.
    Hello {
        status: StatusSnapshot,
        logs: Vec<LogLine>,
    },
    Snapshot {
        status: StatusSnapshot,
    },
    Log {
        line: LogLine,
    },
}

struct HubState {
    status: StatusSnapshot,
    logs: VecDeque<LogLine>,
}

/// Single owner of `StatusSnapshot` and the log ring.
///
/// All mutation goes through the hub; every change is published on a
/// broadcast channel. The lock is never held across an await.
pub struct StatusHub {
    state: Mutex<HubState>,
    capacity: usize,
    events: broadcast::Sender<BotEvent>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(HubState {
                status: StatusSnapshot::default(),
                logs: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            }),
            capacity: capacity.max(1),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().status.clone()
    }

    pub fn logs(&self) -> Vec<LogLine> {
        self.lock().logs.iter().cloned().collect()
    }

    /// Status and full log ring, taken under one lock.
    pub fn hello(&self) -> BotEvent {
        let state = self.lock();
        BotEvent::Hello {
            status: state.status.clone(),
            logs: state.logs.iter().cloned().collect(),
        }
    }

    /// Apply `f` and publish a snapshot if anything changed.
    pub fn update(&self, f: impl FnOnce(&mut StatusSnapshot)) {
        let changed = {
            let mut state = self.lock();
            let before = state.status.clone();
            f(&mut state.status);
            (state.status != before).then(|| state.status.clone())
        };
        if let Some(status) = changed {
            let _ = self.events.send(BotEvent::Snapshot { status });
        }
    }

    pub fn set_phase(&self, phase: BotPhase) {
        self.update(|s| {
            s.phase = phase;
            s.running = matches!(phase, BotPhase::Running | BotPhase::Restarting);
        });
    }

    pub fn set_last_error(&self, err: Option<String>) {
        self.update(|s| s.last_error = err);
    }

    pub fn set_connected(&self, connected: bool) {
        self.update(|s| s.connected = connected);
    }

    pub fn set_last_action(&self, action: &str) {
        let action = action.to_string();
        self.update(|s| s.last_action = Some(action));
    }

    pub fn set_secret_misconfigured(&self, flag: bool) {
        self.update(|s| s.secret_misconfigured = flag);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(target: "replydesk::activity", "{}", message),
            LogLevel::Warn => warn!(target: "replydesk::activity", "{}", message),
            LogLevel::Error => error!(target: "replydesk::activity", "{}", message),
        }
        let line = LogLine {
            ts: Local::now().format("%H:%M:%S").to_string(),
            level,
            message,
        };
        {
            let mut state = self.lock();
            while state.logs.len() >= self.capacity {
                state.logs.pop_front();
            }
            state.logs.push_back(line.clone());
        }
        let _ = self.events.send(BotEvent::Log { line });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}
