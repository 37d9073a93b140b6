//! # Terminal sessions
//!
//! A [`Session`] is one shell process plus its pseudo-terminal, addressed by an
//! opaque id. Sessions are owned by the [`SessionRegistry`]; connections only
//! hold ids and [`Subscription`]s.
//!
//! ## Fan-out
//!
//! Every session owns a `tokio::sync::broadcast` channel. Output is appended to
//! the capped history and published on the channel inside the same critical
//! section, and [`Session::attach`] snapshots the history and subscribes inside
//! that section too. A new viewer therefore sees every chunk exactly once:
//! either in the replayed history or on the live stream, never both.
//!
//! A subscriber that falls more than [`BROADCAST_CAPACITY`] chunks behind loses
//! the oldest ones instead of stalling the other viewers.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::pty::{PtyControl, TerminalSize};

mod history;
mod registry;

pub use history::OutputHistory;
pub use registry::{DEFAULT_HISTORY_BYTES, SPAWN_FAILURE_EXIT_CODE, SessionRegistry};

/// Chunks buffered per subscriber before it starts lagging.
pub const BROADCAST_CAPACITY: usize = 1024;

/// Live events published by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output(Bytes),
    Exit(i32),
}

/// What the protocol layer reports about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    pub cols: u16,
    pub rows: u16,
}

struct SessionState {
    history: OutputHistory,
    size: TerminalSize,
    exit_code: Option<i32>,
}

pub struct Session {
    id: String,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
    /// `None` when the shell never started.
    control: Option<Box<dyn PtyControl>>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        cwd: PathBuf,
        size: TerminalSize,
        history_bytes: usize,
        control: Option<Box<dyn PtyControl>>,
    ) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            id,
            cwd,
            created_at: Utc::now(),
            control,
            state: Mutex::new(SessionState {
                history: OutputHistory::new(history_bytes),
                size,
                exit_code: None,
            }),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn is_alive(&self) -> bool {
        self.state().exit_code.is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state().exit_code
    }

    pub fn summary(&self) -> SessionSummary {
        let size = self.state().size;
        SessionSummary {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            created_at: self.created_at,
            cols: size.cols,
            rows: size.rows,
        }
    }

    pub fn history(&self) -> Bytes {
        self.state().history.snapshot()
    }

    /// Snapshot the history and subscribe to everything produced after it.
    pub fn attach(&self) -> Attachment {
        let state = self.state();
        let receiver = self.events.subscribe();
        Attachment {
            history: state.history.snapshot(),
            exit_code: state.exit_code,
            subscription: Subscription {
                session_id: self.id.clone(),
                receiver,
            },
        }
    }

    #[cfg(test)]
    fn viewer_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Forward keystrokes. Dropped once the shell has exited.
    pub fn write(&self, data: &[u8]) {
        if !self.is_alive() {
            return;
        }
        if let Some(control) = &self.control {
            if let Err(e) = control.write(data) {
                warn!("Dropping {} input bytes for session {}: {}", data.len(), self.id, e);
            }
        }
    }

    /// Resize the terminal. A no-op once the shell has exited or for a zero dimension.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        let mut state = self.state();
        if state.exit_code.is_some() {
            return;
        }
        let size = TerminalSize { cols, rows };
        if let Some(control) = &self.control {
            if let Err(e) = control.resize(size) {
                warn!("Resize of session {} to {}x{} failed: {}", self.id, cols, rows, e);
                return;
            }
        }
        state.size = size;
        debug!("Resized session {} to {}x{}", self.id, cols, rows);
    }

    pub(crate) async fn terminate(&self, grace: Duration) {
        if !self.is_alive() {
            return;
        }
        if let Some(control) = &self.control {
            if let Err(e) = control.terminate(grace).await {
                warn!("Failed to terminate session {}: {}", self.id, e);
            }
        }
    }

    pub(crate) fn record_output(&self, chunk: Bytes) {
        let mut state = self.state();
        if state.exit_code.is_some() {
            return;
        }
        state.history.push(&chunk);
        // Err only means nobody is attached right now.
        let _ = self.events.send(SessionEvent::Output(chunk));
    }

    /// Returns `false` if the exit was already recorded.
    pub(crate) fn record_exit(&self, code: i32) -> bool {
        let mut state = self.state();
        if state.exit_code.is_some() {
            return false;
        }
        state.exit_code = Some(code);
        let _ = self.events.send(SessionEvent::Exit(code));
        true
    }
}

/// Result of [`Session::attach`]: the replay snapshot plus the live stream after it.
pub struct Attachment {
    pub history: Bytes,
    /// Set when the shell had already exited at attach time; no `Exit` event will follow.
    pub exit_code: Option<i32>,
    pub subscription: Subscription,
}

/// A connection's handle on one session's live events. Dropping it unsubscribes.
pub struct Subscription {
    session_id: String,
    receiver: broadcast::Receiver<SessionEvent>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, skipping over chunks lost to lag. `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscriber of session {} lagged, skipped {} output chunks",
                        self.session_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
