use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Session, SessionSummary};
use crate::error::Error;
use crate::pty::{PtyEvent, PtySpawner, TERMINATE_GRACE, TerminalSize};

/// Default per-session scrollback kept for replay (256 KiB).
pub const DEFAULT_HISTORY_BYTES: usize = 256 * 1024;

/// Exit code reported for a session whose shell never started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 1;

/// Concurrent session storage keyed by session id.
type SessionMap = Arc<DashMap<String, Arc<Session>>>;

/// Owner of every live session.
///
/// One instance is created at startup and shared (behind an `Arc`) by the HTTP
/// handlers and every WebSocket connection.
pub struct SessionRegistry {
    sessions: SessionMap,
    spawner: Arc<dyn PtySpawner>,
    history_bytes: usize,
}

impl SessionRegistry {
    pub fn new(spawner: Arc<dyn PtySpawner>, history_bytes: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            spawner,
            history_bytes,
        }
    }

    /// Start a shell in `cwd` and register it.
    ///
    /// Never fails. If the shell cannot be spawned the returned session has
    /// already exited with [`SPAWN_FAILURE_EXIT_CODE`] and is not registered.
    /// Opening the PTY and forking the shell run on the blocking pool.
    pub async fn create(&self, cwd: PathBuf) -> Arc<Session> {
        let session_id = Uuid::new_v4().to_string();
        let size = TerminalSize::default();

        let spawned = {
            let spawner = self.spawner.clone();
            let cwd = cwd.clone();
            tokio::task::spawn_blocking(move || spawner.spawn(&cwd, size))
                .await
                .unwrap_or_else(|e| Err(Error::Spawn(e.to_string())))
        };

        match spawned {
            Ok(spawned) => {
                let session = Arc::new(Session::new(
                    session_id.clone(),
                    cwd,
                    size,
                    self.history_bytes,
                    Some(spawned.control),
                ));
                self.sessions.insert(session_id.clone(), session.clone());
                tokio::spawn(pump_events(
                    session.clone(),
                    spawned.events,
                    self.sessions.clone(),
                ));
                info!(
                    "Created session {} in {} (total sessions: {})",
                    session_id,
                    session.cwd().display(),
                    self.sessions.len()
                );
                session
            }
            Err(e) => {
                warn!(
                    "Failed to start shell for session {} in {}: {}",
                    session_id,
                    cwd.display(),
                    e
                );
                let session = Arc::new(Session::new(
                    session_id,
                    cwd,
                    size,
                    self.history_bytes,
                    None,
                ));
                session.record_exit(SPAWN_FAILURE_EXIT_CODE);
                session
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    /// Summaries of every live session, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn get_history(&self, session_id: &str) -> Option<Bytes> {
        self.get(session_id).map(|session| session.history())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Unregister and terminate a session. Unknown ids are ignored.
    pub async fn destroy(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        info!(
            "Destroying session {} (remaining sessions: {})",
            session_id,
            self.sessions.len()
        );
        session.terminate(TERMINATE_GRACE).await;
    }

    /// Terminate every session concurrently. Used once at shutdown.
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if ids.is_empty() {
            return;
        }
        info!("Destroying {} sessions", ids.len());
        join_all(ids.iter().map(|id| self.destroy(id))).await;
    }
}

/// Copies PTY events into the session until the shell exits, then unregisters it.
async fn pump_events(
    session: Arc<Session>,
    mut events: mpsc::Receiver<PtyEvent>,
    sessions: SessionMap,
) {
    let mut exit_code = None;
    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Output(chunk) => session.record_output(chunk),
            PtyEvent::Exit(code) => {
                exit_code = Some(code);
                break;
            }
        }
    }

    // A closed channel without an exit event means the PTY workers died.
    let code = exit_code.unwrap_or(-1);
    session.record_exit(code);
    let removed = sessions
        .remove_if(session.id(), |_, registered| Arc::ptr_eq(registered, &session))
        .is_some();
    info!(
        "Session {} exited with code {}{}",
        session.id(),
        code,
        if removed { "" } else { " after being destroyed" }
    );
}
