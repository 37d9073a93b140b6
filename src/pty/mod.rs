//! # Pseudo-terminal collaborator
//!
//! The session registry never touches a PTY directly. It asks a [`PtySpawner`]
//! for a fresh process rooted in a working directory and gets back two halves:
//!
//! - a [`PtyControl`] used to write keystrokes, resize and terminate, and
//! - a channel of [`PtyEvent`]s carrying output chunks followed by exactly one
//!   exit code.
//!
//! [`NativePtySpawner`] is the production implementation built on
//! `portable-pty`. Tests plug in scripted spawners instead.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

mod native;

pub use native::NativePtySpawner;

/// Grace period between the polite and the forceful termination signal.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(200);

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 120, rows: 30 }
    }
}

/// Events emitted by a running PTY, in production order.
///
/// `Exit` is always the last event on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Bytes),
    Exit(i32),
}

/// Input/resize/kill side of a spawned PTY.
#[async_trait]
pub trait PtyControl: Send + Sync {
    /// Queue bytes for the shell's stdin. Must not block the caller.
    fn write(&self, data: &[u8]) -> Result<()>;

    fn resize(&self, size: TerminalSize) -> Result<()>;

    /// Two-phase stop: polite signal, wait up to `grace`, then force.
    ///
    /// Calling this on a process that already exited is a no-op.
    async fn terminate(&self, grace: Duration) -> Result<()>;
}

/// A freshly spawned PTY.
pub struct SpawnedPty {
    pub control: Box<dyn PtyControl>,
    pub events: mpsc::Receiver<PtyEvent>,
}

/// Factory for PTY-backed shell processes.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, cwd: &Path, size: TerminalSize) -> Result<SpawnedPty>;
}
