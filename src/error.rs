//! Error types shared by the session, PTY and tunnel layers.

use thiserror::Error;

/// Errors raised by the session layer and its PTY collaborator.
///
/// None of these are fatal to the server: the registry and the connection
/// state machine log them and keep going.
#[derive(Debug, Error)]
pub enum Error {
    /// The PTY could not be opened or the shell could not be spawned.
    #[error("failed to spawn PTY: {0}")]
    Spawn(String),

    /// Writing keystrokes to the PTY failed.
    #[error("failed to write to PTY: {0}")]
    Write(String),

    /// The PTY rejected a resize request.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// Signalling the child process failed.
    #[error("failed to terminate process: {0}")]
    Terminate(String),
}

pub type Result<T> = std::result::Result<T, Error>;
