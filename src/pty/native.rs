//! `portable-pty` backed shells.
//!
//! Each spawn starts three blocking workers: one reading PTY output into the
//! event channel, one draining queued keystrokes into the PTY, and one waiting
//! for the child so the exit code can be published after the last output chunk.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{PtyControl, PtyEvent, PtySpawner, SpawnedPty, TerminalSize};
use crate::error::{Error, Result};

const READ_BUFFER_SIZE: usize = 8192;
const EVENT_QUEUE_DEPTH: usize = 1024;
/// How long the exit watcher waits for the reader to hit EOF before publishing the exit code.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Spawns the configured shell inside a native pseudo-terminal.
pub struct NativePtySpawner {
    shell: String,
}

impl NativePtySpawner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, cwd: &Path, size: TerminalSize) -> Result<SpawnedPty> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|e| Error::Spawn(e.to_string()))?;

        // Take both master streams before the child exists so a failure here cannot leak it.
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| Error::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| Error::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Spawn(e.to_string()))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        info!(
            "Spawned {} (pid {:?}) in {} at {}x{}",
            self.shell,
            pid,
            cwd.display(),
            size.cols,
            size.rows
        );

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let output_tx = event_tx.clone();
        let reader_task = tokio::task::spawn_blocking(move || read_output(reader, output_tx));
        tokio::task::spawn_blocking(move || write_input(writer, input_rx));

        tokio::spawn(async move {
            let code = match tokio::task::spawn_blocking(move || child.wait()).await {
                Ok(Ok(status)) => status.exit_code() as i32,
                Ok(Err(e)) => {
                    warn!("Failed to wait for shell (pid {:?}): {}", pid, e);
                    -1
                }
                Err(e) => {
                    warn!("Shell wait task for pid {:?} failed: {}", pid, e);
                    -1
                }
            };
            exit_tx.send_replace(Some(code));
            let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader_task).await;
            debug!("Shell (pid {:?}) exited with code {}", pid, code);
            let _ = event_tx.send(PtyEvent::Exit(code)).await;
        });

        Ok(SpawnedPty {
            control: Box::new(NativePty {
                master: Mutex::new(pair.master),
                input: input_tx,
                killer: Mutex::new(killer),
                pid,
                exited: exit_rx,
            }),
            events: event_rx,
        })
    }
}

struct NativePty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    input: mpsc::UnboundedSender<Vec<u8>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    exited: watch::Receiver<Option<i32>>,
}

impl NativePty {
    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<bool> {
        use nix::errno::Errno;
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(false);
        };
        match nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => Ok(true),
            // Already reaped.
            Err(Errno::ESRCH) => Ok(true),
            Err(e) => Err(Error::Terminate(format!("{signal:?} to pid {pid}: {e}"))),
        }
    }

    #[cfg(unix)]
    fn hang_up(&self) -> Result<()> {
        self.signal(nix::sys::signal::Signal::SIGHUP).map(|_| ())
    }

    #[cfg(not(unix))]
    fn hang_up(&self) -> Result<()> {
        Ok(())
    }

    fn force_kill(&self) -> Result<()> {
        #[cfg(unix)]
        {
            if self.signal(nix::sys::signal::Signal::SIGKILL)? {
                return Ok(());
            }
        }
        self.killer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .kill()
            .map_err(|e| Error::Terminate(e.to_string()))
    }
}

#[async_trait]
impl PtyControl for NativePty {
    fn write(&self, data: &[u8]) -> Result<()> {
        self.input
            .send(data.to_vec())
            .map_err(|_| Error::Write("PTY input closed".into()))
    }

    fn resize(&self, size: TerminalSize) -> Result<()> {
        self.master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(pty_size(size))
            .map_err(|e| Error::Resize(e.to_string()))
    }

    async fn terminate(&self, grace: Duration) -> Result<()> {
        if self.exited.borrow().is_some() {
            return Ok(());
        }
        if let Err(e) = self.hang_up() {
            warn!("Polite termination of pid {:?} failed: {}", self.pid, e);
        }

        let mut exited = self.exited.clone();
        let exited_in_time = matches!(
            tokio::time::timeout(grace, exited.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        );
        if exited_in_time {
            debug!("Pid {:?} exited after hang-up", self.pid);
            return Ok(());
        }

        info!(
            "Pid {:?} still running {:?} after hang-up, killing",
            self.pid, grace
        );
        self.force_kill()
    }
}

fn read_output(mut reader: Box<dyn Read + Send>, events: mpsc::Sender<PtyEvent>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buffer[..n]);
                if events.blocking_send(PtyEvent::Output(chunk)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // EIO once the child is gone on Linux.
            Err(_) => break,
        }
    }
}

fn write_input(mut writer: Box<dyn Write + Send>, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = input.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            warn!("Failed to write {} bytes to PTY: {}", data.len(), e);
            break;
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
