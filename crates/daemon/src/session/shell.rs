//! Shell sessions.
//!
//! A [`Session`] owns one bridge process and the [`EventBroadcaster`] its
//! output flows through. A pump task converts bridge output into `output`
//! events and publishes the exit banner plus `status: false` exactly once,
//! whether the shell exited on its own or was terminated.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::{Event, SessionSummary};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use super::bridge::{BridgeOutput, BridgeProcess, ProcessControl, ShellBridge, SpawnSpec, Utf8Decoder};
use super::multiplexer::{now_millis, Attachment, EventBroadcaster};

/// Unique identifier for a session.
pub type SessionId = String;

/// How long `terminate` waits for the exit notice before synthesizing one.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's shell is no longer running.
    #[error("session is not alive: {0}")]
    NotAlive(SessionId),

    /// Too many live sessions already.
    #[error("too many active terminal sessions (limit {limit}); kill an existing session first")]
    AdmissionLimit {
        /// Configured maximum.
        limit: usize,
    },

    /// Failed to spawn the shell.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// Failed to write to the shell.
    #[error("failed to write to shell: {0}")]
    WriteFailed(String),

    /// Failed to resize the terminal.
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    /// Failed to kill the shell.
    #[error("failed to kill shell: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A shell session.
pub struct Session {
    /// Unique session identifier.
    id: SessionId,
    /// Creation time (Unix epoch milliseconds).
    created_at: u64,
    /// Creation instant, for age calculations.
    started: Instant,
    /// Working directory the shell was started in.
    working_dir: PathBuf,
    /// Event fan-out and replay buffer.
    broadcaster: EventBroadcaster,
    /// Bridge control handle.
    control: Box<dyn ProcessControl>,
    /// Set once a terminate was requested, to pick the banner.
    kill_requested: AtomicBool,
    /// Flips to true once the end of the stream has been published.
    exited: watch::Sender<bool>,
}

impl Session {
    /// Spawns a shell through `bridge` and starts pumping its output.
    pub fn spawn(
        id: SessionId,
        bridge: &dyn ShellBridge,
        spec: &SpawnSpec,
    ) -> Result<Arc<Self>, SessionError> {
        let process = bridge.spawn(spec)?;
        let session = Self::from_process(id, process, spec.cwd.clone());

        tracing::info!(
            session_id = %session.id,
            pid = ?session.pid(),
            bridge = bridge.name(),
            shell = %spec.shell,
            "Session started"
        );

        Ok(session)
    }

    /// Wraps an already running bridge process.
    pub fn from_process(id: SessionId, process: BridgeProcess, working_dir: PathBuf) -> Arc<Self> {
        let (exited, _) = watch::channel(false);
        let session = Arc::new(Self {
            id,
            created_at: now_millis(),
            started: Instant::now(),
            working_dir,
            broadcaster: EventBroadcaster::new(),
            control: process.control,
            kill_requested: AtomicBool::new(false),
            exited,
        });

        tokio::spawn(Arc::clone(&session).pump(process.output));
        session
    }

    /// Converts bridge output into events until the process is gone.
    async fn pump(self: Arc<Self>, mut output: mpsc::Receiver<BridgeOutput>) {
        let mut stdout = Utf8Decoder::new();
        let mut stderr = Utf8Decoder::new();
        let mut end = None;

        while let Some(chunk) = output.recv().await {
            match chunk {
                BridgeOutput::Stdout(bytes) => self.publish_text(stdout.decode(&bytes)),
                BridgeOutput::Stderr(bytes) => self.publish_text(stderr.decode(&bytes)),
                notice => {
                    end = Some(notice);
                    break;
                }
            }
        }

        self.publish_text(stdout.finish());
        self.publish_text(stderr.finish());

        let banner = match end {
            _ if self.kill_requested.load(Ordering::SeqCst) => terminated_banner(),
            Some(BridgeOutput::Exited(Some(code))) => {
                format!("\r\n[Process exited with code {}]\r\n", code)
            }
            Some(BridgeOutput::Failed(reason)) => {
                tracing::error!(session_id = %self.id, error = %reason, "Shell process failed");
                format!("\r\n[Process error: {}]\r\n", reason)
            }
            _ => "\r\n[Process exited]\r\n".to_string(),
        };

        self.finish(banner);
    }

    fn publish_text(&self, text: String) {
        if !text.is_empty() {
            self.broadcaster.publish(Event::output(text));
        }
    }

    /// Publishes the end-of-stream events once.
    fn finish(&self, banner: String) {
        if self.broadcaster.publish_exit(banner) {
            tracing::info!(session_id = %self.id, "Session ended");
        }
        self.exited.send_replace(true);
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    /// Returns the creation time (Unix epoch milliseconds).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Returns the time since creation.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns the shell's working directory.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Returns whether the shell is still running.
    pub fn is_alive(&self) -> bool {
        self.broadcaster.is_alive()
    }

    /// Returns the last activity timestamp (Unix epoch milliseconds).
    pub fn last_activity(&self) -> u64 {
        self.broadcaster.last_activity()
    }

    /// Returns the number of attached viewers.
    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.client_count()
    }

    /// Returns the number of buffered events.
    pub fn buffer_len(&self) -> usize {
        self.broadcaster.buffer_len()
    }

    /// Publishes an event to every viewer and the replay buffer.
    pub fn publish(&self, event: Event) -> usize {
        self.broadcaster.publish(event)
    }

    /// Attaches a viewer. See [`EventBroadcaster::attach`].
    pub fn attach(&self) -> Attachment {
        self.broadcaster.attach()
    }

    /// Writes raw input to the shell.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::NotAlive(self.id.clone()));
        }
        self.broadcaster.touch();
        self.control.write(data).await
    }

    /// Resizes the terminal.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Err(SessionError::NotAlive(self.id.clone()));
        }
        self.broadcaster.touch();
        self.control.resize(cols, rows).await
    }

    /// Terminates the shell.
    ///
    /// Waits up to [`TERMINATE_GRACE`] for the exit notice; if the process
    /// does not report in time, the end of the stream is published anyway.
    /// Calling this on a dead session does nothing.
    pub async fn terminate(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        if !self.is_alive() {
            return;
        }

        if let Err(e) = self.control.kill().await {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to signal shell");
        }

        let mut exited = self.exited.subscribe();
        let timed_out = tokio::time::timeout(TERMINATE_GRACE, exited.wait_for(|done| *done))
            .await
            .is_err();
        if timed_out {
            tracing::warn!(session_id = %self.id, "Shell did not exit in time");
            self.finish(terminated_banner());
        }
    }

    /// Ends every viewer stream. Used once the session leaves the registry.
    pub fn close(&self) {
        self.broadcaster.close();
    }

    /// Returns the row shown by `list`.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            alive: self.is_alive(),
            created_at: self.created_at,
            age_seconds: self.age().as_secs(),
        }
    }
}

fn terminated_banner() -> String {
    "\r\n[Session terminated]\r\n".to_string()
}
