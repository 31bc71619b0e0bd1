//! Native pseudo-terminal bridge.
//!
//! Spawns the shell on a real pty via `portable-pty`, so the shell sees a
//! terminal, line discipline applies and resize reaches the process as
//! `SIGWINCH`. Output is read on a blocking task and forwarded as
//! [`BridgeOutput::Stdout`]; a pty merges stderr into the same stream.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, Mutex};

use super::bridge::{
    BridgeOutput, BridgeProcess, ProcessControl, ShellBridge, SpawnSpec,
    OUTPUT_CHANNEL_CAPACITY, READ_BUFFER_SIZE,
};
use super::shell::SessionError;

/// How long the shell gets to act on SIGHUP before its process group is killed.
const HANGUP_GRACE: Duration = Duration::from_secs(1);

/// Poll interval while waiting for the shell to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Bridge backed by the platform's native pty implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtyBridge;

impl NativePtyBridge {
    /// Creates the bridge.
    pub fn new() -> Self {
        Self
    }
}

impl ShellBridge for NativePtyBridge {
    fn name(&self) -> &'static str {
        "native"
    }

    fn spawn(&self, spec: &SpawnSpec) -> Result<BridgeProcess, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.shell);
        cmd.cwd(&spec.cwd);
        cmd.env_clear();
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        // Our copy of the slave must go, or the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = Arc::clone(&exited);

        tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx
                            .blocking_send(BridgeOutput::Stdout(buffer[..n].to_vec()))
                            .is_err()
                        {
                            tracing::debug!(pid = ?pid, "Output receiver dropped, stopping pty reader");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // Linux reports EIO on the master once the slave side closes.
                    Err(e) => {
                        tracing::trace!(pid = ?pid, error = %e, "PTY read ended");
                        break;
                    }
                }
            }

            let notice = match child.wait() {
                Ok(status) => BridgeOutput::Exited(Some(status.exit_code() as i32)),
                Err(e) => BridgeOutput::Failed(e.to_string()),
            };
            exited_flag.store(true, Ordering::SeqCst);
            let _ = output_tx.blocking_send(notice);
        });

        tracing::debug!(pid = ?pid, shell = %spec.shell, "Spawned shell on native pty");

        Ok(BridgeProcess {
            control: Box::new(NativePtyControl {
                master: Mutex::new(pair.master),
                writer: Arc::new(std::sync::Mutex::new(writer)),
                killer: std::sync::Mutex::new(killer),
                exited,
                pid,
            }),
            output: output_rx,
        })
    }
}

/// Control handle for a shell running on a native pty.
struct NativePtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<std::sync::Mutex<Box<dyn Write + Send>>>,
    killer: std::sync::Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

#[async_trait]
impl ProcessControl for NativePtyControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        // The master blocks while the shell is not draining its input.
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| SessionError::WriteFailed("writer lock poisoned".to_string()))?;
            writer
                .write_all(&data)
                .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
            writer
                .flush()
                .map_err(|e| SessionError::WriteFailed(e.to_string()))
        })
        .await
        .map_err(|e| SessionError::WriteFailed(e.to_string()))?
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self.master.lock().await;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        tracing::debug!(pid = ?self.pid, cols, rows, "Resized PTY");
        Ok(())
    }

    async fn kill(&self) -> Result<(), SessionError> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        let hangup = {
            let mut killer = self
                .killer
                .lock()
                .map_err(|_| SessionError::KillFailed("killer lock poisoned".to_string()))?;
            killer.kill()
        };
        if let Err(e) = hangup {
            // Lost the race with a natural exit.
            if self.exited.load(Ordering::SeqCst) {
                return Ok(());
            }
            tracing::debug!(pid = ?self.pid, error = %e, "SIGHUP not delivered");
        }

        let deadline = tokio::time::Instant::now() + HANGUP_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.exited.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::warn!(pid = ?self.pid, "Shell ignored SIGHUP, killing its process group");
        self.kill_group()
    }
}

impl NativePtyControl {
    /// Sends SIGKILL to the shell's process group.
    ///
    /// portable-pty starts the shell as a session leader, so its pid is
    /// also the group id. Children the shell left behind go with it.
    fn kill_group(&self) -> Result<(), SessionError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}
