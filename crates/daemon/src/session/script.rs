//! `script(1)` wrapper bridge.
//!
//! For hosts where opening a pty from the daemon is not possible, the shell
//! runs under `script`, which allocates the pty on its side and relays it
//! over plain pipes. There is no side channel for window size, so resize is
//! accepted and ignored.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use super::bridge::{
    BridgeOutput, BridgeProcess, ProcessControl, ShellBridge, SpawnSpec,
    OUTPUT_CHANNEL_CAPACITY, READ_BUFFER_SIZE,
};
use super::shell::SessionError;

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Poll interval while waiting for the wrapper to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Bridge that wraps the shell in the `script` utility.
#[derive(Debug, Clone)]
pub struct ScriptBridge {
    program: String,
}

impl Default for ScriptBridge {
    fn default() -> Self {
        Self {
            program: "script".to_string(),
        }
    }
}

impl ScriptBridge {
    /// Creates a bridge using `script` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bridge using a specific `script` binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, spec: &SpawnSpec) -> Command {
        let mut cmd = Command::new(&self.program);

        // util-linux takes the command via -c; BSD script takes it positionally.
        if cfg!(target_os = "linux") {
            cmd.args(["-qfc", spec.shell.as_str(), "/dev/null"]);
        } else {
            cmd.args(["-q", "/dev/null", spec.shell.as_str()]);
        }

        cmd.current_dir(&spec.cwd)
            .env_clear()
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl ShellBridge for ScriptBridge {
    fn name(&self) -> &'static str {
        "script"
    }

    fn spawn(&self, spec: &SpawnSpec) -> Result<BridgeProcess, SessionError> {
        let mut child = self
            .command(spec)
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", self.program, e)))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = Arc::clone(&exited);

        tokio::spawn(async move {
            let stdout_task = stdout.map(|pipe| {
                tokio::spawn(forward(pipe, output_tx.clone(), BridgeOutput::Stdout))
            });
            let stderr_task = stderr.map(|pipe| {
                tokio::spawn(forward(pipe, output_tx.clone(), BridgeOutput::Stderr))
            });

            // Every output chunk goes out before the exit notice.
            if let Some(task) = stdout_task {
                let _ = task.await;
            }
            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            let notice = match child.wait().await {
                Ok(status) => BridgeOutput::Exited(status.code()),
                Err(e) => BridgeOutput::Failed(e.to_string()),
            };
            exited_flag.store(true, Ordering::SeqCst);
            let _ = output_tx.send(notice).await;
        });

        tracing::debug!(pid = ?pid, shell = %spec.shell, "Spawned shell under script");

        Ok(BridgeProcess {
            control: Box::new(ScriptControl {
                stdin: Mutex::new(stdin),
                exited,
                pid,
            }),
            output: output_rx,
        })
    }
}

/// Copies one pipe into the output channel until EOF.
async fn forward<R>(
    mut pipe: R,
    tx: mpsc::Sender<BridgeOutput>,
    wrap: fn(Vec<u8>) -> BridgeOutput,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buffer[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::trace!(error = %e, "Pipe read ended");
                break;
            }
        }
    }
}

/// Control handle for a shell running under `script`.
struct ScriptControl {
    stdin: Mutex<Option<ChildStdin>>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl ScriptControl {
    fn signal(&self, sig: Signal) -> Result<(), Errno> {
        match self.pid {
            Some(pid) => signal::kill(Pid::from_raw(pid as i32), sig),
            None => Err(Errno::ESRCH),
        }
    }
}

#[async_trait]
impl ProcessControl for ScriptControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| SessionError::WriteFailed("stdin is closed".to_string()))?;
        pipe.write_all(data)
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        pipe.flush()
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        tracing::debug!(pid = ?self.pid, cols, rows, "Resize ignored by script bridge");
        Ok(())
    }

    async fn kill(&self) -> Result<(), SessionError> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        match self.signal(Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(SessionError::KillFailed(e.to_string())),
        }

        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.exited.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }

        tracing::warn!(pid = ?self.pid, "Shell ignored SIGTERM, sending SIGKILL");
        match self.signal(Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        }
    }
}
