//! In-memory bridge for unit tests.
//!
//! [`FakeBridge`] hands out processes whose output is driven by the test
//! through a [`FakeHandle`], so session, registry and stream behavior can be
//! checked without a real shell.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::bridge::{BridgeOutput, BridgeProcess, ProcessControl, ShellBridge, SpawnSpec};
use super::shell::SessionError;

#[derive(Default)]
struct FakeState {
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    killed: AtomicBool,
}

/// Test-side handle for one fake process.
#[derive(Clone)]
pub struct FakeHandle {
    tx: mpsc::Sender<BridgeOutput>,
    state: Arc<FakeState>,
}

impl FakeHandle {
    pub async fn stdout(&self, text: &str) {
        self.stdout_bytes(text.as_bytes()).await;
    }

    pub async fn stdout_bytes(&self, bytes: &[u8]) {
        let _ = self.tx.send(BridgeOutput::Stdout(bytes.to_vec())).await;
    }

    pub async fn stderr(&self, text: &str) {
        let _ = self
            .tx
            .send(BridgeOutput::Stderr(text.as_bytes().to_vec()))
            .await;
    }

    pub async fn exit(&self, code: Option<i32>) {
        let _ = self.tx.send(BridgeOutput::Exited(code)).await;
    }

    pub async fn fail(&self, reason: &str) {
        let _ = self.tx.send(BridgeOutput::Failed(reason.to_string())).await;
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.written.lock().unwrap().clone()
    }

    pub fn last_resize(&self) -> Option<(u16, u16)> {
        self.state.resizes.lock().unwrap().last().copied()
    }

    pub fn was_killed(&self) -> bool {
        self.state.killed.load(Ordering::SeqCst)
    }
}

struct FakeControl {
    tx: mpsc::Sender<BridgeOutput>,
    state: Arc<FakeState>,
    ignore_kill: bool,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.state.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.state.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn kill(&self) -> Result<(), SessionError> {
        self.state.killed.store(true, Ordering::SeqCst);
        if !self.ignore_kill {
            let _ = self.tx.send(BridgeOutput::Exited(None)).await;
        }
        Ok(())
    }
}

/// Bridge producing [`FakeHandle`]-driven processes.
#[derive(Default)]
pub struct FakeBridge {
    ignore_kill: bool,
    fail_spawn: bool,
    handles: Mutex<Vec<FakeHandle>>,
    specs: Mutex<Vec<SpawnSpec>>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes that never report an exit after kill.
    pub fn ignoring_kill() -> Self {
        Self {
            ignore_kill: true,
            ..Self::default()
        }
    }

    /// A bridge whose spawn always fails.
    pub fn failing() -> Self {
        Self {
            fail_spawn: true,
            ..Self::default()
        }
    }

    pub fn spec() -> SpawnSpec {
        SpawnSpec {
            shell: "/bin/fake".to_string(),
            cwd: PathBuf::from("/tmp"),
            env: Vec::new(),
            cols: 80,
            rows: 24,
        }
    }

    pub fn last_handle(&self) -> Option<FakeHandle> {
        self.handles.lock().unwrap().last().cloned()
    }

    pub fn handle(&self, index: usize) -> Option<FakeHandle> {
        self.handles.lock().unwrap().get(index).cloned()
    }

    pub fn spawned_specs(&self) -> Vec<SpawnSpec> {
        self.specs.lock().unwrap().clone()
    }
}

impl ShellBridge for FakeBridge {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn spawn(&self, spec: &SpawnSpec) -> Result<BridgeProcess, SessionError> {
        if self.fail_spawn {
            return Err(SessionError::SpawnFailed("no such shell".to_string()));
        }

        let (tx, rx) = mpsc::channel(1024);
        let state = Arc::new(FakeState::default());

        self.specs.lock().unwrap().push(spec.clone());
        self.handles.lock().unwrap().push(FakeHandle {
            tx: tx.clone(),
            state: Arc::clone(&state),
        });

        Ok(BridgeProcess {
            control: Box::new(FakeControl {
                tx,
                state,
                ignore_kill: self.ignore_kill,
            }),
            output: rx,
        })
    }
}
