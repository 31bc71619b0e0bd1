//! Session registry.
//!
//! Holds every session by id, enforces the live-session cap and owns the
//! spawn defaults (shell, working directory, environment policy) applied to
//! each new shell.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use protocol::SessionSummary;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::bridge::{ShellBridge, SpawnSpec, DEFAULT_COLS, DEFAULT_ROWS};
use super::environment::EnvPolicy;
use super::shell::{Session, SessionError, SessionId};

/// Maximum number of sessions with a live shell.
pub const MAX_ALIVE_SESSIONS: usize = 2;

/// Length of generated session ids.
const SESSION_ID_LEN: usize = 12;

/// Settings applied to every spawned shell.
#[derive(Debug, Clone)]
pub struct SpawnDefaults {
    /// Shell executable.
    pub shell: String,
    /// Working directory.
    pub working_dir: PathBuf,
    /// Environment allow/deny policy.
    pub env_policy: EnvPolicy,
    /// Source environment. `None` means this process's environment.
    pub base_env: Option<Vec<(String, String)>>,
    /// Initial terminal size.
    pub cols: u16,
    pub rows: u16,
}

impl SpawnDefaults {
    /// Creates defaults for `shell` in `working_dir`, sourcing the host environment.
    pub fn new(shell: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            working_dir: working_dir.into(),
            env_policy: EnvPolicy::default(),
            base_env: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    /// Builds the spawn request for one shell.
    pub fn spawn_spec(&self) -> SpawnSpec {
        let env = match &self.base_env {
            Some(vars) => self.env_policy.build(vars.iter().cloned()),
            None => self.env_policy.from_host(),
        };

        SpawnSpec {
            shell: self.shell.clone(),
            cwd: self.working_dir.clone(),
            env,
            cols: self.cols,
            rows: self.rows,
        }
    }
}

/// Thread-safe registry of shell sessions.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Bridge used to spawn shells.
    bridge: Arc<dyn ShellBridge>,
    /// Spawn settings.
    defaults: SpawnDefaults,
    /// Live-session cap.
    max_alive: usize,
    /// Serializes the admission check with the insert.
    admission: Mutex<()>,
}

impl SessionRegistry {
    /// Creates a registry with the default live-session cap.
    pub fn new(bridge: Arc<dyn ShellBridge>, defaults: SpawnDefaults) -> Self {
        Self::with_limit(bridge, defaults, MAX_ALIVE_SESSIONS)
    }

    /// Creates a registry with an explicit live-session cap.
    pub fn with_limit(bridge: Arc<dyn ShellBridge>, defaults: SpawnDefaults, max_alive: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            bridge,
            defaults,
            max_alive,
            admission: Mutex::new(()),
        }
    }

    /// Returns the spawn settings.
    pub fn defaults(&self) -> &SpawnDefaults {
        &self.defaults
    }

    /// Returns the live-session cap.
    pub fn max_alive(&self) -> usize {
        self.max_alive
    }

    /// Spawns a new shell session.
    ///
    /// Fails with [`SessionError::AdmissionLimit`] when the cap is reached;
    /// dead sessions awaiting the reaper do not count.
    pub async fn create(&self) -> Result<SessionId, SessionError> {
        let _admission = self.admission.lock().await;

        if self.alive_count() >= self.max_alive {
            tracing::warn!(limit = self.max_alive, "Session admission refused");
            return Err(SessionError::AdmissionLimit {
                limit: self.max_alive,
            });
        }

        let id = self.generate_id();
        let spec = self.defaults.spawn_spec();
        let session = Session::spawn(id.clone(), self.bridge.as_ref(), &spec).map_err(|e| {
            tracing::error!(error = %e, shell = %spec.shell, "Failed to spawn shell");
            e
        })?;

        self.sessions.insert(id.clone(), session);
        Ok(id)
    }

    fn generate_id(&self) -> SessionId {
        loop {
            let mut id = Uuid::new_v4().simple().to_string();
            id.truncate(SESSION_ID_LEN);
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Looks up a session.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Returns whether a session is registered.
    pub fn exists(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Returns every session, oldest first.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id().cmp(b.id())));
        sessions
    }

    /// Lists every session, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions().iter().map(|s| s.summary()).collect()
    }

    /// Removes a session, terminating its shell and ending its viewer streams.
    ///
    /// Admission stays blocked until the shell is gone, so a dying shell
    /// still counts toward the cap. Returns false if no such session was
    /// registered.
    pub async fn remove(&self, id: &str) -> bool {
        let _admission = self.admission.lock().await;
        let Some((id, session)) = self.sessions.remove(id) else {
            return false;
        };

        session.terminate().await;
        session.close();

        tracing::info!(session_id = %id, "Session removed");
        true
    }

    /// Removes every session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id).await;
        }
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns the number of sessions with a live shell.
    pub fn alive_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.value().is_alive()).count()
    }
}
