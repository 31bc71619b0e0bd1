//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! registry, the command dispatcher and the access gate from a [`Config`],
//! then runs the HTTP server and the idle reaper until it is stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::{AccessGate, OpenGate, TokenGate};
use crate::config::{BridgeKind, Config};
use crate::dispatcher::CommandDispatcher;
use crate::server::{self, AppState};
use crate::session::{
    EnvPolicy, NativePtyBridge, Reaper, ScriptBridge, SessionRegistry, ShellBridge, SpawnDefaults,
};

/// How long `stop` waits for the HTTP server to drain.
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the listener.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The HTTP listener is bound.
    Listening { addr: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// Background tasks owned by a running orchestrator.
struct RunningTasks {
    server: JoinHandle<Result<()>>,
    reaper: JoinHandle<()>,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session registry.
    registry: Arc<SessionRegistry>,
    /// Control command dispatcher.
    dispatcher: Arc<CommandDispatcher>,
    /// Gate in front of the terminal routes.
    gate: Arc<dyn AccessGate>,
    /// Address the listener is bound to, once started.
    local_addr: Option<SocketAddr>,
    /// Server and reaper tasks.
    tasks: Mutex<Option<RunningTasks>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator using the bridge named in the config.
    pub fn new(config: Config) -> Result<Self> {
        let bridge: Arc<dyn ShellBridge> = match config.session.bridge {
            BridgeKind::Native => Arc::new(NativePtyBridge::new()),
            BridgeKind::Script => Arc::new(ScriptBridge::new()),
        };
        Self::with_bridge(config, bridge)
    }

    /// Creates a new daemon orchestrator around an explicit bridge.
    pub fn with_bridge(config: Config, bridge: Arc<dyn ShellBridge>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let working_dir = config.session.resolved_workspace_dir();
        let mut defaults = SpawnDefaults::new(config.session.default_shell.clone(), working_dir);
        defaults.env_policy = EnvPolicy::new(config.environment.namespace_prefixes.clone());

        info!(
            bridge = bridge.name(),
            shell = %defaults.shell,
            working_dir = %defaults.working_dir.display(),
            "Initializing session registry"
        );

        let registry = Arc::new(SessionRegistry::new(bridge, defaults));
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&registry)));

        let gate: Arc<dyn AccessGate> = match &config.server.access_token {
            Some(token) => Arc::new(TokenGate::new(token.clone())),
            None => {
                warn!("No access token configured, terminal routes are open");
                Arc::new(OpenGate)
            }
        };

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            dispatcher,
            gate,
            local_addr: None,
            tasks: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Binds the configured address and starts serving.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.start_with_listener(listener).await
    }

    /// Starts serving on an already-bound listener.
    pub async fn start_with_listener(&mut self, listener: TcpListener) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
                return Err(e).context("Failed to read listener address");
            }
        };
        self.local_addr = Some(local_addr);

        let reaper = Reaper::with_timing(
            Arc::clone(&self.registry),
            self.config.session.reap_interval(),
            self.config.session.idle_timeout(),
        )
        .spawn(self.shutdown_token.clone());
        debug!("Started session reaper");

        let state = AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            gate: Arc::clone(&self.gate),
            heartbeat: self.config.session.heartbeat(),
        };
        let server = tokio::spawn(server::serve(listener, state, self.shutdown_token.clone()));

        *self.tasks.lock().await = Some(RunningTasks { server, reaper });

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::Listening { addr: local_addr });
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(addr = %local_addr, "Daemon orchestrator started successfully");
        Ok(local_addr)
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Every session is terminated before the server is awaited, so open
    /// streams end and the graceful shutdown can complete.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        debug!(sessions = self.registry.count(), "Terminating sessions");
        self.registry.shutdown().await;

        if let Some(tasks) = self.tasks.lock().await.take() {
            if let Err(e) = tasks.reaper.await {
                warn!("Reaper task ended abnormally: {}", e);
            }

            match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, tasks.server).await {
                Ok(Ok(Ok(()))) => debug!("HTTP server drained"),
                Ok(Ok(Err(e))) => {
                    warn!("HTTP server exited with error: {:#}", e);
                    self.emit_event(OrchestratorEvent::Error {
                        message: e.to_string(),
                    });
                }
                Ok(Err(e)) => warn!("HTTP server task panicked: {}", e),
                Err(_) => warn!("HTTP server did not drain in time"),
            }
        }

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the command dispatcher.
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Returns the bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeBridge;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.bind_addr = "127.0.0.1:0".to_string();
        config.session.default_shell = "/bin/sh".to_string();
        config.session.workspace_dir = temp_dir.path().to_path_buf();
        config
    }

    fn orchestrator(temp_dir: &TempDir) -> (Arc<FakeBridge>, DaemonOrchestrator) {
        let bridge = Arc::new(FakeBridge::new());
        let orchestrator =
            DaemonOrchestrator::with_bridge(create_test_config(temp_dir), bridge.clone()).unwrap();
        (bridge, orchestrator)
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = DaemonOrchestrator::new(create_test_config(&temp_dir)).unwrap();

        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
        assert_eq!(orchestrator.registry().count(), 0);
        assert_eq!(
            orchestrator.registry().defaults().working_dir,
            temp_dir.path().to_path_buf()
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.server.bind_addr = "not an address".to_string();

        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let (_bridge, mut orchestrator) = orchestrator(&temp_dir);
        let mut events = orchestrator.subscribe();

        let addr = orchestrator.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(orchestrator.local_addr(), Some(addr));
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);

        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.shutdown_token().is_cancelled());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OrchestratorEvent::StateChanged(state) = event {
                seen.push(state);
            }
        }
        assert_eq!(
            seen,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let (_bridge, orchestrator) = orchestrator(&temp_dir);
        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_terminates_sessions() {
        let temp_dir = TempDir::new().unwrap();
        let (bridge, mut orchestrator) = orchestrator(&temp_dir);
        orchestrator.start().await.unwrap();

        let id = orchestrator.registry().create().await.unwrap();
        assert!(orchestrator.registry().exists(&id));

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.registry().count(), 0);
        assert!(bridge.last_handle().unwrap().was_killed());
    }

    #[tokio::test]
    async fn test_token_gate_from_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.server.access_token = Some("s3cret".to_string());

        let orchestrator =
            DaemonOrchestrator::with_bridge(config, Arc::new(FakeBridge::new())).unwrap();
        let mut headers = axum::http::HeaderMap::new();
        assert!(!orchestrator.gate.is_authorized(&headers, None));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer s3cret".parse().unwrap(),
        );
        assert!(orchestrator.gate.is_authorized(&headers, None));
    }
}
