//! # Clawdeck Daemon Library
//!
//! This crate provides the daemon (server) functionality for Clawdeck:
//! interactive shells on the host machine, driven and watched over HTTP.
//!
//! ## Overview
//!
//! - **Session Registry**: Spawn up to two live pty-backed shells with a
//!   sanitized environment
//! - **Event Broadcasting**: Per-session replay buffer of the last 5000
//!   events plus live fan-out to every viewer
//! - **Push Streams**: `text/event-stream` with replay, status and 15 s
//!   heartbeat pings
//! - **Command Dispatch**: `create` / `input` / `resize` / `kill` / `list`
//! - **Reaper**: Evicts dead sessions and sessions idle for 30 minutes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────────────────────┐  ┌─────────────────────────┐  │
//! │  │  HTTP server + AccessGate    │  │        Reaper           │  │
//! │  └──────────────────────────────┘  └─────────────────────────┘  │
//! │        │                 │                    │                 │
//! │  ┌─────────────┐  ┌─────────────┐             │                 │
//! │  │ Dispatcher  │  │ Event stream│             │                 │
//! │  └─────────────┘  └─────────────┘             │                 │
//! │        │                 │                    │                 │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │         Session Registry  →  Session  →  ShellBridge       │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     let addr = orchestrator.start().await?;
//!     println!("listening on {}", addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Shell sessions, bridges, broadcaster, registry and reaper
//! - [`stream`]: Per-viewer push stream
//! - [`dispatcher`]: Control request validation and dispatch
//! - [`access`]: Request authorization
//! - [`server`]: HTTP routes
//! - [`client`]: HTTP client for a running daemon
//! - [`orchestrator`]: Main daemon coordinator

pub mod access;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod stream;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{BridgeKind, Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    EnvPolicy, EventBroadcaster, NativePtyBridge, Reaper, ScriptBridge, Session, SessionError,
    SessionId, SessionRegistry, ShellBridge, SpawnDefaults, MAX_ALIVE_SESSIONS,
    REPLAY_BUFFER_CAPACITY,
};

// Re-export HTTP types for convenience
pub use access::{AccessGate, OpenGate, TokenGate};
pub use client::{ClientError, ControlClient};
pub use dispatcher::{CommandDispatcher, DispatchError};
pub use server::{router, serve, ApiError, AppState};
pub use stream::{event_stream, DEFAULT_HEARTBEAT};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
