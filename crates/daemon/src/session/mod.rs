//! Session management module.
//!
//! Shell spawning, event fan-out with replay, the session registry and the
//! reaper that evicts dead or idle sessions.

pub mod bridge;
pub mod environment;
pub mod manager;
pub mod multiplexer;
pub mod pty;
pub mod reaper;
pub mod script;
pub mod shell;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{BridgeOutput, BridgeProcess, ProcessControl, ShellBridge, SpawnSpec, Utf8Decoder};
pub use environment::EnvPolicy;
pub use manager::{SessionRegistry, SpawnDefaults, MAX_ALIVE_SESSIONS};
pub use multiplexer::{
    Attachment, ClientId, ClientStats, EventBroadcaster, Subscription, CLIENT_QUEUE_CAPACITY,
    REPLAY_BUFFER_CAPACITY,
};
pub use pty::NativePtyBridge;
pub use reaper::Reaper;
pub use script::ScriptBridge;
pub use shell::{Session, SessionError, SessionId};
