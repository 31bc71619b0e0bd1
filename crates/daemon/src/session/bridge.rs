//! Process bridge abstraction.
//!
//! A bridge turns a [`SpawnSpec`] into a running shell with terminal
//! semantics. The session layer only sees two things: a [`ProcessControl`]
//! handle for input, resize and termination, and a bounded channel of
//! [`BridgeOutput`] chunks ending with an exit or failure notice.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::shell::SessionError;

/// Capacity of the output channel between a bridge and its session.
///
/// The reader side blocks when this fills up, which in turn stalls the
/// shell on its own output pipe.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Buffer size for reading process output.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Default terminal size for new sessions.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Everything a bridge needs to start a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Shell executable.
    pub shell: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Complete environment. Bridges must not inherit anything else.
    pub env: Vec<(String, String)>,
    /// Initial terminal columns.
    pub cols: u16,
    /// Initial terminal rows.
    pub rows: u16,
}

/// A chunk of process output or a lifecycle notice.
///
/// Bridges deliver every output chunk before the final `Exited` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutput {
    /// Bytes from the process's standard output.
    Stdout(Vec<u8>),
    /// Bytes from the process's standard error.
    Stderr(Vec<u8>),
    /// The process exited, with its exit code if one was reported.
    Exited(Option<i32>),
    /// The bridge lost the process for a reason other than a normal exit.
    Failed(String),
}

/// Control handle for a running bridge process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Writes raw bytes to the process input.
    async fn write(&self, data: &[u8]) -> Result<(), SessionError>;

    /// Propagates a terminal size change. Bridges without a pty side channel
    /// accept this as a no-op.
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Sends a terminate signal. Killing an already exited process succeeds.
    async fn kill(&self) -> Result<(), SessionError>;
}

/// A freshly spawned bridge process.
pub struct BridgeProcess {
    /// Input/resize/kill handle.
    pub control: Box<dyn ProcessControl>,
    /// Output chunks, closed after the final lifecycle notice.
    pub output: mpsc::Receiver<BridgeOutput>,
}

/// Spawns shells with terminal semantics.
pub trait ShellBridge: Send + Sync {
    /// Short name used in logs and configuration.
    fn name(&self) -> &'static str;

    /// Starts a shell described by `spec`.
    fn spawn(&self, spec: &SpawnSpec) -> Result<BridgeProcess, SessionError>;
}

/// Incremental UTF-8 decoder for a byte stream split at arbitrary points.
///
/// Incomplete trailing sequences are held back until the next chunk; invalid
/// bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes as much of `pending + chunk` as forms complete characters.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flushes any held-back bytes, lossily.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_ascii() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"hello\r\n"), "hello\r\n");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decode_split_multibyte_character() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8Decoder::new();

        // 'é' is two bytes; split between them
        assert_eq!(decoder.decode(&bytes[..2]), "h");
        assert_eq!(decoder.decode(&bytes[2..]), "éllo");
    }

    #[test]
    fn test_decode_invalid_bytes_replaced() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_finish_flushes_incomplete_tail() {
        let mut decoder = Utf8Decoder::new();
        let euro = "€".as_bytes();
        assert_eq!(decoder.decode(&euro[..1]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
