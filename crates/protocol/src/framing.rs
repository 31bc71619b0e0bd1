//! Push-stream framing.
//!
//! # Frame Format
//!
//! Each frame is one Server-Sent-Events record carrying a single JSON event:
//!
//! ```text
//! data: {"type":"output","text":"hi\r\n"}\n
//! \n
//! ```
//!
//! The JSON encoder never emits raw newlines, so a frame written by
//! [`encode_event`] always has exactly one `data:` line. The decoder is more
//! lenient and follows the SSE rules: multiple `data:` lines are joined with
//! `\n`, comment lines (starting with `:`) and unknown fields are ignored.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::messages::Event;

/// Field prefix for frame payload lines.
pub const DATA_PREFIX: &str = "data:";

/// Frame terminator (blank line).
pub const FRAME_TERMINATOR: &[u8] = b"\n\n";

/// Maximum bytes the decoder buffers while waiting for a terminator (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encodes an event as a complete `data: <json>\n\n` frame.
pub fn encode_event(event: &Event) -> Result<Bytes> {
    let json = serde_json::to_string(event)?;
    let mut out = BytesMut::with_capacity(DATA_PREFIX.len() + json.len() + 3);
    out.extend_from_slice(DATA_PREFIX.as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(json.as_bytes());
    out.extend_from_slice(FRAME_TERMINATOR);
    Ok(out.freeze())
}

/// Incremental decoder for a push stream.
///
/// Feed arbitrary byte chunks with [`FrameDecoder::push`] and drain complete
/// events with [`FrameDecoder::next_event`]. Partial frames stay buffered
/// until their terminator arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes received from the transport.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if self.buffer.len() + chunk.len() > MAX_FRAME_SIZE && !contains_terminator(chunk) {
            return Err(ProtocolError::FrameTooLarge {
                size: self.buffer.len() + chunk.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete event, if one is buffered.
    ///
    /// Frames that carry no `data:` field (pure comments, keep-alives) are
    /// skipped.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            let Some(end) = find_terminator(&self.buffer) else {
                return Ok(None);
            };

            let record = self.buffer.split_to(end);
            self.buffer.advance(FRAME_TERMINATOR.len());

            let text = std::str::from_utf8(&record)?;
            if let Some(payload) = extract_data(text) {
                let event = serde_json::from_str(&payload)?;
                return Ok(Some(event));
            }
        }
    }

    /// Drains every complete event currently buffered.
    pub fn drain_events(&mut self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event()? {
            events.push(event);
        }
        Ok(events)
    }
}

/// Joins the `data:` lines of one SSE record.
fn extract_data(record: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in record.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(value) = line.strip_prefix(DATA_PREFIX) {
            lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_TERMINATOR.len())
        .position(|w| w == FRAME_TERMINATOR)
}

fn contains_terminator(buf: &[u8]) -> bool {
    find_terminator(buf).is_some()
}
