//! # Clawdeck Protocol Library
//!
//! Wire types shared by the clawdeck terminal daemon and its clients.
//!
//! ## Overview
//!
//! - **Events**: the `output` / `status` / `ping` union a session pushes to
//!   its viewers
//! - **Control messages**: `create`, `input`, `resize`, `kill` and `list`
//!   requests plus their responses
//! - **Framing**: the `data: <json>\n\n` push-stream encoding and an
//!   incremental decoder
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{encode_event, Event, FrameDecoder};
//!
//! let frame = encode_event(&Event::status(true)).unwrap();
//!
//! let mut decoder = FrameDecoder::new();
//! decoder.push(&frame).unwrap();
//! assert_eq!(decoder.next_event().unwrap(), Some(Event::status(true)));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Event and control message definitions
//! - [`framing`]: Push-stream encoder and decoder
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{encode_event, FrameDecoder, DATA_PREFIX, FRAME_TERMINATOR, MAX_FRAME_SIZE};
pub use messages::{
    Ack, ControlRequest, ControlResponse, ErrorBody, ErrorDetail, Event, HealthStatus,
    SessionCreated, SessionSummary,
};
