//! Wire message definitions for the clawdeck terminal.
//!
//! Two surfaces share these types: the request/response control surface
//! (JSON bodies tagged by `action`) and the push-stream surface, which
//! carries one JSON-encoded [`Event`] per frame.

use serde::{Deserialize, Serialize};

// ============================================================================
// Stream Events
// ============================================================================

/// An event flowing from a session to its subscribers.
///
/// Serialized with an internal `type` tag, e.g. `{"type":"status","alive":true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    /// A chunk of terminal output (stdout or stderr).
    Output {
        /// Output text, passed through untouched.
        text: String,
    },
    /// A liveness transition or snapshot.
    Status {
        /// Whether the shell process is still running.
        alive: bool,
    },
    /// Heartbeat. Never stored in a session's replay buffer.
    Ping,
}

impl Event {
    /// Convenience constructor for an output event.
    pub fn output(text: impl Into<String>) -> Self {
        Event::Output { text: text.into() }
    }

    /// Convenience constructor for a status event.
    pub fn status(alive: bool) -> Self {
        Event::Status { alive }
    }

    /// Returns true if this event belongs in a replay buffer.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Event::Ping)
    }
}

// ============================================================================
// Control Requests
// ============================================================================

/// A control action issued against the session registry.
///
/// Serialized with an `action` tag, e.g.
/// `{"action":"input","session":"a1b2c3","data":"ls\n"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlRequest {
    /// List every registered session.
    List,
    /// Spawn a new shell session.
    Create,
    /// Write raw input to a session.
    Input {
        /// Target session id.
        session: String,
        /// Bytes to write, as text.
        data: String,
    },
    /// Resize a session's terminal.
    ///
    /// Dimensions arrive as JSON numbers and are validated by the receiver,
    /// so fractional or out-of-range values can be rejected explicitly.
    Resize {
        /// Target session id.
        session: String,
        /// Requested columns.
        cols: f64,
        /// Requested rows.
        rows: f64,
    },
    /// Terminate and remove a session.
    Kill {
        /// Target session id.
        session: String,
    },
}

impl ControlRequest {
    /// Returns the action name, as it appears on the wire.
    pub fn action(&self) -> &'static str {
        match self {
            ControlRequest::List => "list",
            ControlRequest::Create => "create",
            ControlRequest::Input { .. } => "input",
            ControlRequest::Resize { .. } => "resize",
            ControlRequest::Kill { .. } => "kill",
        }
    }
}

// ============================================================================
// Control Responses
// ============================================================================

/// Response to a successful `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    /// Id of the new session.
    pub session_id: String,
}

/// One row of a `list` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id.
    pub id: String,
    /// Whether the shell process is still running.
    pub alive: bool,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: u64,
    /// Seconds since creation.
    pub age_seconds: u64,
}

/// Acknowledgement for actions with no payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Always true for a successful action.
    pub ok: bool,
}

impl Default for Ack {
    fn default() -> Self {
        Self { ok: true }
    }
}

/// Successful result of a control action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    /// Result of `create`.
    Created(SessionCreated),
    /// Result of `list`.
    Sessions(Vec<SessionSummary>),
    /// Result of `input`, `resize` and `kill`.
    Ack(Ack),
}

/// JSON error body returned by the control and stream surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error details.
    pub error: ErrorDetail,
}

/// Machine-readable error kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error kind, e.g. `admission_limit` or `session_not_found`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl ErrorBody {
    /// Builds an error body from a kind and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }
}

/// Daemon health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Always true when the daemon answers.
    pub healthy: bool,
    /// Daemon version.
    pub version: String,
    /// Number of registered sessions.
    pub sessions: usize,
    /// Number of sessions whose shell is alive.
    pub alive: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        assert_eq!(
            serde_json::to_value(Event::status(true)).unwrap(),
            json!({"type": "status", "alive": true})
        );
        assert_eq!(
            serde_json::to_value(Event::output("hi\r\n")).unwrap(),
            json!({"type": "output", "text": "hi\r\n"})
        );
        assert_eq!(
            serde_json::to_value(Event::Ping).unwrap(),
            json!({"type": "ping"})
        );
    }

    #[test]
    fn test_ping_is_not_replayable() {
        assert!(!Event::Ping.is_replayable());
        assert!(Event::status(false).is_replayable());
        assert!(Event::output("x").is_replayable());
    }

    #[test]
    fn test_control_request_parsing() {
        let req: ControlRequest = serde_json::from_value(json!({
            "action": "input",
            "session": "abc",
            "data": "echo hi\n"
        }))
        .unwrap();
        assert_eq!(
            req,
            ControlRequest::Input {
                session: "abc".to_string(),
                data: "echo hi\n".to_string()
            }
        );

        let req: ControlRequest = serde_json::from_value(json!({"action": "create"})).unwrap();
        assert_eq!(req, ControlRequest::Create);
        assert_eq!(req.action(), "create");
    }

    #[test]
    fn test_resize_accepts_fractional_numbers_for_later_validation() {
        let req: ControlRequest = serde_json::from_value(json!({
            "action": "resize",
            "session": "abc",
            "cols": 80.5,
            "rows": 24
        }))
        .unwrap();
        match req {
            ControlRequest::Resize { cols, rows, .. } => {
                assert_eq!(cols, 80.5);
                assert_eq!(rows, 24.0);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result = serde_json::from_value::<ControlRequest>(json!({"action": "reboot"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let result = serde_json::from_value::<ControlRequest>(json!({"action": "kill"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_response_shapes() {
        let created = ControlResponse::Created(SessionCreated {
            session_id: "s1".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&created).unwrap(),
            json!({"sessionId": "s1"})
        );

        let list = ControlResponse::Sessions(vec![SessionSummary {
            id: "s1".to_string(),
            alive: true,
            created_at: 1_700_000_000_000,
            age_seconds: 12,
        }]);
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            json!([{"id": "s1", "alive": true, "createdAt": 1_700_000_000_000u64, "ageSeconds": 12}])
        );

        assert_eq!(
            serde_json::to_value(ControlResponse::Ack(Ack::default())).unwrap(),
            json!({"ok": true})
        );
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::new("session_not_found", "session not found: s9");
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"error": {"type": "session_not_found", "message": "session not found: s9"}})
        );
    }
}
