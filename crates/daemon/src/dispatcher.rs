//! Control command dispatcher.
//!
//! Validates `create` / `input` / `resize` / `kill` / `list` requests and
//! applies them to the session registry.

use std::sync::Arc;

use protocol::{Ack, ControlRequest, ControlResponse, ErrorBody, SessionCreated};
use tracing::{debug, info};

use crate::session::{SessionError, SessionRegistry};

/// Smallest accepted terminal dimension.
pub const MIN_DIMENSION: u16 = 2;

/// Errors returned by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Session-related error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Malformed request or out-of-range argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DispatchError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Session(e) => match e {
                SessionError::AdmissionLimit { .. } => "admission_limit",
                SessionError::NotFound(_) => "session_not_found",
                SessionError::NotAlive(_) => "session_not_alive",
                SessionError::SpawnFailed(_)
                | SessionError::WriteFailed(_)
                | SessionError::ResizeFailed(_)
                | SessionError::KillFailed(_)
                | SessionError::Io(_) => "process_error",
            },
            DispatchError::InvalidArgument(_) => "invalid_argument",
        }
    }

    /// Converts the error into the JSON error body.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.kind(), self.to_string())
    }
}

/// Applies control requests to a [`SessionRegistry`].
pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
}

impl CommandDispatcher {
    /// Creates a dispatcher over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Parses and dispatches a raw JSON request body.
    pub async fn dispatch_json(&self, body: &[u8]) -> Result<ControlResponse, DispatchError> {
        let request: ControlRequest = serde_json::from_slice(body)
            .map_err(|e| DispatchError::InvalidArgument(format!("malformed request: {}", e)))?;
        self.dispatch(request).await
    }

    /// Dispatches one request.
    pub async fn dispatch(&self, request: ControlRequest) -> Result<ControlResponse, DispatchError> {
        debug!(action = request.action(), "Dispatching control request");

        match request {
            ControlRequest::List => Ok(ControlResponse::Sessions(self.registry.list())),
            ControlRequest::Create => self.handle_create().await,
            ControlRequest::Input { session, data } => self.handle_input(&session, &data).await,
            ControlRequest::Resize {
                session,
                cols,
                rows,
            } => self.handle_resize(&session, cols, rows).await,
            ControlRequest::Kill { session } => self.handle_kill(&session).await,
        }
    }

    async fn handle_create(&self) -> Result<ControlResponse, DispatchError> {
        let session_id = self.registry.create().await?;
        info!(session_id = %session_id, "Created session");
        Ok(ControlResponse::Created(SessionCreated { session_id }))
    }

    async fn handle_input(&self, session_id: &str, data: &str) -> Result<ControlResponse, DispatchError> {
        let session = self.registry.get(session_id)?;
        session.write(data.as_bytes()).await?;
        Ok(ControlResponse::Ack(Ack::default()))
    }

    async fn handle_resize(
        &self,
        session_id: &str,
        cols: f64,
        rows: f64,
    ) -> Result<ControlResponse, DispatchError> {
        let session = self.registry.get(session_id)?;
        if !session.is_alive() {
            return Err(SessionError::NotAlive(session_id.to_string()).into());
        }

        let cols = validate_dimension("cols", cols)?;
        let rows = validate_dimension("rows", rows)?;

        session.resize(cols, rows).await?;
        Ok(ControlResponse::Ack(Ack::default()))
    }

    async fn handle_kill(&self, session_id: &str) -> Result<ControlResponse, DispatchError> {
        if self.registry.remove(session_id).await {
            info!(session_id = %session_id, "Killed session");
        } else {
            debug!(session_id = %session_id, "Kill for unknown session");
        }
        Ok(ControlResponse::Ack(Ack::default()))
    }
}

/// Checks that a terminal dimension is a whole number in `2..=65535`.
pub fn validate_dimension(name: &str, value: f64) -> Result<u16, DispatchError> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(DispatchError::InvalidArgument(format!(
            "{} must be an integer, got {}",
            name, value
        )));
    }
    if value < f64::from(MIN_DIMENSION) || value > f64::from(u16::MAX) {
        return Err(DispatchError::InvalidArgument(format!(
            "{} must be between {} and {}, got {}",
            name,
            MIN_DIMENSION,
            u16::MAX,
            value
        )));
    }
    Ok(value as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeBridge;
    use crate::session::SpawnDefaults;
    use protocol::Event;

    fn dispatcher() -> (Arc<FakeBridge>, CommandDispatcher) {
        let bridge = Arc::new(FakeBridge::new());
        let mut defaults = SpawnDefaults::new("/bin/fake", "/tmp");
        defaults.base_env = Some(Vec::new());
        let registry = Arc::new(SessionRegistry::new(bridge.clone(), defaults));
        (bridge, CommandDispatcher::new(registry))
    }

    async fn create(dispatcher: &CommandDispatcher) -> String {
        match dispatcher.dispatch(ControlRequest::Create).await.unwrap() {
            ControlResponse::Created(created) => created.session_id,
            other => panic!("unexpected response: {:?}", other),
        }
    }

    fn resize(session: &str, cols: f64, rows: f64) -> ControlRequest {
        ControlRequest::Resize {
            session: session.to_string(),
            cols,
            rows,
        }
    }

    #[test]
    fn test_validate_dimension() {
        assert_eq!(validate_dimension("cols", 80.0).unwrap(), 80);
        assert_eq!(validate_dimension("cols", 2.0).unwrap(), 2);
        assert_eq!(validate_dimension("cols", 65535.0).unwrap(), 65535);

        for bad in [1.0, 0.0, -5.0, 80.5, 65536.0, f64::NAN, f64::INFINITY] {
            assert!(
                matches!(
                    validate_dimension("cols", bad),
                    Err(DispatchError::InvalidArgument(_))
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (_bridge, dispatcher) = dispatcher();
        let id = create(&dispatcher).await;

        match dispatcher.dispatch(ControlRequest::List).await.unwrap() {
            ControlResponse::Sessions(sessions) => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].id, id);
                assert!(sessions[0].alive);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_third_create_hits_admission_limit() {
        let (_bridge, dispatcher) = dispatcher();
        create(&dispatcher).await;
        create(&dispatcher).await;

        let err = dispatcher.dispatch(ControlRequest::Create).await.unwrap_err();
        assert_eq!(err.kind(), "admission_limit");
        assert!(err.to_string().contains("kill an existing session"));
    }

    #[tokio::test]
    async fn test_input_reaches_shell() {
        let (bridge, dispatcher) = dispatcher();
        let id = create(&dispatcher).await;

        let response = dispatcher
            .dispatch(ControlRequest::Input {
                session: id,
                data: "echo hi\n".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(response, ControlResponse::Ack(Ack::default()));
        assert_eq!(bridge.last_handle().unwrap().written(), b"echo hi\n".to_vec());
    }

    #[tokio::test]
    async fn test_input_to_missing_session() {
        let (_bridge, dispatcher) = dispatcher();
        let err = dispatcher
            .dispatch(ControlRequest::Input {
                session: "nope".to_string(),
                data: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_not_found");
    }

    #[tokio::test]
    async fn test_input_to_dead_session() {
        let (bridge, dispatcher) = dispatcher();
        let id = create(&dispatcher).await;
        let session = dispatcher.registry().get(&id).unwrap();

        let mut attachment = session.attach();
        bridge.last_handle().unwrap().exit(Some(0)).await;
        while attachment.receiver.recv().await != Some(Event::status(false)) {}

        let err = dispatcher
            .dispatch(ControlRequest::Input {
                session: id,
                data: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_not_alive");
        assert!(bridge.last_handle().unwrap().written().is_empty());
    }

    #[tokio::test]
    async fn test_resize_validation() {
        let (bridge, dispatcher) = dispatcher();
        let id = create(&dispatcher).await;

        let err = dispatcher.dispatch(resize(&id, 1.0, 24.0)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let err = dispatcher.dispatch(resize(&id, 80.0, 24.5)).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        assert!(bridge.last_handle().unwrap().last_resize().is_none());

        dispatcher.dispatch(resize(&id, 100.0, 30.0)).await.unwrap();
        assert_eq!(bridge.last_handle().unwrap().last_resize(), Some((100, 30)));
    }

    #[tokio::test]
    async fn test_resize_missing_session() {
        let (_bridge, dispatcher) = dispatcher();
        let err = dispatcher.dispatch(resize("nope", 80.0, 24.0)).await.unwrap_err();
        assert_eq!(err.kind(), "session_not_found");
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (_bridge, dispatcher) = dispatcher();
        let id = create(&dispatcher).await;

        for _ in 0..2 {
            let response = dispatcher
                .dispatch(ControlRequest::Kill {
                    session: id.clone(),
                })
                .await
                .unwrap();
            assert_eq!(response, ControlResponse::Ack(Ack::default()));
        }

        let response = dispatcher
            .dispatch(ControlRequest::Kill {
                session: "never-existed".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response, ControlResponse::Ack(Ack::default()));
        assert_eq!(dispatcher.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_json() {
        let (_bridge, dispatcher) = dispatcher();

        let response = dispatcher.dispatch_json(br#"{"action":"list"}"#).await.unwrap();
        assert_eq!(response, ControlResponse::Sessions(Vec::new()));

        let err = dispatcher.dispatch_json(br#"{"action":"reboot"}"#).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let err = dispatcher.dispatch_json(b"not json").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_process_error() {
        let bridge = Arc::new(FakeBridge::failing());
        let registry = Arc::new(SessionRegistry::new(bridge, SpawnDefaults::new("/bin/fake", "/tmp")));
        let dispatcher = CommandDispatcher::new(registry);

        let err = dispatcher.dispatch(ControlRequest::Create).await.unwrap_err();
        assert_eq!(err.kind(), "process_error");
        assert_eq!(err.to_error_body().error.kind, "process_error");
    }
}
