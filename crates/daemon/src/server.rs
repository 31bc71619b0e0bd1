//! HTTP surface.
//!
//! - `GET  /api/terminal` lists sessions
//! - `POST /api/terminal` takes a JSON control request tagged by `action`
//! - `GET  /api/terminal/stream?session=<id>` streams one session's events
//! - `GET  /api/health` reports liveness and session counts
//!
//! The terminal routes sit behind the configured [`AccessGate`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use protocol::{ControlResponse, ErrorBody, HealthStatus, SessionSummary};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::access::AccessGate;
use crate::dispatcher::{CommandDispatcher, DispatchError};
use crate::session::SessionError;
use crate::stream::event_stream;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<CommandDispatcher>,
    pub gate: Arc<dyn AccessGate>,
    pub heartbeat: Duration,
}

/// Errors rendered as `{"error": {"type", "message"}}` bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("missing or invalid access token")]
    Unauthorized,
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        ApiError::Dispatch(e.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Dispatch(e) => match e.kind() {
                "admission_limit" => StatusCode::TOO_MANY_REQUESTS,
                "session_not_found" => StatusCode::NOT_FOUND,
                "session_not_alive" => StatusCode::CONFLICT,
                "invalid_argument" => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Dispatch(e) => e.to_error_body(),
            ApiError::Unauthorized => ErrorBody::new("unauthorized", self.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(self.body())).into_response()
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    let terminal = Router::new()
        .route("/api/terminal", get(list_sessions).post(control))
        .route("/api/terminal/stream", get(stream_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_access));

    Router::new()
        .merge(terminal)
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the router on `listener` until `shutdown` fires and every open
/// stream has finished.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("HTTP server shutting down");
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn require_access(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.gate.is_authorized(request.headers(), request.uri().query()) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejected unauthorized request");
        ApiError::Unauthorized.into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    let registry = state.dispatcher.registry();
    Json(HealthStatus {
        healthy: true,
        version: VERSION.to_string(),
        sessions: registry.count(),
        alive: registry.alive_count(),
    })
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.dispatcher.registry().list())
}

async fn control(State(state): State<AppState>, body: Bytes) -> Result<Json<ControlResponse>, ApiError> {
    let response = state.dispatcher.dispatch_json(&body).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    session: Option<String>,
}

async fn stream_session(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let id = query.session.unwrap_or_default();
    let session = state.dispatcher.registry().get(&id)?;

    let frames = event_stream(&session, state.heartbeat)
        .map(|event| SseEvent::default().json_data(event));

    // Heartbeats are `ping` events on the stream itself, so no keep-alive comments.
    Ok(([("x-accel-buffering", "no")], Sse::new(frames)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{OpenGate, TokenGate};
    use crate::session::testing::FakeBridge;
    use crate::session::{SessionRegistry, SpawnDefaults};
    use crate::stream::DEFAULT_HEARTBEAT;
    use protocol::{Event, FrameDecoder};
    use serde_json::{json, Value};
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    fn app_with_gate(gate: Arc<dyn AccessGate>) -> Router {
        let bridge = Arc::new(FakeBridge::new());
        let mut defaults = SpawnDefaults::new("/bin/fake", "/tmp");
        defaults.base_env = Some(Vec::new());
        let registry = Arc::new(SessionRegistry::new(bridge, defaults));

        router(AppState {
            dispatcher: Arc::new(CommandDispatcher::new(registry)),
            gate,
            heartbeat: DEFAULT_HEARTBEAT,
        })
    }

    fn app() -> Router {
        app_with_gate(Arc::new(OpenGate))
    }

    fn post(body: Value) -> Request<Body> {
        Request::post("/api/terminal")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(app: &Router) -> String {
        let response = app.clone().oneshot(post(json!({"action": "create"}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await["sessionId"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        create(&app).await;

        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["healthy"], json!(true));
        assert_eq!(body["sessions"], json!(1));
        assert_eq!(body["alive"], json!(1));
    }

    #[tokio::test]
    async fn test_create_then_admission_limit() {
        let app = app();
        create(&app).await;
        create(&app).await;

        let response = app.oneshot(post(json!({"action": "create"}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(response).await["error"]["type"], json!("admission_limit"));
    }

    #[tokio::test]
    async fn test_list_shapes() {
        let app = app();
        let id = create(&app).await;

        let response = app
            .clone()
            .oneshot(Request::get("/api/terminal").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body[0]["id"], json!(id));
        assert_eq!(body[0]["alive"], json!(true));
        assert!(body[0]["createdAt"].is_u64());
        assert!(body[0]["ageSeconds"].is_u64());

        let response = app.oneshot(post(json!({"action": "list"}))).await.unwrap();
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = app();
        let id = create(&app).await;

        let cases = [
            (json!({"action": "input", "session": "nope", "data": "x"}), StatusCode::NOT_FOUND),
            (json!({"action": "resize", "session": &id, "cols": 80.5, "rows": 24}), StatusCode::BAD_REQUEST),
            (json!({"action": "resize", "session": &id, "cols": 1, "rows": 24}), StatusCode::BAD_REQUEST),
            (json!({"action": "explode"}), StatusCode::BAD_REQUEST),
            (json!({"session": &id}), StatusCode::BAD_REQUEST),
        ];

        for (body, expected) in cases {
            let response = app.clone().oneshot(post(body.clone())).await.unwrap();
            assert_eq!(response.status(), expected, "request {}", body);
        }
    }

    #[tokio::test]
    async fn test_input_and_kill_ack() {
        let app = app();
        let id = create(&app).await;

        let response = app
            .clone()
            .oneshot(post(json!({"action": "input", "session": &id, "data": "ls\n"})))
            .await
            .unwrap();
        assert_eq!(json_body(response).await, json!({"ok": true}));

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post(json!({"action": "kill", "session": &id})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(json_body(response).await, json!({"ok": true}));
        }

        let response = app
            .oneshot(post(json!({"action": "input", "session": &id, "data": "ls\n"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_unknown_session_is_not_found() {
        let app = app();

        for uri in ["/api/terminal/stream?session=nope", "/api/terminal/stream"] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(json_body(response).await["error"]["type"], json!("session_not_found"));
        }
    }

    #[tokio::test]
    async fn test_stream_starts_with_status_frame() {
        let app = app();
        let id = create(&app).await;

        let response = app
            .oneshot(
                Request::get(format!("/api/terminal/stream?session={}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        let mut body = response.into_body().into_data_stream();
        let mut decoder = FrameDecoder::new();
        let event = loop {
            if let Some(event) = decoder.next_event().unwrap() {
                break event;
            }
            let chunk = body.next().await.unwrap().unwrap();
            decoder.push(&chunk).unwrap();
        };
        assert_eq!(event, Event::status(true));
    }

    #[tokio::test]
    async fn test_token_gate_protects_terminal_routes() {
        let app = app_with_gate(Arc::new(TokenGate::new("s3cret")));

        let response = app
            .clone()
            .oneshot(Request::get("/api/terminal").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["type"], json!("unauthorized"));

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/terminal")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
