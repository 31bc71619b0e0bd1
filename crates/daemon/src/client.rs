//! HTTP client for a running daemon.
//!
//! Used by the CLI subcommands that inspect or drive sessions on a daemon
//! started elsewhere.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use protocol::{
    Ack, ControlRequest, ErrorBody, Event, FrameDecoder, HealthStatus, ProtocolError,
    SessionCreated, SessionSummary,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::config::Config;

/// Timeout applied to request/response calls. Streams are not bounded.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors returned by [`ControlClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The daemon answered with an error body.
    #[error("daemon returned {status}: {}", .body.error.message)]
    Api { status: StatusCode, body: ErrorBody },

    /// The daemon answered with an unexpected status and no error body.
    #[error("daemon returned {0}")]
    Status(StatusCode),

    /// The push stream could not be decoded.
    #[error("stream decode error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// Error kind from the daemon's error body, if there was one.
    pub fn kind(&self) -> Option<&str> {
        match self {
            ClientError::Api { body, .. } => Some(&body.error.kind),
            _ => None,
        }
    }
}

/// Client for the daemon's control and stream surfaces.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ControlClient {
    /// Creates a client for `base_url`, e.g. `http://127.0.0.1:7681`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Sends `token` as a bearer token on every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Creates a client for the daemon described by `config`.
    ///
    /// A wildcard bind address is reached through loopback.
    pub fn from_config(config: &Config) -> Result<Self, crate::config::ConfigError> {
        let client = Self::new(format!("http://{}", connect_addr(config.bind_addr()?)));
        Ok(match &config.server.access_token {
            Some(token) => client.with_token(token.clone()),
            None => client,
        })
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Fetches the health snapshot.
    pub async fn health(&self) -> Result<HealthStatus, ClientError> {
        let response = self
            .request(Method::GET, "/api/health")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        decode(response).await
    }

    /// Lists every registered session.
    pub async fn list(&self) -> Result<Vec<SessionSummary>, ClientError> {
        let response = self
            .request(Method::GET, "/api/terminal")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        decode(response).await
    }

    /// Spawns a new shell session and returns its id.
    pub async fn create(&self) -> Result<String, ClientError> {
        let created: SessionCreated = self.control(&ControlRequest::Create).await?;
        Ok(created.session_id)
    }

    /// Writes `data` to a session.
    pub async fn input(&self, session: &str, data: &str) -> Result<(), ClientError> {
        let _: Ack = self
            .control(&ControlRequest::Input {
                session: session.to_string(),
                data: data.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Resizes a session's terminal.
    pub async fn resize(&self, session: &str, cols: u16, rows: u16) -> Result<(), ClientError> {
        let _: Ack = self
            .control(&ControlRequest::Resize {
                session: session.to_string(),
                cols: f64::from(cols),
                rows: f64::from(rows),
            })
            .await?;
        Ok(())
    }

    /// Terminates and removes a session. Unknown ids succeed.
    pub async fn kill(&self, session: &str) -> Result<(), ClientError> {
        let _: Ack = self
            .control(&ControlRequest::Kill {
                session: session.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn control<T: DeserializeOwned>(&self, request: &ControlRequest) -> Result<T, ClientError> {
        let response = self
            .request(Method::POST, "/api/terminal")
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    /// Follows a session's push stream.
    ///
    /// The replay arrives first, then live events. The stream ends when the
    /// daemon closes the connection; an unknown session surfaces as the first
    /// (and only) item.
    pub fn attach(&self, session: &str) -> impl Stream<Item = Result<Event, ClientError>> + Send + 'static {
        let request = self
            .request(Method::GET, "/api/terminal/stream")
            .query(&[("session", session)]);

        try_stream! {
            let response = check(request.send().await?).await?;
            let mut chunks = Box::pin(response.bytes_stream());
            let mut decoder = FrameDecoder::new();

            while let Some(chunk) = chunks.next().await {
                decoder.push(&chunk?)?;
                while let Some(event) = decoder.next_event()? {
                    yield event;
                }
            }
        }
    }
}

fn connect_addr(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ErrorBody>().await {
        Ok(body) => Err(ClientError::Api { status, body }),
        Err(_) => Err(ClientError::Status(status)),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    Ok(check(response).await?.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = ControlClient::new("http://127.0.0.1:7681/");
        assert_eq!(client.base_url(), "http://127.0.0.1:7681");
    }

    #[test]
    fn test_from_config_uses_loopback_for_wildcard() {
        let mut config = Config::default();
        config.server.bind_addr = "0.0.0.0:9000".to_string();
        config.server.access_token = Some("s3cret".to_string());

        let client = ControlClient::from_config(&config).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9000");
        assert_eq!(client.token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_from_config_rejects_bad_addr() {
        let mut config = Config::default();
        config.server.bind_addr = "nowhere".to_string();
        assert!(ControlClient::from_config(&config).is_err());
    }

    #[test]
    fn test_error_kind() {
        let err = ClientError::Api {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: ErrorBody::new("admission_limit", "too many"),
        };
        assert_eq!(err.kind(), Some("admission_limit"));
        assert!(err.to_string().contains("too many"));
        assert_eq!(ClientError::Status(StatusCode::BAD_GATEWAY).kind(), None);
    }
}
