//! Access control for the terminal surfaces.
//!
//! Every terminal request passes through an [`AccessGate`] before it reaches
//! the dispatcher or the stream endpoint. The daemon ships two gates: one
//! that admits everything (for deployments behind an authenticating proxy)
//! and one that checks a shared bearer token.

use axum::http::{header, HeaderMap};

/// Query parameter carrying the token for clients that cannot set headers.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Decides whether a request may use the terminal surfaces.
pub trait AccessGate: Send + Sync {
    /// Returns true if the request is authorized.
    fn is_authorized(&self, headers: &HeaderMap, query: Option<&str>) -> bool;
}

/// Admits every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl AccessGate for OpenGate {
    fn is_authorized(&self, _headers: &HeaderMap, _query: Option<&str>) -> bool {
        true
    }
}

/// Admits requests carrying a shared token, either as
/// `Authorization: Bearer <token>` or as `?token=<token>`.
#[derive(Clone)]
pub struct TokenGate {
    token: String,
}

impl std::fmt::Debug for TokenGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGate").finish_non_exhaustive()
    }
}

impl TokenGate {
    /// Creates a gate for `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.token.as_bytes(), candidate.as_bytes())
    }
}

impl AccessGate for TokenGate {
    fn is_authorized(&self, headers: &HeaderMap, query: Option<&str>) -> bool {
        let from_header = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);

        if let Some(candidate) = from_header {
            return self.matches(candidate);
        }

        query
            .and_then(token_from_query)
            .is_some_and(|candidate| self.matches(&candidate))
    }
}

/// Finds the token parameter in a form-encoded query string.
fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != TOKEN_QUERY_PARAM {
            return None;
        }
        urlencoding::decode(&value.replace('+', " "))
            .ok()
            .map(|decoded| decoded.into_owned())
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_open_gate_admits_everything() {
        assert!(OpenGate.is_authorized(&HeaderMap::new(), None));
    }

    #[test]
    fn test_token_gate_header() {
        let gate = TokenGate::new("s3cret");
        assert!(gate.is_authorized(&bearer("s3cret"), None));
        assert!(!gate.is_authorized(&bearer("wrong"), None));
        assert!(!gate.is_authorized(&HeaderMap::new(), None));
    }

    #[test]
    fn test_token_gate_query() {
        let gate = TokenGate::new("s3cret");
        assert!(gate.is_authorized(&HeaderMap::new(), Some("session=abc&token=s3cret")));
        assert!(!gate.is_authorized(&HeaderMap::new(), Some("session=abc&token=nope")));
        assert!(!gate.is_authorized(&HeaderMap::new(), Some("session=abc")));
    }

    #[test]
    fn test_token_gate_query_is_percent_decoded() {
        let gate = TokenGate::new("a+b/c=d&e%f g");
        let query = "session=abc&token=a%2Bb%2Fc%3Dd%26e%25f+g";
        assert!(gate.is_authorized(&HeaderMap::new(), Some(query)));
        assert!(!gate.is_authorized(&HeaderMap::new(), Some("token=a+b/c=d&e%f g")));
        assert!(!gate.is_authorized(&HeaderMap::new(), Some("token=%zz")));
    }

    #[test]
    fn test_header_takes_precedence_over_query() {
        let gate = TokenGate::new("s3cret");
        assert!(!gate.is_authorized(&bearer("wrong"), Some("token=s3cret")));
    }

    #[test]
    fn test_debug_hides_token() {
        let gate = TokenGate::new("s3cret");
        assert!(!format!("{:?}", gate).contains("s3cret"));
    }
}
